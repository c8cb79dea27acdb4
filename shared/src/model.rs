//! The scalar value model used to carry database row values through to
//! metric updates.
//!
//! `Value` is the tagged-value sum type called for in the design notes in
//! place of a dynamically typed scalar: every database driver result cell
//! is converted to one of these variants before it reaches the query model,
//! and [`Value::to_f64`] is the single coercion function used everywhere a
//! metric update needs a double.

use std::fmt;

/// A single database result cell, tagged by its runtime type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Null,
}

impl Value {
    /// Coerce to a double-precision value.
    ///
    /// Accepts numeric values, numeric strings (including arbitrary-precision
    /// decimals, parsed with `f64::parse` — full decimal precision is not
    /// preserved, matching the precision of every other numeric path in this
    /// exporter), and `NULL` (which becomes `0.0`). Anything else is an error.
    pub fn to_f64(&self) -> Result<f64, ValueError> {
        match self {
            Value::Int(i) => Ok(*i as f64),
            Value::Float(f) => Ok(*f),
            Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
            Value::Null => Ok(0.0),
            Value::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ValueError::NotCoercible(s.clone())),
        }
    }

    /// Render the value as it would be read back from a label column.
    pub fn to_label_string(&self) -> String {
        match self {
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_label_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValueError {
    #[error("value '{0}' cannot be coerced to a number")]
    NotCoercible(String),
}

/// The raw result of executing a query: column order, rows of scalars, and
/// the timing the database worker observed.
#[derive(Debug, Clone)]
pub struct QueryResults {
    pub column_names: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub latency: std::time::Duration,
}

impl QueryResults {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_names.iter().position(|c| c == name)
    }
}

/// A single metric update produced from one result row: the metric name,
/// the coerced numeric value, and the label-name to label-value map (with
/// labels in sorted-by-name order for downstream determinism).
#[derive(Debug, Clone, PartialEq)]
pub struct MetricResult {
    pub metric_name: String,
    pub value: f64,
    /// Sorted by label name.
    pub labels: Vec<(String, String)>,
}

impl MetricResult {
    /// The label values only, in the same sorted-by-name order as `labels` —
    /// this is exactly the tuple the Last-Seen Tracker keys its series on.
    pub fn label_values(&self) -> Vec<String> {
        self.labels.iter().map(|(_, v)| v.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_string_coerces() {
        assert_eq!(Value::Text("3.14".into()).to_f64().unwrap(), 3.14);
        assert_eq!(Value::Text(" 42 ".into()).to_f64().unwrap(), 42.0);
    }

    #[test]
    fn null_coerces_to_zero() {
        assert_eq!(Value::Null.to_f64().unwrap(), 0.0);
    }

    #[test]
    fn non_numeric_text_is_an_error() {
        assert!(Value::Text("not-a-number".into()).to_f64().is_err());
    }

    #[test]
    fn bool_coerces_to_zero_or_one() {
        assert_eq!(Value::Bool(true).to_f64().unwrap(), 1.0);
        assert_eq!(Value::Bool(false).to_f64().unwrap(), 0.0);
    }
}
