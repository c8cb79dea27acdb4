//! Query model: maps a `QueryResults` (raw rows from a `DatabaseWorker`) to
//! the `MetricResult`s the executor applies to the registry.

use shared::config::{MetricConfig, MetricType, QueryMetric};
use shared::model::{MetricResult, QueryResults};
use shared::{ExporterError, Result};
use std::collections::{HashMap, HashSet};

/// The outcome of mapping one query's raw results to metric updates.
pub struct MappedResults {
    pub metrics: Vec<MetricResult>,
    /// Set when at least one row produced a non-coercible value for some
    /// metric. Valid rows are still included in `metrics`; the caller
    /// reports this as a soft `invalid-value` outcome, not a fatal error.
    pub had_invalid_value: bool,
}

/// Map a query's raw result set to metric updates, per the declared
/// `QueryMetric`s. Returns a fatal [`ExporterError::Query`] when the result
/// shape doesn't match what the query declares (wrong column names, wrong
/// result arity) — these are static mismatches that will never resolve on
/// retry.
pub fn map_results(
    query_name: &str,
    database: &str,
    metrics: &[QueryMetric],
    metric_configs: &HashMap<String, MetricConfig>,
    raw: &QueryResults,
) -> Result<MappedResults> {
    if raw.rows.is_empty() {
        return Ok(MappedResults {
            metrics: Vec::new(),
            had_invalid_value: false,
        });
    }

    let metric_names: HashSet<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
    let declared_labels: HashSet<&str> = metrics
        .iter()
        .flat_map(|m| m.labels.iter().map(String::as_str))
        .collect();
    let non_metric_columns: HashSet<&str> = raw
        .column_names
        .iter()
        .map(String::as_str)
        .filter(|c| !metric_names.contains(c))
        .collect();

    if non_metric_columns != declared_labels {
        return Err(fatal(
            query_name,
            database,
            format!(
                "wrong column names: expected label columns {declared_labels:?}, result has {non_metric_columns:?}"
            ),
        ));
    }

    if metrics.iter().any(|m| m.labels.is_empty()) {
        let expected_arity = metric_names.len() + declared_labels.len();
        if raw.column_names.len() != expected_arity {
            return Err(fatal(
                query_name,
                database,
                format!(
                    "wrong result count: expected {expected_arity} columns, got {}",
                    raw.column_names.len()
                ),
            ));
        }
    }

    for m in metrics {
        if raw.column_index(&m.name).is_none() {
            return Err(fatal(
                query_name,
                database,
                format!("declared metric column '{}' missing from result", m.name),
            ));
        }
        for l in &m.labels {
            if raw.column_index(l).is_none() {
                return Err(fatal(
                    query_name,
                    database,
                    format!("declared label column '{l}' missing from result"),
                ));
            }
        }
    }

    let mut results = Vec::with_capacity(raw.rows.len() * metrics.len());
    let mut had_invalid_value = false;

    for row in &raw.rows {
        for m in metrics {
            let value_idx = raw.column_index(&m.name).expect("checked above");
            let cell = &row[value_idx];

            let is_enum = metric_configs
                .get(&m.name)
                .map(|c| c.metric_type == MetricType::Enum)
                .unwrap_or(false);

            // Enum metrics carry a state name rather than a coercible
            // number; encode it as that state's index into its declared
            // `states` list, which the registry adapter decodes back.
            let value = if is_enum {
                let states = metric_configs
                    .get(&m.name)
                    .and_then(|c| c.states.as_ref());
                let state_name = cell.to_label_string();
                match states.and_then(|s| s.iter().position(|s| s == &state_name)) {
                    Some(idx) => idx as f64,
                    None => {
                        had_invalid_value = true;
                        continue;
                    }
                }
            } else {
                match cell.to_f64() {
                    Ok(v) => v,
                    Err(_) => {
                        had_invalid_value = true;
                        continue;
                    }
                }
            };

            let mut labels: Vec<(String, String)> = m
                .labels
                .iter()
                .map(|l| {
                    let idx = raw.column_index(l).expect("checked above");
                    (l.clone(), row[idx].to_label_string())
                })
                .collect();
            labels.sort_by(|a, b| a.0.cmp(&b.0));

            results.push(MetricResult {
                metric_name: m.name.clone(),
                value,
                labels,
            });
        }
    }

    Ok(MappedResults {
        metrics: results,
        had_invalid_value,
    })
}

fn fatal(query: &str, database: &str, message: String) -> anyhow::Error {
    ExporterError::Query {
        query: query.to_string(),
        database: database.to_string(),
        message,
        fatal: true,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::model::Value;
    use std::time::Duration;

    fn results(columns: &[&str], rows: Vec<Vec<Value>>) -> QueryResults {
        QueryResults {
            column_names: columns.iter().map(|s| s.to_string()).collect(),
            rows,
            timestamp: chrono::Utc::now(),
            latency: Duration::default(),
        }
    }

    #[test]
    fn basic_gauge_with_one_label() {
        let metrics = vec![QueryMetric {
            name: "m".to_string(),
            labels: vec!["l".to_string()],
        }];
        let raw = results(
            &["m", "l"],
            vec![
                vec![Value::Int(1), Value::Text("foo".into())],
                vec![Value::Int(2), Value::Text("bar".into())],
            ],
        );
        let mapped = map_results("q", "db", &metrics, &HashMap::new(), &raw).unwrap();
        assert!(!mapped.had_invalid_value);
        assert_eq!(mapped.metrics.len(), 2);
        assert_eq!(mapped.metrics[0].value, 1.0);
        assert_eq!(mapped.metrics[0].labels, vec![("l".to_string(), "foo".to_string())]);
    }

    #[test]
    fn multiple_metrics_per_row() {
        let metrics = vec![
            QueryMetric {
                name: "m1".to_string(),
                labels: vec!["l1".to_string(), "l2".to_string()],
            },
            QueryMetric {
                name: "m2".to_string(),
                labels: vec!["l1".to_string(), "l3".to_string()],
            },
        ];
        let raw = results(
            &["m1", "m2", "l1", "l2", "l3"],
            vec![vec![
                Value::Int(10),
                Value::Int(20),
                Value::Text("a".into()),
                Value::Text("b".into()),
                Value::Text("c".into()),
            ]],
        );
        let mapped = map_results("q", "db", &metrics, &HashMap::new(), &raw).unwrap();
        assert_eq!(mapped.metrics.len(), 2);
        assert_eq!(mapped.metrics[0].metric_name, "m1");
        assert_eq!(
            mapped.metrics[0].labels,
            vec![("l1".to_string(), "a".to_string()), ("l2".to_string(), "b".to_string())]
        );
        assert_eq!(mapped.metrics[1].metric_name, "m2");
        assert_eq!(
            mapped.metrics[1].labels,
            vec![("l1".to_string(), "a".to_string()), ("l3".to_string(), "c".to_string())]
        );
    }

    #[test]
    fn fatal_on_wrong_column_count() {
        let metrics = vec![QueryMetric {
            name: "m".to_string(),
            labels: vec![],
        }];
        let raw = results(
            &["m", "extra"],
            vec![vec![Value::Int(1), Value::Int(2)]],
        );
        let err = map_results("q", "db", &metrics, &HashMap::new(), &raw).unwrap_err();
        let exporter_err = err.downcast_ref::<ExporterError>().unwrap();
        assert!(exporter_err.is_fatal());
    }

    #[test]
    fn non_coercible_value_is_soft_invalid() {
        let metrics = vec![QueryMetric {
            name: "m".to_string(),
            labels: vec![],
        }];
        let raw = results(&["m"], vec![vec![Value::Text("not-a-number".into())]]);
        let mapped = map_results("q", "db", &metrics, &HashMap::new(), &raw).unwrap();
        assert!(mapped.had_invalid_value);
        assert!(mapped.metrics.is_empty());
    }

    #[test]
    fn null_value_coerces_to_zero() {
        let metrics = vec![QueryMetric {
            name: "m".to_string(),
            labels: vec![],
        }];
        let raw = results(&["m"], vec![vec![Value::Null]]);
        let mapped = map_results("q", "db", &metrics, &HashMap::new(), &raw).unwrap();
        assert_eq!(mapped.metrics[0].value, 0.0);
    }
}
