//! Per-database worker: a dedicated tokio task owning that database's
//! connection(s) and an mpsc job queue that the executor submits query
//! executions to. One worker exists per configured database for the
//! lifetime of the process.

use rsql_drivers::DriverManager;
use shared::config::DatabaseConfig;
use shared::model::{QueryResults, Value};
use shared::{ExporterError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;

struct Job {
    query_name: String,
    sql: String,
    params: HashMap<String, serde_yaml::Value>,
    timeout: Duration,
    reply: oneshot::Sender<Result<QueryResults>>,
}

/// Handle to a running per-database worker task.
pub struct DatabaseWorker {
    name: String,
    sender: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

impl DatabaseWorker {
    /// Spawn the worker task. Connections are opened lazily, on first use.
    pub fn spawn(name: String, config: DatabaseConfig) -> Self {
        let (sender, receiver) = mpsc::channel(64);
        let handle = tokio::spawn(run(name.clone(), config, receiver));
        Self {
            name,
            sender,
            handle,
        }
    }

    /// Submit a query for execution and await its result, subject to
    /// `timeout`. A connect failure or driver error is returned as
    /// [`ExporterError::Connect`]/[`ExporterError::Query`]; a timeout is
    /// returned as [`ExporterError::Timeout`].
    pub async fn execute(
        &self,
        query_name: &str,
        sql: &str,
        params: HashMap<String, serde_yaml::Value>,
        timeout: Duration,
    ) -> Result<QueryResults> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(Job {
                query_name: query_name.to_string(),
                sql: sql.to_string(),
                params,
                timeout,
                reply,
            })
            .await
            .map_err(|_| anyhow::anyhow!("database worker '{}' has stopped", self.name))?;

        rx.await
            .map_err(|_| anyhow::anyhow!("database worker '{}' dropped its reply", self.name))?
    }

    /// Stop accepting new jobs and wait for the worker task to drain and exit.
    pub async fn shutdown(self) {
        drop(self.sender);
        let _ = self.handle.await;
    }
}

/// One idle connection, or one permit's worth of capacity to open a new one.
type ConnHandle = Box<dyn rsql_drivers::Connection>;

async fn run(name: String, config: DatabaseConfig, mut jobs: mpsc::Receiver<Job>) {
    let pool_size = config.pool_size.unwrap_or(1).max(1) as usize;
    let semaphore = Arc::new(Semaphore::new(pool_size));
    let idle: Arc<Mutex<Vec<ConnHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let config = Arc::new(config);
    let name = Arc::new(name);

    let mut in_flight = Vec::new();

    while let Some(job) = jobs.recv().await {
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let config = config.clone();
        let idle = idle.clone();
        let name = name.clone();

        in_flight.retain(|h: &JoinHandle<()>| !h.is_finished());
        in_flight.push(tokio::spawn(async move {
            let result = run_job(&name, &config, &idle, &job).await;
            let _ = job.reply.send(result);
            drop(permit);
        }));
    }

    for handle in in_flight {
        let _ = handle.await;
    }

    // Drain and drop any idle connections still held.
    idle.lock().await.clear();
}

async fn run_job(
    name: &str,
    config: &DatabaseConfig,
    idle: &Mutex<Vec<ConnHandle>>,
    job: &Job,
) -> Result<QueryResults> {
    let mut conn = get_connection(name, config, idle).await?;

    let exec = execute_query(&mut *conn, &job.sql, &job.params);
    let started = Instant::now();
    let outcome = tokio::time::timeout(job.timeout, exec).await;
    let latency = started.elapsed();

    match outcome {
        Ok(Ok(results)) => {
            if config.keep_connected {
                idle.lock().await.push(conn);
            }
            Ok(QueryResults { latency, ..results })
        }
        Ok(Err((message, fatal))) => {
            if config.keep_connected {
                idle.lock().await.push(conn);
            }
            Err(ExporterError::Query {
                query: job.query_name.clone(),
                database: name.to_string(),
                message,
                fatal,
            }
            .into())
        }
        Err(_) => Err(ExporterError::Timeout {
            query: job.query_name.clone(),
            database: name.to_string(),
            timeout_secs: job.timeout.as_secs(),
        }
        .into()),
    }
}

async fn get_connection(
    name: &str,
    config: &DatabaseConfig,
    idle: &Mutex<Vec<ConnHandle>>,
) -> Result<ConnHandle> {
    if let Some(conn) = idle.lock().await.pop() {
        return Ok(conn);
    }

    DriverManager::initialize()
        .map_err(|e| ExporterError::Connect {
            database: name.to_string(),
            source: e.into(),
        })?;

    let mut conn = DriverManager::connect(&config.dsn.0)
        .await
        .map_err(|e| ExporterError::Connect {
            database: name.to_string(),
            source: e.into(),
        })?;

    for stmt in &config.connect_sql {
        conn.query(stmt).await.map_err(|e| ExporterError::Connect {
            database: name.to_string(),
            source: e.into(),
        })?;
    }

    Ok(conn)
}

/// Run one query, returning `Err((message, fatal))` on failure. A query is
/// considered fatal if the driver reports a syntax/parse error — those will
/// fail identically on every future invocation and the caller should stop
/// retrying them, unlike a transient connectivity error.
async fn execute_query(
    conn: &mut dyn rsql_drivers::Connection,
    sql: &str,
    params: &HashMap<String, serde_yaml::Value>,
) -> std::result::Result<QueryResults, (String, bool)> {
    let rendered = bind_parameters(sql, params);

    let mut query_result = conn
        .query(&rendered)
        .await
        .map_err(|e| (e.to_string(), is_fatal_driver_error(&e.to_string())))?;

    let column_names = query_result.columns().await;

    let mut rows = Vec::new();
    while let Some(row) = query_result.next().await {
        rows.push(row.into_iter().map(from_driver_value).collect());
    }

    Ok(QueryResults {
        column_names,
        rows,
        timestamp: chrono::Utc::now(),
        latency: Duration::default(),
    })
}

/// Substitute `:name` placeholders with literal SQL values. This exporter
/// targets ad-hoc operator-authored queries across heterogeneous dialects,
/// so parameters are rendered as literals rather than relying on a single
/// driver's native placeholder syntax.
fn bind_parameters(sql: &str, params: &HashMap<String, serde_yaml::Value>) -> String {
    let mut rendered = sql.to_string();
    for (key, value) in params {
        let literal = yaml_value_to_sql_literal(value);
        rendered = rendered.replace(&format!(":{key}"), &literal);
    }
    rendered
}

fn yaml_value_to_sql_literal(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Null => "NULL".to_string(),
        serde_yaml::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.as_str().unwrap_or_default().replace('\'', "''")),
    }
}

fn is_fatal_driver_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("syntax")
        || lower.contains("no such column")
        || lower.contains("unknown column")
        || lower.contains("does not exist")
}

fn from_driver_value(value: rsql_drivers::Value) -> Value {
    use rsql_drivers::Value as D;
    match value {
        D::I8(v) => Value::Int(v as i64),
        D::I16(v) => Value::Int(v as i64),
        D::I32(v) => Value::Int(v as i64),
        D::I64(v) => Value::Int(v),
        D::I128(v) => Value::Int(v as i64),
        D::U8(v) => Value::Int(v as i64),
        D::U16(v) => Value::Int(v as i64),
        D::U32(v) => Value::Int(v as i64),
        D::U64(v) => Value::Int(v as i64),
        D::U128(v) => Value::Int(v as i64),
        D::F32(v) => Value::Float(v as f64),
        D::F64(v) => Value::Float(v),
        D::Bool(b) => Value::Bool(b),
        D::String(s) => Value::Text(s),
        D::Null => Value::Null,
        D::Decimal(d) => Value::Text(d.to_string()),
        D::Date(d) => Value::Text(d.to_string()),
        D::Time(t) => Value::Text(t.to_string()),
        D::DateTime(dt) => Value::Text(dt.to_string()),
        D::Uuid(u) => Value::Text(u.to_string()),
        D::Bytes(_) | D::Array(_) | D::Map(_) => Value::Text(format!("{value:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_parameters_substitutes_named_placeholders() {
        let mut params = HashMap::new();
        params.insert(
            "threshold".to_string(),
            serde_yaml::Value::Number(42.into()),
        );
        params.insert(
            "label".to_string(),
            serde_yaml::Value::String("it's fine".to_string()),
        );
        let sql = "select * from t where x > :threshold and y = :label";
        let rendered = bind_parameters(sql, &params);
        assert!(rendered.contains("x > 42"));
        assert!(rendered.contains("y = 'it''s fine'"));
    }

    #[test]
    fn fatal_error_classification() {
        assert!(is_fatal_driver_error("syntax error near SELECT"));
        assert!(is_fatal_driver_error("column \"foo\" does not exist"));
        assert!(!is_fatal_driver_error("connection reset by peer"));
    }
}
