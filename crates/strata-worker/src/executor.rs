use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{types::ValueRef, Connection, OpenFlags};
use strata_scheduler::{ExecutionError, ReportExecutor, ScheduleStore, TabularResult};
use tracing::debug;

/// Runs a report's stored SQL against the read-only data database.
///
/// Schedule parameters bind to `:name` placeholders of the same name;
/// placeholders without a value bind NULL and unused parameters are ignored.
pub struct SqliteReportExecutor {
    store: ScheduleStore,
    data_path: PathBuf,
}

impl SqliteReportExecutor {
    pub fn new(store: ScheduleStore, data_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            data_path: data_path.into(),
        }
    }
}

#[async_trait]
impl ReportExecutor for SqliteReportExecutor {
    async fn execute(
        &self,
        report_id: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<TabularResult, ExecutionError> {
        let report = self
            .store
            .get_report(report_id)
            .map_err(|e| ExecutionError(e.to_string()))?;
        debug!(report_id, report = %report.name, "executing report SQL");

        let path = self.data_path.clone();
        let params = parameters.clone();
        tokio::task::spawn_blocking(move || run_query(&path, &report.sql, &params))
            .await
            .map_err(|e| ExecutionError(format!("query task failed: {e}")))?
    }
}

fn run_query(
    path: &Path,
    sql: &str,
    params: &BTreeMap<String, String>,
) -> Result<TabularResult, ExecutionError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(sql_err)?;
    let mut stmt = conn.prepare(sql).map_err(sql_err)?;

    for (name, value) in params {
        if let Some(idx) = stmt.parameter_index(&format!(":{name}")).map_err(sql_err)? {
            stmt.raw_bind_parameter(idx, value).map_err(sql_err)?;
        }
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(sql_err)? {
        let mut values = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            values.push(to_json(row.get_ref(i).map_err(sql_err)?));
        }
        out.push(values);
    }

    Ok(TabularResult { columns, rows: out })
}

fn to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => i.into(),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned().into(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()).into(),
    }
}

fn sql_err(e: rusqlite::Error) -> ExecutionError {
    ExecutionError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data_db(dir: &Path) -> PathBuf {
        let path = dir.join("data.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (region TEXT, total REAL, note TEXT);
             INSERT INTO sales VALUES ('EU', 10.5, NULL), ('EU', 4.5, 'late'), ('US', 7, NULL);",
        )
        .unwrap();
        path
    }

    fn store_with(sql: &str) -> (ScheduleStore, String) {
        let store = ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let report = store.create_report("Sales", sql).unwrap();
        (store, report.id)
    }

    #[tokio::test]
    async fn binds_named_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = data_db(dir.path());
        let (store, report_id) = store_with(
            "SELECT region, SUM(total) AS total, COUNT(*) AS n FROM sales
             WHERE region = :region GROUP BY region",
        );
        let exec = SqliteReportExecutor::new(store, path);

        let params = BTreeMap::from([
            ("region".to_string(), "EU".to_string()),
            ("unused".to_string(), "x".to_string()),
        ]);
        let result = exec.execute(&report_id, &params).await.unwrap();
        assert_eq!(result.columns, vec!["region", "total", "n"]);
        assert_eq!(result.rows, vec![vec![json!("EU"), json!(15.0), json!(2)]]);
    }

    #[tokio::test]
    async fn nulls_and_ordering_survive() {
        let dir = tempfile::tempdir().unwrap();
        let path = data_db(dir.path());
        let (store, report_id) = store_with("SELECT note FROM sales ORDER BY rowid");
        let exec = SqliteReportExecutor::new(store, path);

        let result = exec.execute(&report_id, &BTreeMap::new()).await.unwrap();
        assert_eq!(result.row_count(), 3);
        assert_eq!(result.rows[0], vec![serde_json::Value::Null]);
        assert_eq!(result.rows[1], vec![json!("late")]);
    }

    #[tokio::test]
    async fn bad_sql_is_an_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = data_db(dir.path());
        let (store, report_id) = store_with("SELECT * FROM missing_table");
        let exec = SqliteReportExecutor::new(store, path);

        let err = exec.execute(&report_id, &BTreeMap::new()).await.unwrap_err();
        assert!(err.0.contains("no such table"), "{err}");
    }

    #[tokio::test]
    async fn unknown_report_is_an_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store_with("SELECT 1");
        let exec = SqliteReportExecutor::new(store, data_db(dir.path()));
        assert!(exec.execute("nope", &BTreeMap::new()).await.is_err());
    }
}
