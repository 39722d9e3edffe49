// In-memory engine used by registry, tool and server tests

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{DatabaseKind, SourceDescriptor};
use crate::db::factory::{engine_constructor, EngineFactory};
use crate::db::statement::sql_advice;
use crate::db::traits::{
    CellValue, DatabaseEngine, DatabaseError, ExecutionPlan, QueryParams, QueryResult, Row,
};

pub struct FakeEngine {
    source: SourceDescriptor,
    healthy: bool,
    disposed: AtomicBool,
    disposals: Arc<AtomicUsize>,
}

fn single_column(name: &str, values: &[&str]) -> QueryResult {
    let rows = values
        .iter()
        .map(|v| {
            let mut row = Row::with_capacity(1);
            row.push(name, CellValue::String(v.to_string()));
            row
        })
        .collect();
    QueryResult::rows(vec![name.to_string()], rows)
}

#[async_trait::async_trait]
impl DatabaseEngine for FakeEngine {
    fn kind(&self) -> DatabaseKind {
        self.source.kind
    }

    fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    fn build_connection_string(&self) -> String {
        format!("fake://{}", self.source.address())
    }

    fn version_query(&self) -> &'static str {
        "SELECT fake_version()"
    }

    fn size_query(&self) -> &'static str {
        "SELECT fake_size()"
    }

    fn list_tables_query(&self) -> String {
        "SELECT fake_tables()".to_string()
    }

    fn list_schemas_query(&self) -> &'static str {
        "SELECT fake_schemas()"
    }

    fn columns_query(&self) -> &'static str {
        "SELECT fake_columns(:table_name)"
    }

    fn table_size_query(&self) -> &'static str {
        "SELECT fake_table_size(:table_name)"
    }

    fn metadata_namespace(&self) -> String {
        "main".to_string()
    }

    async fn test_connection(&self) -> bool {
        self.healthy && !self.disposed.load(Ordering::SeqCst)
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn execute_query(
        &self,
        sql: &str,
        params: Option<&QueryParams>,
    ) -> Result<QueryResult, DatabaseError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DatabaseError::Disposed);
        }

        match sql {
            "SELECT fake_version()" => Ok(single_column("version", &["FakeDB 1.0"])),
            "SELECT fake_size()" => Ok(single_column("size", &["42 MB"])),
            "SELECT fake_tables()" => Ok(single_column("table_name", &["customers", "orders"])),
            "SELECT fake_schemas()" => Ok(single_column("schema_name", &["main", "staging"])),
            "SELECT fake_columns(:table_name)" => {
                let mut row = Row::with_capacity(5);
                row.push("column_name", CellValue::String("id".into()));
                row.push("data_type", CellValue::String("integer".into()));
                row.push("is_nullable", CellValue::String("NO".into()));
                row.push("column_default", CellValue::Null);
                row.push("character_maximum_length", CellValue::Null);
                Ok(QueryResult::rows(
                    vec![
                        "column_name".into(),
                        "data_type".into(),
                        "is_nullable".into(),
                        "column_default".into(),
                        "character_maximum_length".into(),
                    ],
                    vec![row],
                ))
            }
            "SELECT fake_table_size(:table_name)" => Ok(single_column("size", &["8192 bytes"])),
            _ if sql.starts_with("FAIL") => {
                Err(DatabaseError::QueryError(format!("syntax error near '{}'", sql)))
            }
            _ if sql.trim_start().to_ascii_uppercase().starts_with("SELECT") => {
                let mut row = Row::with_capacity(2);
                row.push("id", CellValue::Int(1));
                let echoed = params
                    .and_then(|p| p.get("name"))
                    .cloned()
                    .unwrap_or(Value::Null);
                row.push("name", CellValue::Json(echoed));
                Ok(QueryResult::rows(vec!["id".into(), "name".into()], vec![row]))
            }
            _ => Ok(QueryResult::affected(3)),
        }
    }

    async fn explain_plan(&self, sql: &str) -> Result<ExecutionPlan, DatabaseError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DatabaseError::Disposed);
        }
        Ok(ExecutionPlan {
            database_type: self.kind().as_str().to_string(),
            sql: sql.to_string(),
            execution_plan: serde_json::json!([{"Plan": {"Node Type": "Seq Scan"}}]),
            plan_type: "FAKE".to_string(),
            note: None,
            advice: sql_advice(sql),
        })
    }
}

/// Factory whose built-in kinds all produce fake engines.
/// Returns the factory and a counter of disposed engines.
pub fn fake_factory(healthy: bool) -> (EngineFactory, Arc<AtomicUsize>) {
    let disposals = Arc::new(AtomicUsize::new(0));
    let mut factory = EngineFactory::new();

    for kind in ["postgres", "postgresql", "mysql", "oracle"] {
        let counter = Arc::clone(&disposals);
        factory.register_engine(
            kind,
            engine_constructor(move |source| FakeEngine {
                source,
                healthy,
                disposed: AtomicBool::new(false),
                disposals: Arc::clone(&counter),
            }),
        );
    }

    (factory, disposals)
}

pub fn fake_source(name: &str) -> SourceDescriptor {
    SourceDescriptor::new(name, DatabaseKind::Postgres, "localhost", 5432, "app", "app_user", "secret")
}
