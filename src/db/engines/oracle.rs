// Oracle Engine
// Implements DatabaseEngine for Oracle through the ODPI-C based `oracle` crate.
// The driver is blocking, so every call runs on tokio's blocking pool.

use oracle::pool::{CloseMode, GetMode, Pool, PoolBuilder};
use oracle::sql_type::{OracleType, ToSql};
use oracle::{Connection, SqlValue};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::oracle_plan::{explain_with_fallback, PlanSession};
use super::{bounded, decimal_cell, LazyPool, PoolSettings};
use crate::config::{DatabaseKind, DialectOptions, SourceDescriptor};
use crate::db::params::{bind_named, PlaceholderStyle};
use crate::db::statement::sql_advice;
use crate::db::traits::{
    CellValue, DatabaseEngine, DatabaseError, ExecutionPlan, QueryParams, QueryResult, Row,
};

/// Extra time the async guard allows on top of the driver call timeout
const CALL_TIMEOUT_GRACE: Duration = Duration::from_secs(2);

impl From<oracle::Error> for DatabaseError {
    fn from(e: oracle::Error) -> Self {
        let message = e.to_string();
        // ORA-24457 / ORA-24418: no free session in the pool
        if message.contains("ORA-24457") || message.contains("ORA-24418") {
            return DatabaseError::PoolError(message);
        }
        DatabaseError::QueryError(message)
    }
}

/// DPI-1067 / ORA-03156: the driver call timeout expired
fn is_call_timeout(message: &str) -> bool {
    message.contains("DPI-1067") || message.contains("ORA-03156")
}

/// Oracle engine bound to one source
pub struct OracleEngine {
    source: SourceDescriptor,
    settings: PoolSettings,
    pool: LazyPool<Arc<Pool>>,
}

impl OracleEngine {
    pub fn new(source: SourceDescriptor) -> Self {
        Self::with_settings(source, PoolSettings::default())
    }

    pub fn with_settings(source: SourceDescriptor, settings: PoolSettings) -> Self {
        Self {
            source,
            settings,
            pool: LazyPool::new(),
        }
    }

    fn owner(&self) -> String {
        self.source
            .schema()
            .unwrap_or(&self.source.user)
            .to_uppercase()
    }

    async fn pool(&self) -> Result<Arc<Pool>, DatabaseError> {
        self.pool
            .get_or_init(|| async {
                let user = self.source.user.clone();
                let password = self.source.password.clone();
                let connect_string = self.build_connection_string();
                let settings = self.settings;
                let address = self.source.address();
                debug!(
                    source = %self.source.name,
                    connect_string = %connect_string,
                    "Creating Oracle pool"
                );

                tokio::task::spawn_blocking(move || {
                    let mut builder = PoolBuilder::new(user, password, connect_string);
                    builder
                        .min_connections(settings.pool_size)
                        .max_connections(settings.max_size())
                        .connection_increment(1)
                        .get_mode(GetMode::TimedWait(settings.checkout_timeout))
                        .max_lifetime_connection(settings.max_lifetime);
                    builder.build()
                })
                .await
                .map_err(|e| DatabaseError::ConnectionFailed(format!("Oracle pool task failed: {}", e)))?
                .map(Arc::new)
                .map_err(|e| {
                    DatabaseError::ConnectionFailed(format!(
                        "Oracle connection to {} failed: {}",
                        address, e
                    ))
                })
            })
            .await
    }

    /// Check out a connection and run `work` on the blocking pool
    async fn with_connection<T, F>(&self, work: F) -> Result<T, DatabaseError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, DatabaseError> + Send + 'static,
    {
        let pool = self.pool().await?;
        let timeout = self.source.statement_timeout();

        let task = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| match DatabaseError::from(e) {
                DatabaseError::QueryError(msg) => DatabaseError::ConnectionFailed(msg),
                other => other,
            })?;
            conn.set_autocommit(true);
            conn.set_call_timeout(timeout)?;
            work(&conn).map_err(|e| match (e, timeout) {
                (DatabaseError::QueryError(msg), Some(limit)) if is_call_timeout(&msg) => {
                    DatabaseError::Timeout(limit)
                }
                (other, _) => other,
            })
        });

        let guarded = bounded(timeout.map(|t| t + CALL_TIMEOUT_GRACE), async {
            task.await
                .map_err(|e| DatabaseError::QueryError(format!("Oracle worker task failed: {}", e)))?
        })
        .await;

        match (guarded, timeout) {
            (Err(DatabaseError::Timeout(_)), Some(limit)) => Err(DatabaseError::Timeout(limit)),
            (other, _) => other,
        }
    }
}

fn to_oracle_value(value: &Value) -> Box<dyn ToSql> {
    match value {
        Value::Null => Box::new(None::<String>),
        Value::Bool(b) => Box::new(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Box::new(i),
            None => Box::new(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Box::new(s.clone()),
        other => Box::new(other.to_string()),
    }
}

fn run_statement(
    conn: &Connection,
    sql: &str,
    names: &[String],
    values: &[Value],
) -> Result<QueryResult, oracle::Error> {
    let binds: Vec<Box<dyn ToSql>> = values.iter().map(to_oracle_value).collect();
    let named: Vec<(&str, &dyn ToSql)> = names
        .iter()
        .map(String::as_str)
        .zip(binds.iter().map(|b| b.as_ref()))
        .collect();

    let mut stmt = conn.statement(sql).build()?;
    if !stmt.is_query() {
        stmt.execute_named(&named)?;
        return Ok(QueryResult::affected(stmt.row_count()?));
    }

    let rows = stmt.query_named(&named)?;
    let columns: Vec<String> = rows
        .column_info()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let types: Vec<OracleType> = rows
        .column_info()
        .iter()
        .map(|c| c.oracle_type().clone())
        .collect();

    let mut out = Vec::new();
    for row in rows {
        let row = row?;
        let mut converted = Row::with_capacity(columns.len());
        for ((name, ty), value) in columns.iter().zip(&types).zip(row.sql_values()) {
            converted.push(name.as_str(), cell_value(value, ty)?);
        }
        out.push(converted);
    }

    Ok(QueryResult::rows(columns, out))
}

fn cell_value(value: &SqlValue, ty: &OracleType) -> Result<CellValue, oracle::Error> {
    if value.is_null()? {
        return Ok(CellValue::Null);
    }

    let cell = match ty {
        OracleType::Number(_, _) | OracleType::Float(_) => decimal_cell(value.get::<String>()?),
        OracleType::Int64 => CellValue::Int(value.get::<i64>()?),
        OracleType::UInt64 => {
            let v = value.get::<u64>()?;
            i64::try_from(v)
                .map(CellValue::Int)
                .unwrap_or_else(|_| CellValue::String(v.to_string()))
        }
        OracleType::BinaryFloat | OracleType::BinaryDouble => CellValue::Float(value.get::<f64>()?),
        OracleType::Boolean => CellValue::Bool(value.get::<bool>()?),
        OracleType::Date | OracleType::Timestamp(_) => CellValue::DateTime(
            value
                .get::<chrono::NaiveDateTime>()?
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        ),
        OracleType::TimestampTZ(_) | OracleType::TimestampLTZ(_) => CellValue::DateTime(
            value
                .get::<chrono::DateTime<chrono::FixedOffset>>()?
                .to_rfc3339(),
        ),
        OracleType::Raw(_) | OracleType::LongRaw | OracleType::BLOB => {
            CellValue::Binary(value.get::<Vec<u8>>()?)
        }
        _ => CellValue::String(value.get::<String>()?),
    };
    Ok(cell)
}

/// Plan queries on a single checked-out connection
struct OracleSession<'a> {
    conn: &'a Connection,
}

impl PlanSession for OracleSession<'_> {
    fn run(&mut self, sql: &str) -> Result<(), String> {
        let mut stmt = self
            .conn
            .statement(sql)
            .build()
            .map_err(|e| e.to_string())?;
        if stmt.is_query() {
            for row in stmt.query(&[]).map_err(|e| e.to_string())? {
                row.map_err(|e| e.to_string())?;
            }
        } else {
            stmt.execute(&[]).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn plan_lines(&mut self, sql: &str) -> Result<Vec<String>, String> {
        self.conn
            .query_as::<Option<String>>(sql, &[])
            .map_err(|e| e.to_string())?
            .map(|line| line.map(Option::unwrap_or_default).map_err(|e| e.to_string()))
            .collect()
    }
}

#[async_trait::async_trait]
impl DatabaseEngine for OracleEngine {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Oracle
    }

    fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    /// Easy Connect for a service name or bare database, a full descriptor for a SID
    fn build_connection_string(&self) -> String {
        let source = &self.source;
        let (service_name, sid) = match &source.dialect {
            DialectOptions::Oracle {
                service_name, sid, ..
            } => (service_name.as_deref(), sid.as_deref()),
            _ => (None, None),
        };

        match (service_name, sid) {
            (Some(service), _) => format!("//{}:{}/{}", source.host, source.port, service),
            (None, Some(sid)) => format!(
                "(DESCRIPTION=(ADDRESS=(PROTOCOL=TCP)(HOST={})(PORT={}))(CONNECT_DATA=(SID={})))",
                source.host, source.port, sid
            ),
            (None, None) => format!("//{}:{}/{}", source.host, source.port, source.database),
        }
    }

    fn version_query(&self) -> &'static str {
        "SELECT banner FROM v$version WHERE ROWNUM = 1"
    }

    fn size_query(&self) -> &'static str {
        "SELECT ROUND(SUM(bytes)/1024/1024, 2) AS size_mb FROM user_segments"
    }

    fn list_tables_query(&self) -> String {
        match self.source.schema() {
            Some(_) => format!(
                "SELECT table_name FROM all_tables WHERE owner = '{}' ORDER BY table_name",
                self.owner().replace('\'', "''")
            ),
            None => "SELECT table_name FROM user_tables ORDER BY table_name".to_string(),
        }
    }

    fn list_schemas_query(&self) -> &'static str {
        "SELECT username FROM all_users ORDER BY username"
    }

    fn columns_query(&self) -> &'static str {
        "SELECT column_name, \
                data_type, \
                nullable AS is_nullable, \
                data_default AS column_default, \
                data_length AS character_maximum_length \
         FROM all_tab_columns \
         WHERE owner = :schema_name AND table_name = :table_name \
         ORDER BY column_id"
    }

    fn table_size_query(&self) -> &'static str {
        "SELECT ROUND(SUM(bytes)/1024/1024, 2) AS size_mb \
         FROM user_segments \
         WHERE segment_name = :table_name"
    }

    fn metadata_namespace(&self) -> String {
        self.owner()
    }

    fn normalize_table_name(&self, table: &str) -> String {
        table.to_uppercase()
    }

    async fn test_connection(&self) -> bool {
        let result = self
            .with_connection(|conn| {
                conn.query_row_as::<i64>("SELECT 1 FROM DUAL", &[])?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(source = %self.source.name, "Oracle connection test failed: {}", e);
                false
            }
        }
    }

    async fn dispose(&self) {
        let Some(pool) = self.pool.take().await else {
            return;
        };
        let closed = tokio::task::spawn_blocking(move || pool.close(&CloseMode::Default)).await;
        match closed {
            Ok(Ok(())) => info!(source = %self.source.name, "Oracle pool closed"),
            Ok(Err(e)) => warn!(source = %self.source.name, "Oracle pool close failed: {}", e),
            Err(e) => warn!(source = %self.source.name, "Oracle pool close task failed: {}", e),
        }
    }

    async fn execute_query(
        &self,
        sql: &str,
        params: Option<&QueryParams>,
    ) -> Result<QueryResult, DatabaseError> {
        let bound = bind_named(sql, params, PlaceholderStyle::Named)?;
        debug!(source = %self.source.name, sql = %bound.sql, "Executing Oracle statement");

        self.with_connection(move |conn| {
            Ok(run_statement(conn, &bound.sql, &bound.names, &bound.values)?)
        })
        .await
    }

    async fn explain_plan(&self, sql: &str) -> Result<ExecutionPlan, DatabaseError> {
        let statement_id = format!("MCP_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let statement = sql.to_string();
        debug!(source = %self.source.name, statement_id = %statement_id, "Fetching Oracle plan");

        let outcome = self
            .with_connection(move |conn| {
                let mut session = OracleSession { conn };
                explain_with_fallback(&mut session, &statement, &statement_id)
            })
            .await?;

        Ok(ExecutionPlan {
            database_type: self.kind().as_str().to_string(),
            sql: sql.to_string(),
            execution_plan: Value::Array(outcome.lines.into_iter().map(Value::String).collect()),
            plan_type: outcome.plan_type.to_string(),
            note: outcome.note,
            advice: sql_advice(sql),
        })
    }
}
