// MySQL Engine
// Implements DatabaseEngine for MySQL using a sqlx connection pool

use futures::TryStreamExt;
use serde_json::Value;
use sqlx::mysql::{MySqlConnection, MySqlDatabaseError, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{
    Column as _, ConnectOptions, Connection, Either, Executor, Row as _, Statement as _, TypeInfo,
    ValueRef,
};
use tracing::{debug, error, info, warn};

use super::{bounded_or_cancel, decimal_cell, redact_password, LazyPool, PoolSettings};
use crate::config::{DatabaseKind, SourceDescriptor};
use crate::db::params::{bind_named, BoundStatement, PlaceholderStyle};
use crate::db::statement::{returns_rows, sql_advice};
use crate::db::traits::{
    CellValue, DatabaseEngine, DatabaseError, ExecutionPlan, QueryParams, QueryResult, Row,
};

/// ER_UNSUPPORTED_PS: statement cannot go through the binary protocol
const UNSUPPORTED_PREPARE: u16 = 1295;

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => {
                DatabaseError::PoolError("Timed out waiting for a pooled connection".to_string())
            }
            sqlx::Error::PoolClosed => DatabaseError::Disposed,
            sqlx::Error::Io(e) => DatabaseError::ConnectionFailed(e.to_string()),
            sqlx::Error::Tls(e) => DatabaseError::ConnectionFailed(e.to_string()),
            sqlx::Error::Configuration(e) => DatabaseError::InvalidConfig(e.to_string()),
            other => DatabaseError::QueryError(other.to_string()),
        }
    }
}

/// MySQL engine bound to one source
pub struct MySqlEngine {
    source: SourceDescriptor,
    settings: PoolSettings,
    pool: LazyPool<MySqlPool>,
}

impl MySqlEngine {
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

    fn charset(&self) -> Option<&str> {
        match &self.source.dialect {
            crate::config::DialectOptions::Mysql { charset, .. } => charset.as_deref(),
            _ => None,
        }
    }

    async fn pool(&self) -> Result<MySqlPool, DatabaseError> {
        self.pool
            .get_or_init(|| async {
                let uri = self.build_connection_string();
                debug!(
                    source = %self.source.name,
                    uri = %redact_password(&uri, &self.source.password),
                    "Creating MySQL pool"
                );

                MySqlPoolOptions::new()
                    .max_connections(self.settings.max_size())
                    .min_connections(self.settings.pool_size)
                    .acquire_timeout(self.settings.checkout_timeout)
                    .max_lifetime(Some(self.settings.max_lifetime))
                    .test_before_acquire(true)
                    .connect(&uri)
                    .await
                    .map_err(|e| {
                        DatabaseError::ConnectionFailed(format!(
                            "MySQL connection to {} failed: {}",
                            self.source.address(),
                            e
                        ))
                    })
            })
            .await
    }

    /// Check out a connection and run `bound` on it under the statement timeout
    async fn run(&self, bound: BoundStatement) -> Result<QueryResult, DatabaseError> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await?;

        let timeout = self.source.statement_timeout();
        let connection_id = match timeout {
            Some(_) => Some(
                sqlx::query_scalar::<_, u64>("SELECT CONNECTION_ID()")
                    .fetch_one(&mut *conn)
                    .await?,
            ),
            None => None,
        };

        bounded_or_cancel(timeout, run_statement(&mut conn, bound), || {
            kill_query(&pool, connection_id, &self.source.name)
        })
        .await
    }
}

/// Stop the statement running on `connection_id` from a separate connection
async fn kill_query(pool: &MySqlPool, connection_id: Option<u64>, source: &str) {
    let Some(id) = connection_id else {
        return;
    };

    let killed = async {
        let mut conn = pool.connect_options().connect().await?;
        sqlx::query(&format!("KILL QUERY {}", id))
            .execute(&mut conn)
            .await?;
        conn.close().await
    }
    .await;

    match killed {
        Ok(()) => warn!(source = %source, connection_id = id, "Statement timed out, query killed"),
        Err(e) => error!(source = %source, connection_id = id, "Could not kill timed-out statement: {}", e),
    }
}

async fn run_statement(conn: &mut MySqlConnection, bound: BoundStatement) -> Result<QueryResult, DatabaseError> {
    let columns = match (&mut *conn).prepare(&bound.sql).await {
        Ok(stmt) => Some(
            stmt.columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect::<Vec<_>>(),
        ),
        Err(e) if is_unsupported_prepare(&e) && bound.values.is_empty() => None,
        Err(e) => return Err(e.into()),
    };

    match columns {
        Some(columns) if columns.is_empty() => {
            let result = bind_values(sqlx::query(&bound.sql), bound.values)
                .execute(&mut *conn)
                .await?;
            Ok(QueryResult::affected(result.rows_affected()))
        }
        Some(columns) => {
            let rows = bind_values(sqlx::query(&bound.sql), bound.values)
                .fetch_all(&mut *conn)
                .await?;
            convert_rows(columns, &rows)
        }
        // Text protocol for statements the server refuses to prepare
        None => {
            let mut rows = Vec::new();
            let mut affected = 0;
            let mut results = (&mut *conn).fetch_many(bound.sql.as_str());
            while let Some(item) = results.try_next().await? {
                match item {
                    Either::Left(done) => affected += done.rows_affected(),
                    Either::Right(row) => rows.push(row),
                }
            }
            text_protocol_result(&bound.sql, &rows, affected)
        }
    }
}

/// Shape a text-protocol outcome. A row-returning statement with no rows has no
/// column metadata to report, but is still a result set.
fn text_protocol_result(sql: &str, rows: &[MySqlRow], affected: u64) -> Result<QueryResult, DatabaseError> {
    match rows.first() {
        Some(first) => {
            let columns = first.columns().iter().map(|c| c.name().to_string()).collect();
            convert_rows(columns, rows)
        }
        None if returns_rows(sql) => Ok(QueryResult::rows(Vec::new(), Vec::new())),
        None => Ok(QueryResult::affected(affected)),
    }
}

fn is_unsupported_prepare(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.try_downcast_ref::<MySqlDatabaseError>())
        .map(|db| db.number() == UNSUPPORTED_PREPARE)
        .unwrap_or(false)
}

type MySqlQuery<'q> = sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>;

fn bind_values(mut query: MySqlQuery<'_>, values: Vec<Value>) -> MySqlQuery<'_> {
    for value in values {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(b),
            Value::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => query.bind(i),
                (None, Some(u)) => query.bind(u),
                _ => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s),
            other => query.bind(other.to_string()),
        };
    }
    query
}

#[async_trait::async_trait]
impl DatabaseEngine for MySqlEngine {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Mysql
    }

    fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    fn build_connection_string(&self) -> String {
        let source = &self.source;
        let mut uri = format!(
            "mysql://{}:{}@{}:{}/{}",
            urlencoding::encode(&source.user),
            urlencoding::encode(&source.password),
            source.host,
            source.port,
            urlencoding::encode(&source.database)
        );

        let mut params = Vec::new();
        if let Some(charset) = self.charset() {
            params.push(format!("charset={}", charset));
        }
        if let Some(mode) = source.sslmode() {
            params.push(format!("ssl-mode={}", mode));
        }

        if !params.is_empty() {
            uri.push('?');
            uri.push_str(&params.join("&"));
        }
        uri
    }

    fn version_query(&self) -> &'static str {
        "SELECT VERSION() AS version"
    }

    fn size_query(&self) -> &'static str {
        "SELECT ROUND(SUM(data_length + index_length) / 1024 / 1024, 2) AS size_mb \
         FROM information_schema.tables \
         WHERE table_schema = DATABASE()"
    }

    fn list_tables_query(&self) -> String {
        "SELECT table_name AS table_name \
         FROM information_schema.tables \
         WHERE table_schema = DATABASE() \
         ORDER BY table_name"
            .to_string()
    }

    fn list_schemas_query(&self) -> &'static str {
        "SHOW DATABASES"
    }

    fn columns_query(&self) -> &'static str {
        "SELECT column_name AS column_name, \
                data_type AS data_type, \
                is_nullable AS is_nullable, \
                column_default AS column_default, \
                character_maximum_length AS character_maximum_length \
         FROM information_schema.columns \
         WHERE table_schema = DATABASE() AND table_name = :table_name \
         ORDER BY ordinal_position"
    }

    fn table_size_query(&self) -> &'static str {
        "SELECT ROUND((data_length + index_length) / 1024 / 1024, 2) AS size_mb \
         FROM information_schema.tables \
         WHERE table_schema = DATABASE() AND table_name = :table_name"
    }

    fn metadata_namespace(&self) -> String {
        self.source.database.clone()
    }

    async fn test_connection(&self) -> bool {
        let result = async {
            let pool = self.pool().await?;
            sqlx::query("SELECT 1").execute(&pool).await?;
            Ok::<(), DatabaseError>(())
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(source = %self.source.name, "MySQL connection test failed: {}", e);
                false
            }
        }
    }

    async fn dispose(&self) {
        if let Some(pool) = self.pool.take().await {
            pool.close().await;
            info!(source = %self.source.name, "MySQL pool closed");
        }
    }

    async fn execute_query(
        &self,
        sql: &str,
        params: Option<&QueryParams>,
    ) -> Result<QueryResult, DatabaseError> {
        let bound = bind_named(sql, params, PlaceholderStyle::Question)?;
        debug!(source = %self.source.name, sql = %bound.sql, "Executing MySQL statement");

        self.run(bound).await
    }

    async fn explain_plan(&self, sql: &str) -> Result<ExecutionPlan, DatabaseError> {
        let explain = BoundStatement {
            sql: format!("EXPLAIN FORMAT=JSON {}", sql),
            values: Vec::new(),
            names: Vec::new(),
        };
        debug!(source = %self.source.name, sql = %explain.sql, "Fetching MySQL plan");

        let plan = self
            .run(explain)
            .await?
            .into_scalar()
            .and_then(CellValue::into_text)
            .unwrap_or_default();

        Ok(ExecutionPlan {
            database_type: self.kind().as_str().to_string(),
            sql: sql.to_string(),
            execution_plan: Value::String(plan),
            plan_type: "EXPLAIN FORMAT=JSON".to_string(),
            note: None,
            advice: sql_advice(sql),
        })
    }
}

fn convert_rows(columns: Vec<String>, rows: &[MySqlRow]) -> Result<QueryResult, DatabaseError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut converted = Row::with_capacity(columns.len());
        for (idx, name) in columns.iter().enumerate() {
            converted.push(name.as_str(), cell_value(row, idx)?);
        }
        out.push(converted);
    }
    Ok(QueryResult::rows(columns, out))
}

fn cell_value(row: &MySqlRow, idx: usize) -> Result<CellValue, sqlx::Error> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(CellValue::Null);
    }
    let type_name = raw.type_info().name().to_string();
    drop(raw);

    let value = match type_name.as_str() {
        "BOOLEAN" => CellValue::Bool(row.try_get_unchecked::<bool, _>(idx)?),
        name if name.ends_with("UNSIGNED") => {
            let v = row.try_get_unchecked::<u64, _>(idx)?;
            i64::try_from(v)
                .map(CellValue::Int)
                .unwrap_or_else(|_| CellValue::String(v.to_string()))
        }
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            CellValue::Int(row.try_get_unchecked::<i64, _>(idx)?)
        }
        "FLOAT" => CellValue::Float(row.try_get_unchecked::<f32, _>(idx)?.into()),
        "DOUBLE" => CellValue::Float(row.try_get_unchecked::<f64, _>(idx)?),
        "DECIMAL" => decimal_cell(row.try_get_unchecked::<String, _>(idx)?),
        "DATETIME" | "TIMESTAMP" => CellValue::DateTime(
            row.try_get_unchecked::<chrono::NaiveDateTime, _>(idx)?
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        ),
        "DATE" => CellValue::DateTime(row.try_get_unchecked::<chrono::NaiveDate, _>(idx)?.to_string()),
        "TIME" => CellValue::DateTime(row.try_get_unchecked::<chrono::NaiveTime, _>(idx)?.to_string()),
        "JSON" => CellValue::Json(row.try_get_unchecked::<sqlx::types::Json<Value>, _>(idx)?.0),
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BINARY" | "VARBINARY" | "BIT"
        | "GEOMETRY" => CellValue::Binary(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        _ => match row.try_get_unchecked::<String, _>(idx) {
            Ok(text) => CellValue::String(text),
            Err(_) => {
                let bytes = row.try_get_unchecked::<Vec<u8>, _>(idx)?;
                CellValue::String(String::from_utf8_lossy(&bytes).into_owned())
            }
        },
    };

    Ok(value)
}
