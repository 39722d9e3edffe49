// PostgreSQL Engine
// Implements DatabaseEngine for PostgreSQL using tokio-postgres behind a bb8 pool

use bb8::{Pool, RunError};
use bb8_postgres::PostgresConnectionManager;
use bytes::{BufMut, BytesMut};
use rust_decimal::Decimal;
use serde_json::Value;
use std::error::Error;
use std::fmt::Display;
use std::str::FromStr;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::{CancelToken, Client, Column, NoTls, Row as PgRow, SimpleQueryMessage};
use tracing::{debug, error, info, warn};

use super::{bounded_or_cancel, decimal_cell, redact_password, LazyPool, PoolSettings};
use crate::config::{DatabaseKind, SourceDescriptor};
use crate::db::params::{bind_named, BoundStatement, PlaceholderStyle};
use crate::db::statement::sql_advice;
use crate::db::traits::{
    CellValue, DatabaseEngine, DatabaseError, ExecutionPlan, QueryParams, QueryResult, Row,
};

pub type PostgresPool = Pool<PostgresConnectionManager<NoTls>>;

type BoxError = Box<dyn Error + Sync + Send>;

const DEFAULT_SCHEMA: &str = "public";

impl From<tokio_postgres::Error> for DatabaseError {
    fn from(e: tokio_postgres::Error) -> Self {
        let message = match e.as_db_error() {
            Some(db) => format!("{}: {}", db.severity(), db.message()),
            None => e.to_string(),
        };
        DatabaseError::QueryError(message)
    }
}

impl<E: Display> From<RunError<E>> for DatabaseError {
    fn from(e: RunError<E>) -> Self {
        match e {
            RunError::User(e) => DatabaseError::ConnectionFailed(e.to_string()),
            RunError::TimedOut => {
                DatabaseError::PoolError("Timed out waiting for a pooled connection".to_string())
            }
        }
    }
}

/// PostgreSQL engine bound to one source
pub struct PostgresEngine {
    source: SourceDescriptor,
    settings: PoolSettings,
    pool: LazyPool<PostgresPool>,
}

impl PostgresEngine {
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

    fn schema(&self) -> &str {
        self.source.schema().unwrap_or(DEFAULT_SCHEMA)
    }

    async fn pool(&self) -> Result<PostgresPool, DatabaseError> {
        self.pool
            .get_or_init(|| async {
                let uri = self.build_connection_string();
                debug!(
                    source = %self.source.name,
                    uri = %redact_password(&uri, &self.source.password),
                    "Creating PostgreSQL pool"
                );

                let manager = PostgresConnectionManager::new_from_stringlike(uri, NoTls)
                    .map_err(|e| DatabaseError::InvalidConfig(e.to_string()))?;

                Pool::builder()
                    .max_size(self.settings.max_size())
                    .min_idle(Some(self.settings.pool_size))
                    .max_lifetime(Some(self.settings.max_lifetime))
                    .connection_timeout(self.settings.checkout_timeout)
                    .test_on_check_out(true)
                    .build(manager)
                    .await
                    .map_err(|e| {
                        DatabaseError::ConnectionFailed(format!(
                            "PostgreSQL connection to {} failed: {}",
                            self.source.address(),
                            e
                        ))
                    })
            })
            .await
    }
}

#[async_trait::async_trait]
impl DatabaseEngine for PostgresEngine {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    fn source(&self) -> &SourceDescriptor {
        &self.source
    }

    fn build_connection_string(&self) -> String {
        let source = &self.source;
        let mut uri = format!(
            "postgresql://{}:{}@{}:{}/{}",
            urlencoding::encode(&source.user),
            urlencoding::encode(&source.password),
            source.host,
            source.port,
            urlencoding::encode(&source.database)
        );

        let mut params = Vec::new();
        if let Some(mode) = source.sslmode() {
            params.push(format!("sslmode={}", mode));
        }
        if let Some(schema) = source.schema() {
            params.push(format!(
                "options=-csearch_path%3D{}",
                urlencoding::encode(schema)
            ));
        }
        if let Some(timeout) = source.timeout.filter(|t| *t > 0) {
            params.push(format!("connect_timeout={}", timeout));
        }

        if !params.is_empty() {
            uri.push('?');
            uri.push_str(&params.join("&"));
        }
        uri
    }

    fn version_query(&self) -> &'static str {
        "SELECT version()"
    }

    fn size_query(&self) -> &'static str {
        "SELECT pg_size_pretty(pg_database_size(current_database())) AS size"
    }

    fn list_tables_query(&self) -> String {
        format!(
            "SELECT table_name::text AS table_name \
             FROM information_schema.tables \
             WHERE table_schema = '{}' \
             ORDER BY table_name",
            self.schema().replace('\'', "''")
        )
    }

    fn list_schemas_query(&self) -> &'static str {
        "SELECT schema_name::text AS schema_name FROM information_schema.schemata ORDER BY schema_name"
    }

    fn columns_query(&self) -> &'static str {
        "SELECT column_name::text AS column_name, \
                data_type::text AS data_type, \
                is_nullable::text AS is_nullable, \
                column_default::text AS column_default, \
                character_maximum_length::int8 AS character_maximum_length \
         FROM information_schema.columns \
         WHERE table_schema = :schema_name::text AND table_name = :table_name::text \
         ORDER BY ordinal_position"
    }

    fn table_size_query(&self) -> &'static str {
        "SELECT pg_size_pretty(pg_total_relation_size(c.oid)) AS size \
         FROM pg_class c \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE n.nspname = :schema_name::text AND c.relname = :table_name::text"
    }

    fn metadata_namespace(&self) -> String {
        self.schema().to_string()
    }

    async fn test_connection(&self) -> bool {
        let result = async {
            let pool = self.pool().await?;
            let conn = pool.get().await?;
            conn.query_one("SELECT 1", &[]).await?;
            Ok::<(), DatabaseError>(())
        }
        .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(source = %self.source.name, "PostgreSQL connection test failed: {}", e);
                false
            }
        }
    }

    async fn dispose(&self) {
        if self.pool.take().await.is_some() {
            info!(source = %self.source.name, "PostgreSQL pool closed");
        }
    }

    async fn execute_query(
        &self,
        sql: &str,
        params: Option<&QueryParams>,
    ) -> Result<QueryResult, DatabaseError> {
        let bound = bind_named(sql, params, PlaceholderStyle::Dollar)?;
        debug!(source = %self.source.name, sql = %bound.sql, "Executing PostgreSQL statement");

        let pool = self.pool().await?;
        let conn = pool.get().await?;
        let token = conn.cancel_token();
        bounded_or_cancel(
            self.source.statement_timeout(),
            run_statement(&conn, bound),
            || cancel_statement(token, &self.source.name),
        )
        .await
    }

    async fn explain_plan(&self, sql: &str) -> Result<ExecutionPlan, DatabaseError> {
        let explain = format!("EXPLAIN (FORMAT JSON) {}", sql);
        debug!(source = %self.source.name, sql = %explain, "Fetching PostgreSQL plan");

        let pool = self.pool().await?;
        let conn = pool.get().await?;
        let token = conn.cancel_token();
        let plan = bounded_or_cancel(
            self.source.statement_timeout(),
            async {
                let row = conn.query_one(explain.as_str(), &[]).await?;
                let plan: Value = row.try_get(0)?;
                Ok(plan)
            },
            || cancel_statement(token, &self.source.name),
        )
        .await?;

        Ok(ExecutionPlan {
            database_type: self.kind().as_str().to_string(),
            sql: sql.to_string(),
            execution_plan: plan,
            plan_type: "EXPLAIN (FORMAT JSON)".to_string(),
            note: None,
            advice: sql_advice(sql),
        })
    }
}

/// Ask the server to abandon whatever the timed-out connection is running
async fn cancel_statement(token: CancelToken, source: &str) {
    match token.cancel_query(NoTls).await {
        Ok(()) => warn!(source = %source, "Statement timed out, cancel request sent"),
        Err(e) => error!(source = %source, "Could not cancel timed-out statement: {}", e),
    }
}

async fn run_statement(client: &Client, bound: BoundStatement) -> Result<QueryResult, DatabaseError> {
    let stmt = client.prepare(&bound.sql).await?;

    let args: Vec<PgParam> = bound.values.into_iter().map(PgParam).collect();
    let refs: Vec<&(dyn ToSql + Sync)> = args.iter().map(|a| a as &(dyn ToSql + Sync)).collect();

    if stmt.columns().is_empty() {
        let affected = client.execute(&stmt, &refs).await?;
        return Ok(QueryResult::affected(affected));
    }

    // The binary format has no decoder here for types like interval or inet
    if let Some(column) = stmt.columns().iter().find(|c| !readable(c.type_())) {
        if !refs.is_empty() {
            return Err(DatabaseError::QueryError(format!(
                "Column '{}' has type {}, which cannot be returned for a statement with parameters; cast it to text",
                column.name(),
                column.type_()
            )));
        }
        return run_as_text(client, &bound.sql, stmt.columns()).await;
    }

    let rows = client.query(&stmt, &refs).await?;
    convert_rows(stmt.columns(), &rows)
}

/// Run through the simple query protocol, which returns every value as text
async fn run_as_text(client: &Client, sql: &str, columns: &[Column]) -> Result<QueryResult, DatabaseError> {
    let names: Vec<String> = columns.iter().map(|c| c.name().to_string()).collect();
    let mut out = Vec::new();

    for message in client.simple_query(sql).await? {
        if let SimpleQueryMessage::Row(row) = message {
            let mut converted = Row::with_capacity(columns.len());
            for (idx, column) in columns.iter().enumerate() {
                let cell = match row.try_get(idx)? {
                    Some(text) => text_cell(column.type_(), text),
                    None => CellValue::Null,
                };
                converted.push(column.name(), cell);
            }
            out.push(converted);
        }
    }

    Ok(QueryResult::rows(names, out))
}

fn convert_rows(columns: &[Column], rows: &[PgRow]) -> Result<QueryResult, DatabaseError> {
    let names: Vec<String> = columns.iter().map(|c| c.name().to_string()).collect();
    let mut out = Vec::with_capacity(rows.len());

    for row in rows {
        let mut converted = Row::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            converted.push(column.name(), row.try_get::<_, PgCell>(idx)?.0);
        }
        out.push(converted);
    }

    Ok(QueryResult::rows(names, out))
}

/// Scalar types with a binary decoder below
const SCALAR_TYPES: &[&str] = &[
    "bool", "int2", "int4", "int8", "oid", "float4", "float8", "numeric", "json", "jsonb",
    "timestamp", "timestamptz", "date", "time", "bytea", "uuid",
];

/// Whether a column of this type can be decoded from the binary format
fn readable(ty: &Type) -> bool {
    match ty.kind() {
        Kind::Array(member) => readable(member),
        Kind::Domain(inner) => readable(inner),
        Kind::Enum(_) => true,
        _ => SCALAR_TYPES.contains(&ty.name()) || <String as FromSql>::accepts(ty),
    }
}

/// One binary column value
struct PgCell(CellValue);

impl<'a> FromSql<'a> for PgCell {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        decode_cell(ty, raw).map(PgCell)
    }

    fn from_sql_null(_: &Type) -> Result<Self, BoxError> {
        Ok(PgCell(CellValue::Null))
    }

    fn accepts(ty: &Type) -> bool {
        readable(ty)
    }
}

fn decode_cell(ty: &Type, raw: &[u8]) -> Result<CellValue, BoxError> {
    match ty.kind() {
        Kind::Array(_) => {
            let items = Vec::<PgCell>::from_sql(ty, raw)?
                .into_iter()
                .map(|cell| serde_json::to_value(cell.0))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(CellValue::Json(Value::Array(items)));
        }
        Kind::Domain(inner) => return decode_cell(inner, raw),
        Kind::Enum(_) => return Ok(CellValue::String(String::from_utf8(raw.to_vec())?)),
        _ => {}
    }

    let cell = match ty.name() {
        "bool" => CellValue::Bool(bool::from_sql(ty, raw)?),
        "int2" => CellValue::Int(i16::from_sql(ty, raw)?.into()),
        "int4" => CellValue::Int(i32::from_sql(ty, raw)?.into()),
        "int8" => CellValue::Int(i64::from_sql(ty, raw)?),
        "oid" => CellValue::Int(u32::from_sql(ty, raw)?.into()),
        "float4" => float_cell(f32::from_sql(ty, raw)?.into()),
        "float8" => float_cell(f64::from_sql(ty, raw)?),
        "numeric" => match special_numeric(raw) {
            Some(text) => CellValue::String(text.to_string()),
            None => decimal_cell(Decimal::from_sql(ty, raw)?.to_string()),
        },
        "json" | "jsonb" => CellValue::Json(Value::from_sql(ty, raw)?),
        "timestamp" => CellValue::DateTime(
            chrono::NaiveDateTime::from_sql(ty, raw)?
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        ),
        "timestamptz" => {
            CellValue::DateTime(chrono::DateTime::<chrono::Utc>::from_sql(ty, raw)?.to_rfc3339())
        }
        "date" => CellValue::DateTime(chrono::NaiveDate::from_sql(ty, raw)?.to_string()),
        "time" => CellValue::DateTime(chrono::NaiveTime::from_sql(ty, raw)?.to_string()),
        "bytea" => CellValue::Binary(Vec::<u8>::from_sql(ty, raw)?),
        "uuid" => CellValue::String(uuid::Uuid::from_slice(raw)?.to_string()),
        _ => CellValue::String(String::from_sql(ty, raw)?),
    };
    Ok(cell)
}

fn float_cell(v: f64) -> CellValue {
    if v.is_finite() {
        CellValue::Float(v)
    } else {
        CellValue::String(v.to_string())
    }
}

/// NUMERIC sign word for values a decimal cannot hold
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

fn special_numeric(raw: &[u8]) -> Option<&'static str> {
    let sign = u16::from_be_bytes([*raw.get(4)?, *raw.get(5)?]);
    match sign {
        NUMERIC_NAN => Some("NaN"),
        NUMERIC_PINF => Some("Infinity"),
        NUMERIC_NINF => Some("-Infinity"),
        _ => None,
    }
}

/// Text-format value, typed by the column the server described
fn text_cell(ty: &Type, text: &str) -> CellValue {
    let ty = match ty.kind() {
        Kind::Domain(inner) => inner,
        _ => ty,
    };
    match ty.name() {
        "bool" => CellValue::Bool(text == "t"),
        "int2" | "int4" | "int8" | "oid" => text
            .parse::<i64>()
            .map(CellValue::Int)
            .unwrap_or_else(|_| CellValue::String(text.to_string())),
        "float4" | "float8" | "numeric" => decimal_cell(text.to_string()),
        "json" | "jsonb" => serde_json::from_str(text)
            .map(CellValue::Json)
            .unwrap_or_else(|_| CellValue::String(text.to_string())),
        "timestamp" | "timestamptz" | "date" | "time" => CellValue::DateTime(text.to_string()),
        _ => CellValue::String(text.to_string()),
    }
}

/// Parse a NUMERIC parameter, accepting exponent notation
fn numeric_param(text: &str) -> Result<Decimal, BoxError> {
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|_| format!("cannot bind '{}' as numeric", text).into())
}

/// JSON parameter value, encoded according to the type the server inferred
#[derive(Debug)]
struct PgParam(Value);

impl PgParam {
    fn text(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn as_bool(&self) -> Result<bool, BoxError> {
        match &self.0 {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(false),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(true),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "1" => Ok(true),
                "false" | "f" | "no" | "0" => Ok(false),
                _ => Err(format!("cannot bind '{}' as boolean", s).into()),
            },
            other => Err(format!("cannot bind {} as boolean", other).into()),
        }
    }

    fn as_i64(&self) -> Result<i64, BoxError> {
        match &self.0 {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| format!("cannot bind {} as integer", n).into()),
            Value::String(s) => Ok(s.trim().parse::<i64>()?),
            other => Err(format!("cannot bind {} as integer", other).into()),
        }
    }

    fn as_f64(&self) -> Result<f64, BoxError> {
        match &self.0 {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| format!("cannot bind {} as float", n).into()),
            Value::String(s) => Ok(s.trim().parse::<f64>()?),
            other => Err(format!("cannot bind {} as float", other).into()),
        }
    }
}

impl ToSql for PgParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if self.0.is_null() {
            return Ok(IsNull::Yes);
        }

        match ty.name() {
            "bool" => self.as_bool()?.to_sql(ty, out),
            "int2" => i16::try_from(self.as_i64()?)?.to_sql(ty, out),
            "int4" => i32::try_from(self.as_i64()?)?.to_sql(ty, out),
            "int8" => self.as_i64()?.to_sql(ty, out),
            "oid" => u32::try_from(self.as_i64()?)?.to_sql(ty, out),
            "float4" => (self.as_f64()? as f32).to_sql(ty, out),
            "float8" => self.as_f64()?.to_sql(ty, out),
            "numeric" => {
                let text = self.text();
                let sign = match text.trim() {
                    "NaN" => NUMERIC_NAN,
                    "Infinity" | "+Infinity" => NUMERIC_PINF,
                    "-Infinity" => NUMERIC_NINF,
                    _ => return numeric_param(&text)?.to_sql(ty, out),
                };
                out.put_i16(0);
                out.put_i16(0);
                out.put_u16(sign);
                out.put_u16(0);
                Ok(IsNull::No)
            }
            "json" | "jsonb" => self.0.to_sql(ty, out),
            "date" => chrono::NaiveDate::from_str(&self.text())?.to_sql(ty, out),
            "timestamp" => {
                let text = self.text();
                chrono::NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| chrono::NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f"))?
                    .to_sql(ty, out)
            }
            "timestamptz" => chrono::DateTime::parse_from_rfc3339(&self.text())?
                .with_timezone(&chrono::Utc)
                .to_sql(ty, out),
            "uuid" => {
                out.put_slice(uuid::Uuid::parse_str(&self.text())?.as_bytes());
                Ok(IsNull::No)
            }
            "bytea" => self.text().as_bytes().to_sql(ty, out),
            _ => self.text().as_str().to_sql(ty, out),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
