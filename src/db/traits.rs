// Database Engine Traits
// Defines the contract every backend implements so one pipeline can serve all dialects

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::time::Duration;

use crate::config::{DatabaseKind, SourceDescriptor};

/// Named query parameters, keyed without the leading colon
pub type QueryParams = serde_json::Map<String, serde_json::Value>;

/// Common database error type
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Source '{0}' not found in configuration")]
    UnknownSource(String),

    #[error("Unsupported database type: {0}")]
    UnsupportedKind(String),

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection {0} not found or inactive")]
    ConnectionNotFound(String),

    #[error("Query execution error: {0}")]
    QueryError(String),

    #[error("Statement exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("Pool error: {0}")]
    PoolError(String),

    #[error("Execution plan error: {0}")]
    PlanError(String),

    #[error("Engine has been disposed")]
    Disposed,
}

/// Cell value in a result set
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
}

impl CellValue {
    /// Text rendering used for scalar metadata (version strings, sizes, names)
    pub fn into_text(self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Bool(b) => Some(b.to_string()),
            CellValue::Int(i) => Some(i.to_string()),
            CellValue::Float(f) => Some(f.to_string()),
            CellValue::String(s) | CellValue::DateTime(s) => Some(s),
            CellValue::Binary(b) => Some(String::from_utf8_lossy(&b).into_owned()),
            CellValue::Json(serde_json::Value::String(s)) => Some(s),
            CellValue::Json(v) => Some(v.to_string()),
        }
    }
}

/// One result row, kept in column order and serialized as a name -> value map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(Vec<(String, CellValue)>);

impl Row {
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    pub fn push(&mut self, column: impl Into<String>, value: CellValue) {
        self.0.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.0
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume the row, keeping only the first column's value
    pub fn into_first(self) -> Option<CellValue> {
        self.0.into_iter().next().map(|(_, value)| value)
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Outcome of a successfully executed statement
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResult {
    /// Row-returning statement
    Rows {
        columns: Vec<String>,
        rows: Vec<Row>,
        row_count: usize,
    },
    /// Statement without a result set
    Affected { message: String, row_count: u64 },
}

impl QueryResult {
    pub fn rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let row_count = rows.len();
        QueryResult::Rows {
            columns,
            rows,
            row_count,
        }
    }

    pub fn affected(row_count: u64) -> Self {
        QueryResult::Affected {
            message: "Query executed successfully".to_string(),
            row_count,
        }
    }

    /// First column of every row, in order
    pub fn into_first_column(self) -> Vec<CellValue> {
        match self {
            QueryResult::Rows { rows, .. } => rows.into_iter().filter_map(Row::into_first).collect(),
            QueryResult::Affected { .. } => Vec::new(),
        }
    }

    /// Value in the first column of the first row
    pub fn into_scalar(self) -> Option<CellValue> {
        self.into_first_column().into_iter().next()
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows { rows, .. } => rows,
            QueryResult::Affected { .. } => Vec::new(),
        }
    }
}

/// Execution plan for a statement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub database_type: String,
    pub sql: String,
    pub execution_plan: serde_json::Value,
    pub plan_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advice: Vec<String>,
}

/// Engine version and storage footprint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseInfo {
    pub database_type: String,
    pub version: String,
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableList {
    pub tables: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaList {
    pub schemas: Vec<String>,
    pub count: usize,
}

/// Column information for a single table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDetail {
    pub column_name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub column_default: Option<String>,
    pub character_maximum_length: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDetail {
    pub table_name: String,
    /// Schema (Postgres), database (MySQL) or owner (Oracle)
    pub schema_or_owner: String,
    pub columns: Vec<ColumnDetail>,
    pub size: String,
}

const UNKNOWN: &str = "Unknown";

fn text_or_unknown(value: Option<CellValue>) -> String {
    value
        .and_then(CellValue::into_text)
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Backend engine trait - every database kind implements this
#[async_trait::async_trait]
pub trait DatabaseEngine: Send + Sync {
    // --- Metadata ---
    fn kind(&self) -> DatabaseKind;

    /// The source this engine is bound to for its lifetime
    fn source(&self) -> &SourceDescriptor;

    /// Driver connection string built from the source
    fn build_connection_string(&self) -> String;

    fn version_query(&self) -> &'static str;

    fn size_query(&self) -> &'static str;

    /// Ordered table names for the configured schema or owner
    fn list_tables_query(&self) -> String;

    fn list_schemas_query(&self) -> &'static str;

    /// Column metadata query. Binds `:table_name` and may bind `:schema_name`.
    fn columns_query(&self) -> &'static str;

    /// Single-table size query. Binds `:table_name` and may bind `:schema_name`.
    fn table_size_query(&self) -> &'static str;

    /// Namespace used for table metadata lookups
    fn metadata_namespace(&self) -> String;

    /// Table names as the data dictionary stores them
    fn normalize_table_name(&self, table: &str) -> String {
        table.to_string()
    }

    // --- Connection Management ---
    /// Open (or reuse) the pool and run a trivial statement. Never raises.
    async fn test_connection(&self) -> bool;

    /// Close the pool. The engine is unusable afterwards.
    async fn dispose(&self);

    // --- Query Execution ---
    async fn execute_query(
        &self,
        sql: &str,
        params: Option<&QueryParams>,
    ) -> Result<QueryResult, DatabaseError>;

    async fn explain_plan(&self, sql: &str) -> Result<ExecutionPlan, DatabaseError>;

    // --- Derived Metadata ---
    async fn get_database_info(&self) -> Result<DatabaseInfo, DatabaseError> {
        let version = self.execute_query(self.version_query(), None).await?.into_scalar();
        let size = self.execute_query(self.size_query(), None).await?.into_scalar();

        Ok(DatabaseInfo {
            database_type: self.kind().as_str().to_string(),
            version: text_or_unknown(version),
            size: text_or_unknown(size),
        })
    }

    async fn list_tables(&self) -> Result<TableList, DatabaseError> {
        let tables: Vec<String> = self
            .execute_query(&self.list_tables_query(), None)
            .await?
            .into_first_column()
            .into_iter()
            .filter_map(CellValue::into_text)
            .collect();

        Ok(TableList {
            count: tables.len(),
            tables,
        })
    }

    async fn list_schemas(&self) -> Result<SchemaList, DatabaseError> {
        let schemas: Vec<String> = self
            .execute_query(self.list_schemas_query(), None)
            .await?
            .into_first_column()
            .into_iter()
            .filter_map(CellValue::into_text)
            .collect();

        Ok(SchemaList {
            count: schemas.len(),
            schemas,
        })
    }

    async fn describe_table(&self, table: &str) -> Result<TableDetail, DatabaseError> {
        let namespace = self.metadata_namespace();
        let mut params = QueryParams::new();
        params.insert(
            "table_name".to_string(),
            serde_json::Value::String(self.normalize_table_name(table)),
        );
        params.insert(
            "schema_name".to_string(),
            serde_json::Value::String(namespace.clone()),
        );

        let columns = self
            .execute_query(self.columns_query(), Some(&params))
            .await?
            .into_rows()
            .into_iter()
            .map(column_detail_from_row)
            .collect();

        let size = self
            .execute_query(self.table_size_query(), Some(&params))
            .await?
            .into_scalar();

        Ok(TableDetail {
            table_name: table.to_string(),
            schema_or_owner: namespace,
            columns,
            size: text_or_unknown(size),
        })
    }
}

/// Map a row of the backend's columns query onto a `ColumnDetail`.
/// Every backend aliases its dictionary columns to the same names.
fn column_detail_from_row(row: Row) -> ColumnDetail {
    let text = |name: &str| row.get(name).cloned().and_then(CellValue::into_text);

    let is_nullable = text("is_nullable")
        .map(|v| matches!(v.to_ascii_uppercase().as_str(), "YES" | "Y" | "TRUE"))
        .unwrap_or(true);
    let character_maximum_length = match row.get("character_maximum_length") {
        Some(CellValue::Int(n)) => Some(*n),
        Some(CellValue::Float(f)) => Some(*f as i64),
        Some(CellValue::String(s)) => s.parse().ok(),
        _ => None,
    };

    ColumnDetail {
        column_name: text("column_name").unwrap_or_default(),
        data_type: text("data_type").unwrap_or_default(),
        is_nullable,
        column_default: text("column_default"),
        character_maximum_length,
    }
}
