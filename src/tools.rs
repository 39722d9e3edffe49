// Tool Service
// The operations exposed to MCP clients, each shaped into a JSON payload

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::SourceCatalog;
use crate::db::{ConnectionRegistry, DatabaseError, QueryParams};

/// Tool metadata advertised through `tools/list`
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Shared state behind every tool call
pub struct ToolService {
    catalog: Arc<SourceCatalog>,
    registry: Arc<ConnectionRegistry>,
}

/// `{success: false, error}`
pub fn failure(error: impl std::fmt::Display) -> Value {
    json!({ "success": false, "error": error.to_string() })
}

/// Serialize `payload` and mark it successful. Non-object payloads land under `result`.
fn success<T: Serialize>(payload: &T) -> Value {
    match serde_json::to_value(payload) {
        Ok(Value::Object(fields)) => {
            let mut body = Map::with_capacity(fields.len() + 1);
            body.insert("success".to_string(), Value::Bool(true));
            body.extend(fields);
            Value::Object(body)
        }
        Ok(other) => json!({ "success": true, "result": other }),
        Err(e) => failure(format!("Failed to serialize result: {}", e)),
    }
}

fn respond<T: Serialize>(result: Result<T, DatabaseError>) -> Value {
    match result {
        Ok(payload) => success(&payload),
        Err(e) => failure(e),
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    match args.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s),
        Some(Value::String(_)) => Err(format!("Argument '{}' must not be empty", key)),
        Some(_) => Err(format!("Argument '{}' must be a string", key)),
        None => Err(format!("Missing required argument '{}'", key)),
    }
}

fn optional_params(args: &Value) -> Result<Option<&QueryParams>, String> {
    match args.get("parameters") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err("Argument 'parameters' must be an object".to_string()),
    }
}

impl ToolService {
    pub fn new(catalog: Arc<SourceCatalog>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { catalog, registry }
    }

    pub fn catalog(&self) -> &Arc<SourceCatalog> {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Open a connection to a configured source
    pub async fn connect_db(&self, source_name: &str) -> Value {
        let Some(source) = self.catalog.get(source_name).await else {
            warn!(source = %source_name, "Unknown source requested");
            return failure(DatabaseError::UnknownSource(source_name.to_string()));
        };

        match self.registry.create_connection(source.clone()).await {
            Ok(connection_id) => json!({
                "success": true,
                "connection_id": connection_id,
                "source_name": source.name,
                "database_type": source.kind.as_str(),
                "host": source.host,
                "port": source.port,
                "database": source.database,
            }),
            Err(e) => failure(e),
        }
    }

    /// Run SQL on an open connection
    pub async fn execute_sql(
        &self,
        connection_id: &str,
        sql: &str,
        parameters: Option<&QueryParams>,
    ) -> Value {
        respond(self.registry.execute_sql(connection_id, sql, parameters).await)
    }

    pub async fn close_connection(&self, connection_id: &str) -> Value {
        if self.registry.close_connection(connection_id).await {
            json!({
                "success": true,
                "message": format!("Connection {} closed", connection_id),
            })
        } else {
            json!({
                "success": false,
                "message": format!("Connection {} not found", connection_id),
            })
        }
    }

    pub async fn list_connections(&self) -> Value {
        let connections = self.registry.list_connections().await;
        json!({
            "success": true,
            "count": connections.len(),
            "connections": connections,
        })
    }

    pub async fn list_tables(&self, connection_id: &str) -> Value {
        respond(self.registry.list_tables(connection_id).await)
    }

    pub async fn get_database_info(&self, connection_id: &str) -> Value {
        respond(self.registry.get_database_info(connection_id).await)
    }

    /// Execution plan plus static advice for `sql`
    pub async fn explain_plan(&self, connection_id: &str, sql: &str) -> Value {
        respond(self.registry.explain_plan(connection_id, sql).await)
    }

    /// Configured sources, without credentials
    pub async fn list_sources(&self) -> Value {
        let sources: Vec<Value> = self
            .catalog
            .sources()
            .await
            .into_iter()
            .map(|s| {
                json!({
                    "name": s.name,
                    "kind": s.kind.as_str(),
                    "host": s.host,
                    "port": s.port,
                    "database": s.database,
                    "user": s.user,
                })
            })
            .collect();
        json!({ "success": true, "count": sources.len(), "sources": sources })
    }

    pub async fn list_schemas(&self, connection_id: &str) -> Value {
        respond(self.registry.list_schemas(connection_id).await)
    }

    pub async fn describe_table(&self, connection_id: &str, table_name: &str) -> Value {
        respond(self.registry.describe_table(connection_id, table_name).await)
    }

    /// Dispatch a tool by name. Bad arguments and unknown tools become failures.
    pub async fn call(&self, name: &str, arguments: &Value) -> Value {
        info!(tool = %name, "Tool call");
        match self.dispatch(name, arguments).await {
            Ok(value) => value,
            Err(message) => failure(message),
        }
    }

    async fn dispatch(&self, name: &str, args: &Value) -> Result<Value, String> {
        let value = match name {
            "connect_db" => self.connect_db(required_str(args, "source_name")?).await,
            "execute_sql" => {
                let id = required_str(args, "connection_id")?;
                let sql = required_str(args, "sql")?;
                self.execute_sql(id, sql, optional_params(args)?).await
            }
            "close_connection" => {
                self.close_connection(required_str(args, "connection_id")?)
                    .await
            }
            "list_connections" => self.list_connections().await,
            "list_tables" => self.list_tables(required_str(args, "connection_id")?).await,
            "get_database_info" => {
                self.get_database_info(required_str(args, "connection_id")?)
                    .await
            }
            "explain_plan" => {
                let id = required_str(args, "connection_id")?;
                self.explain_plan(id, required_str(args, "sql")?).await
            }
            "list_sources" => self.list_sources().await,
            "list_schemas" => self.list_schemas(required_str(args, "connection_id")?).await,
            "describe_table" => {
                let id = required_str(args, "connection_id")?;
                self.describe_table(id, required_str(args, "table_name")?)
                    .await
            }
            other => return Err(format!("Unknown tool: {}", other)),
        };
        Ok(value)
    }
}

fn connection_only_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "connection_id": { "type": "string", "description": "Id returned by connect_db" }
        },
        "required": ["connection_id"]
    })
}

/// Every tool this server exposes
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "connect_db",
            description: "Connect to a configured database source and return a connection id",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "source_name": { "type": "string", "description": "Source name from tools.yaml" }
                },
                "required": ["source_name"]
            }),
        },
        ToolDefinition {
            name: "execute_sql",
            description: "Execute a SQL statement. Use :name placeholders with the parameters object",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "connection_id": { "type": "string" },
                    "sql": { "type": "string" },
                    "parameters": { "type": "object", "description": "Values for :name placeholders" }
                },
                "required": ["connection_id", "sql"]
            }),
        },
        ToolDefinition {
            name: "close_connection",
            description: "Close a connection and release its pool",
            input_schema: connection_only_schema(),
        },
        ToolDefinition {
            name: "list_connections",
            description: "List open connections",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDefinition {
            name: "list_tables",
            description: "List tables in the connected database",
            input_schema: connection_only_schema(),
        },
        ToolDefinition {
            name: "get_database_info",
            description: "Database type, server version and size",
            input_schema: connection_only_schema(),
        },
        ToolDefinition {
            name: "explain_plan",
            description: "Get the execution plan for a SQL statement, with optimization hints",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "connection_id": { "type": "string" },
                    "sql": { "type": "string" }
                },
                "required": ["connection_id", "sql"]
            }),
        },
        ToolDefinition {
            name: "list_sources",
            description: "List configured database sources",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDefinition {
            name: "list_schemas",
            description: "List schemas (databases on MySQL, users on Oracle)",
            input_schema: connection_only_schema(),
        },
        ToolDefinition {
            name: "describe_table",
            description: "Columns and size of a table",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "connection_id": { "type": "string" },
                    "table_name": { "type": "string" }
                },
                "required": ["connection_id", "table_name"]
            }),
        },
    ]
}
