// MCP Server
// Serves the tool service over newline-delimited JSON-RPC on stdio

pub mod protocol;

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::tools::{tool_definitions, ToolService};
use protocol::{methods, McpRequest, McpResponse, McpRpcError, ToolCallParams, MCP_PROTOCOL_VERSION};

pub const SERVER_NAME: &str = "dbtools-mcp";

pub struct McpServer {
    tools: Arc<ToolService>,
}

impl McpServer {
    pub fn new(tools: Arc<ToolService>) -> Self {
        Self { tools }
    }

    /// Handle one raw line. Returns the response to write, if any.
    pub async fn handle_line(&self, line: &str) -> Option<McpResponse> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!("Discarding malformed message: {}", e);
                return Some(McpResponse::error(None, McpRpcError::parse_error(e)));
            }
        };

        match serde_json::from_value::<McpRequest>(value) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => Some(McpResponse::error(None, McpRpcError::invalid_request(e))),
        }
    }

    pub async fn handle_request(&self, request: McpRequest) -> Option<McpResponse> {
        debug!(method = %request.method, "Received request");

        if request.is_notification() {
            match request.method.as_str() {
                methods::INITIALIZED => info!("Client initialized"),
                methods::CANCELLED => debug!("Client cancelled a request"),
                other => debug!(method = %other, "Ignoring notification"),
            }
            return None;
        }

        let id = request.id.clone();
        let outcome = match request.method.as_str() {
            methods::INITIALIZE => Ok(initialize_result()),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(json!({ "tools": tool_definitions() })),
            methods::TOOLS_CALL => self.call_tool(request.params).await,
            other => Err(McpRpcError::method_not_found(other)),
        };

        Some(match outcome {
            Ok(result) => McpResponse::success(id, result),
            Err(e) => McpResponse::error(id, e),
        })
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, McpRpcError> {
        let params: ToolCallParams =
            serde_json::from_value(params.unwrap_or(Value::Null)).map_err(McpRpcError::invalid_params)?;

        let payload = self.tools.call(&params.name, &params.arguments).await;
        let is_error = payload.get("success") == Some(&Value::Bool(false));
        let text = serde_json::to_string_pretty(&payload)
            .map_err(|e| McpRpcError::new(-32603, e.to_string()))?;

        Ok(json!({
            "content": [{ "type": "text", "text": text }],
            "isError": is_error,
        }))
    }

    /// Serve until `reader` reaches EOF. Requests are handled concurrently and
    /// responses are written in completion order.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<String>(64);

        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let server = Arc::clone(&self);
            let tx = tx.clone();
            tokio::spawn(async move {
                let Some(response) = server.handle_line(&line).await else {
                    return;
                };
                match serde_json::to_string(&response) {
                    Ok(encoded) => {
                        if tx.send(encoded).await.is_err() {
                            warn!("Output closed before response could be written");
                        }
                    }
                    Err(e) => error!("Failed to encode response: {}", e),
                }
            });
        }

        info!("Input closed, waiting for in-flight requests");
        drop(tx);
        match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }

    /// Serve on the process stdin and stdout
    pub async fn serve_stdio(self: Arc<Self>) -> std::io::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceCatalog;
    use crate::db::testing::{fake_factory, fake_source};
    use crate::db::ConnectionRegistry;
    use tokio::io::AsyncReadExt;

    fn server() -> Arc<McpServer> {
        let (factory, _) = fake_factory(true);
        let tools = ToolService::new(
            Arc::new(SourceCatalog::from_sources(vec![fake_source("shop")])),
            Arc::new(ConnectionRegistry::new(Arc::new(factory))),
        );
        Arc::new(McpServer::new(Arc::new(tools)))
    }

    async fn roundtrip(server: &McpServer, message: Value) -> Value {
        let response = server
            .handle_line(&message.to_string())
            .await
            .expect("expected a response");
        serde_json::to_value(response).unwrap()
    }

    #[tokio::test]
    async fn test_initialize() {
        let response = roundtrip(
            &server(),
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
        )
        .await;
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(response["result"]["serverInfo"]["name"], SERVER_NAME);
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let server = server();
        let line = json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string();
        assert!(server.handle_line(&line).await.is_none());
    }

    #[tokio::test]
    async fn test_tools_list() {
        let response = roundtrip(
            &server(),
            json!({"jsonrpc": "2.0", "id": "t", "method": "tools/list"}),
        )
        .await;
        let tools = response["result"]["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "connect_db"));
        assert!(tools.iter().all(|t| t["inputSchema"]["type"] == "object"));
    }

    #[tokio::test]
    async fn test_tools_call_wraps_payload() {
        let server = server();
        let response = roundtrip(
            &server,
            json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": {"name": "connect_db", "arguments": {"source_name": "shop"}}
            }),
        )
        .await;

        let result = &response["result"];
        assert_eq!(result["isError"], false);
        assert_eq!(result["content"][0]["type"], "text");
        let payload: Value =
            serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(payload["success"], true);
        assert!(payload["connection_id"].is_string());
    }

    #[tokio::test]
    async fn test_failed_tool_sets_is_error() {
        let response = roundtrip(
            &server(),
            json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {"name": "list_tables", "arguments": {"connection_id": "ghost"}}
            }),
        )
        .await;
        assert_eq!(response["result"]["isError"], true);
        assert!(response["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("not found or inactive"));
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let server = server();

        let unknown = roundtrip(
            &server,
            json!({"jsonrpc": "2.0", "id": 4, "method": "resources/list"}),
        )
        .await;
        assert_eq!(unknown["error"]["code"], -32601);

        let bad_params = roundtrip(
            &server,
            json!({"jsonrpc": "2.0", "id": 5, "method": "tools/call", "params": {"arguments": {}}}),
        )
        .await;
        assert_eq!(bad_params["error"]["code"], -32602);

        let garbage = server.handle_line("{not json").await.unwrap();
        let garbage = serde_json::to_value(garbage).unwrap();
        assert_eq!(garbage["error"]["code"], -32700);
        assert_eq!(garbage["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_serve_over_duplex() {
        let server = server();
        let (mut client, server_io) = tokio::io::duplex(16 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);

        let handle = tokio::spawn(server.serve(server_read, server_write));

        let input = format!(
            "{}\n\n{}\n",
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        );
        client.write_all(input.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        handle.await.unwrap().unwrap();

        let mut output = String::new();
        client.read_to_string(&mut output).await.unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1);
        let response: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"], json!({}));
    }
}
