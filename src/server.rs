//! Line-delimited JSON-RPC 2.0 over stdio
//!
//! One request per line, one response per line. Requests without an `id`
//! member are notifications and get no reply; `"id": null` is answered. Tool failures are successful JSON-RPC
//! responses with `isError: true`; protocol problems are JSON-RPC errors.

use crate::tools::{ToolContext, ToolRegistry};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum size of a single request line (1 MB)
const MAX_LINE_SIZE: usize = 1_048_576;

const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    /// `None` only when the member is absent; an explicit null is `Some(Null)`
    #[serde(default, deserialize_with = "present")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Wraps any value that is present, null included
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Outcome of reading one bounded line
enum Line {
    Text(String),
    TooLarge,
    Eof,
}

/// Read up to the next newline without buffering more than `MAX_LINE_SIZE`.
/// An oversized line is drained so the stream stays usable.
async fn read_line<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> std::io::Result<Line> {
    let mut buf: Vec<u8> = Vec::new();
    let mut too_large = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if too_large {
                return Ok(Line::TooLarge);
            }
            return Ok(if buf.is_empty() {
                Line::Eof
            } else {
                Line::Text(String::from_utf8_lossy(&buf).into_owned())
            });
        }

        let newline = available.iter().position(|&b| b == b'\n');
        let end = newline.map(|p| p + 1).unwrap_or(available.len());
        if !too_large {
            if buf.len() + end > MAX_LINE_SIZE {
                too_large = true;
                buf.clear();
            } else {
                buf.extend_from_slice(&available[..end]);
            }
        }
        reader.consume(end);

        if newline.is_some() {
            if too_large {
                return Ok(Line::TooLarge);
            }
            return Ok(Line::Text(String::from_utf8_lossy(&buf).into_owned()));
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &JsonRpcResponse,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(response).unwrap_or_else(|_| {
        r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"serialization failed"}}"#
            .to_string()
    });
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Serves the tool registry to one client
pub struct McpServer {
    registry: ToolRegistry,
    ctx: ToolContext,
}

impl McpServer {
    pub fn new(ctx: ToolContext) -> Self {
        Self {
            registry: ToolRegistry::new(),
            ctx,
        }
    }

    /// Serve stdin/stdout until the client closes stdin
    pub async fn run_stdio(&self) -> std::io::Result<()> {
        tracing::info!("Serving {} tools on stdio", self.registry.descriptors().len());
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve requests from `reader` until EOF, writing responses to `writer`
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);

        loop {
            let line = match read_line(&mut reader).await? {
                Line::Eof => break,
                Line::TooLarge => {
                    tracing::warn!("Rejected request larger than {} bytes", MAX_LINE_SIZE);
                    let response = JsonRpcResponse::error(
                        Value::Null,
                        INVALID_REQUEST,
                        format!("request too large (max {MAX_LINE_SIZE} bytes)"),
                    );
                    write_response(&mut writer, &response).await?;
                    continue;
                }
                Line::Text(text) => text,
            };

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(response) = self.handle_line(line).await {
                write_response(&mut writer, &response).await?;
            }
        }

        tracing::info!("Client closed the connection");
        Ok(())
    }

    /// Handle one request line; `None` for notifications
    pub async fn handle_line(&self, line: &str) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                return Some(JsonRpcResponse::error(
                    Value::Null,
                    PARSE_ERROR,
                    format!("parse error: {e}"),
                ))
            }
        };

        let Some(id) = request.id.clone() else {
            tracing::debug!("Notification {}", request.method);
            return None;
        };

        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::error(
                id,
                INVALID_REQUEST,
                "invalid JSON-RPC version",
            ));
        }

        Some(self.dispatch(id, request).await)
    }

    async fn dispatch(&self, id: Value, request: JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": { "tools": {} },
                }),
            ),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => JsonRpcResponse::success(
                id,
                json!({ "tools": self.registry.descriptors() }),
            ),
            "tools/call" => self.call_tool(id, request.params).await,
            other => JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                format!("unknown method: {other}"),
            ),
        }
    }

    async fn call_tool(&self, id: Value, params: Value) -> JsonRpcResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::error(id, INVALID_PARAMS, "tools/call requires a tool name");
        };
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        let result = self.registry.call(&self.ctx, name, arguments).await;

        let (payload, is_error) = match result {
            Ok(value) => (value, false),
            Err(e) => (e.to_json(), true),
        };
        JsonRpcResponse::success(
            id,
            json!({
                "content": [{
                    "type": "text",
                    "text": serde_json::to_string_pretty(&payload).unwrap_or_default(),
                }],
                "isError": is_error,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::test_context;

    async fn exchange(server: &McpServer, input: &str) -> Vec<JsonRpcResponse> {
        let mut output: Vec<u8> = Vec::new();
        server.serve(input.as_bytes(), &mut output).await.unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn tool_payload(response: &JsonRpcResponse) -> Value {
        let text = response.result.as_ref().unwrap()["content"][0]["text"]
            .as_str()
            .unwrap();
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_list() {
        let (_dir, ctx) = test_context().await;
        let server = McpServer::new(ctx);

        let responses = exchange(
            &server,
            concat!(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
                "\n",
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
                "\n",
            ),
        )
        .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, json!(1));
        assert_eq!(
            responses[0].result.as_ref().unwrap()["serverInfo"]["name"],
            "tablescope"
        );
        let tools = responses[1].result.as_ref().unwrap()["tools"]
            .as_array()
            .unwrap();
        assert!(tools.iter().any(|t| t["name"] == "execute_select"));
        assert!(tools.iter().all(|t| t["inputSchema"].is_object()));
    }

    #[tokio::test]
    async fn test_tool_call_success_and_failure() {
        let (_dir, ctx) = test_context().await;
        let server = McpServer::new(ctx);

        let responses = exchange(
            &server,
            concat!(
                r#"{"jsonrpc":"2.0","id":"a","method":"tools/call","params":{"name":"execute_select","arguments":{"query":"SELECT COUNT(*) AS n FROM orders"}}}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":"b","method":"tools/call","params":{"name":"execute_select","arguments":{"query":"DROP TABLE orders"}}}"#,
                "\n",
            ),
        )
        .await;

        let ok = &responses[0];
        assert_eq!(ok.result.as_ref().unwrap()["isError"], false);
        assert_eq!(tool_payload(ok)["results"][0]["n"], 3);

        let rejected = &responses[1];
        assert_eq!(rejected.result.as_ref().unwrap()["isError"], true);
        assert_eq!(tool_payload(rejected)["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let (_dir, ctx) = test_context().await;
        let server = McpServer::new(ctx);

        let responses = exchange(
            &server,
            concat!(
                "not json\n",
                r#"{"jsonrpc":"2.0","id":1,"method":"resources/list"}"#,
                "\n",
                r#"{"jsonrpc":"1.0","id":2,"method":"ping"}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{}}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":4,"method":"ping"}"#,
            ),
        )
        .await;

        let codes: Vec<Option<i32>> = responses
            .iter()
            .map(|r| r.error.as_ref().map(|e| e.code))
            .collect();
        assert_eq!(
            codes,
            vec![
                Some(PARSE_ERROR),
                Some(METHOD_NOT_FOUND),
                Some(INVALID_REQUEST),
                Some(INVALID_PARAMS),
                None
            ]
        );
    }

    #[tokio::test]
    async fn test_null_id_is_answered_but_missing_id_is_not() {
        let (_dir, ctx) = test_context().await;
        let server = McpServer::new(ctx);

        let responses = exchange(
            &server,
            concat!(
                r#"{"jsonrpc":"2.0","method":"ping"}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":null,"method":"nope"}"#,
                "\n",
            ),
        )
        .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, Value::Null);
        assert!(responses[0].error.is_none());
        assert_eq!(responses[1].id, Value::Null);
        assert_eq!(responses[1].error.as_ref().unwrap().code, METHOD_NOT_FOUND);
    }

    #[test]
    fn test_request_id_presence() {
        let absent: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        assert_eq!(absent.id, None);

        let null: JsonRpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).unwrap();
        assert_eq!(null.id, Some(Value::Null));
    }

    #[tokio::test]
    async fn test_oversized_line_is_rejected_and_drained() {
        let (_dir, ctx) = test_context().await;
        let server = McpServer::new(ctx);

        let mut input = "x".repeat(MAX_LINE_SIZE + 10);
        input.push('\n');
        input.push_str(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#);
        input.push('\n');

        let responses = exchange(&server, &input).await;
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].error.as_ref().unwrap().code, INVALID_REQUEST);
        assert_eq!(responses[1].id, json!(7));
        assert!(responses[1].error.is_none());
    }
}
