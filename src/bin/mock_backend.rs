use clap::{Parser, ValueEnum};
use serde_json::{Value, json};
use std::error::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

const PROTOCOL_VERSION: &str = "2025-06-18";
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Parser, Debug)]
#[command(name = "mock-backend", version, about = "Mock MCP tool backend")]
struct Cli {
    #[arg(long, value_enum, default_value_t = Transport::Stdio)]
    transport: Transport,
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Transport {
    Stdio,
    Tcp,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // stdout is the protocol channel; diagnostics go to stderr only.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.transport {
        Transport::Stdio => {
            info!("mock backend serving over stdio");
            serve(tokio::io::stdin(), tokio::io::stdout()).await?;
        }
        Transport::Tcp => {
            let listener = TcpListener::bind((cli.host.as_str(), cli.port)).await?;
            info!(host = %cli.host, port = cli.port, "mock backend listening");
            loop {
                let (stream, peer) = listener.accept().await?;
                info!(%peer, "connection accepted");
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    if let Err(err) = serve(reader, writer).await {
                        warn!(%peer, %err, "connection ended with error");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn serve(
    reader: impl AsyncRead + Unpin,
    writer: impl AsyncWrite + Unpin,
) -> Result<(), Box<dyn Error>> {
    let mut lines = BufReader::new(reader).lines();
    let mut writer = BufWriter::new(writer);

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "dropping unparseable line");
                continue;
            }
        };
        if let Some(reply) = handle(&message) {
            let mut payload = serde_json::to_vec(&reply)?;
            payload.push(b'\n');
            writer.write_all(&payload).await?;
            writer.flush().await?;
        }
    }
    info!("peer closed the stream");
    Ok(())
}

fn handle(message: &Value) -> Option<Value> {
    let method = message.get("method").and_then(Value::as_str)?;
    let id = message.get("id").cloned();

    match method {
        "initialize" => Some(result(id?, json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": {"name": "mock-backend", "version": env!("CARGO_PKG_VERSION")},
            "capabilities": {"tools": {}},
        }))),
        "notifications/initialized" => None,
        "tools/list" => Some(result(id?, json!({"tools": tool_listing()}))),
        "tools/call" => {
            let id = id?;
            let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            Some(call_tool(id, name, &arguments))
        }
        other => {
            warn!(method = other, "unknown method");
            id.map(|id| {
                error(id, METHOD_NOT_FOUND, &format!("method '{other}' not found"))
            })
        }
    }
}

fn tool_listing() -> Value {
    json!([
        {
            "name": "notion_read",
            "description": "Reads content from a Notion page by its id.",
            "inputSchema": {
                "type": "object",
                "properties": {"page_id": {"type": "string"}},
                "required": ["page_id"],
            },
        },
        {
            "name": "fs_read",
            "description": "Reads the content of a file from the file system.",
            "inputSchema": {
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            },
        },
    ])
}

fn call_tool(id: Value, name: &str, arguments: &Value) -> Value {
    match name {
        "notion_read" => {
            let page_id = arguments.get("page_id").and_then(Value::as_str).unwrap_or("");
            text_result(
                id,
                format!("Mock content of Notion page: {page_id}. Lorem ipsum dolor sit amet."),
            )
        }
        "fs_read" => {
            let path = arguments.get("path").and_then(Value::as_str).unwrap_or("");
            if path == "/example/file.txt" {
                text_result(
                    id,
                    format!("Mock content from {path}: Hello from the file system!"),
                )
            } else {
                text_result(id, format!("Error: file '{path}' not found"))
            }
        }
        other => error(id, METHOD_NOT_FOUND, &format!("unknown tool '{other}'")),
    }
}

fn text_result(id: Value, text: String) -> Value {
    result(id, json!({"content": [{"type": "text", "text": text}]}))
}

fn result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}
