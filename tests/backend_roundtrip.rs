use mcp_agent::config::{BackendConfig, TransportKind};
use mcp_agent::session::{Session, SessionError, SessionTransport};
use mcp_agent::supervisor;
use mcp_agent::registry::CapabilityRegistry;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn backend_config(key: &str, transport: TransportKind, port: u16) -> BackendConfig {
    BackendConfig {
        key: key.to_string(),
        command: PathBuf::from(env!("CARGO_BIN_EXE_mock-backend")),
        args: Vec::new(),
        env: HashMap::new(),
        workdir: None,
        transport,
        host: "127.0.0.1".to_string(),
        port,
        readiness_wait: Duration::from_millis(400),
        invoke_timeout: Duration::from_secs(5),
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

#[tokio::test]
async fn stdio_backend_full_roundtrip() {
    let config = backend_config("mock", TransportKind::Stdio, 0);
    let mut process = supervisor::launch(&config).await.expect("launch backend");

    let (stdin, stdout) = process.take_stdio().expect("stdio pipes");
    let session = Session::connect(
        "mock",
        SessionTransport::Stdio { stdin, stdout },
        config.invoke_timeout,
    )
    .await
    .expect("connect");
    let session = Arc::new(session);

    let registry = CapabilityRegistry::default();
    let count = registry
        .discover_and_register("mock", session.clone())
        .await
        .expect("discovery");
    assert_eq!(count, 2);
    assert!(registry.contains("notion_read"));
    assert!(registry.contains("fs_read"));

    let payload = registry
        .invoke("notion_read", json!({"page_id": "example_page_123"}))
        .await;
    let rendered = payload.to_string();
    assert!(rendered.contains("example_page_123"), "payload: {rendered}");

    // A name the peer does not serve degrades to an error payload.
    let missing = registry.invoke("made_up", json!({})).await;
    assert!(missing["error"].as_str().expect("error text").contains("made_up"));

    session.close().await;
    session.close().await;

    process.terminate().await;
    process.terminate().await;
}

#[tokio::test]
async fn tcp_backend_serves_capabilities() {
    let port = free_port();
    let config = backend_config("mock-tcp", TransportKind::Tcp, port);
    let mut process = supervisor::launch(&config).await.expect("launch backend");

    let session = Session::connect(
        "mock-tcp",
        SessionTransport::Tcp {
            host: config.host.clone(),
            port,
        },
        config.invoke_timeout,
    )
    .await
    .expect("connect over tcp");

    let capabilities = session.list_capabilities().await.expect("listing");
    let names: Vec<_> = capabilities.iter().map(|c| c.name.as_str()).collect();
    assert!(names.contains(&"notion_read"));
    assert!(names.contains(&"fs_read"));

    let payload = session
        .invoke("fs_read", json!({"path": "/example/file.txt"}))
        .await
        .expect("invoke");
    assert!(payload.to_string().contains("Hello from the file system!"));

    session.close().await;
    process.terminate().await;
}

#[tokio::test]
async fn unreachable_endpoint_is_a_retryable_connection_error() {
    let port = free_port();
    let result = Session::connect(
        "ghost",
        SessionTransport::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        },
        Duration::from_secs(1),
    )
    .await;

    match result {
        Err(err @ SessionError::Connection { .. }) => assert!(err.is_retryable()),
        Err(other) => panic!("expected connection error, got {other}"),
        Ok(_) => panic!("connect to a dead endpoint succeeded"),
    }
}
