//! End-to-end scenarios over the Streamable HTTP transport: a real axum
//! server on a loopback port, a real reqwest client on the other side.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use plexmcp_client::{CallToolOptions, Client, ToolOutcome};
use plexmcp_protocol::types::CallToolResult;
use plexmcp_protocol::Transport;
use plexmcp_server::{McpServer, ToolConfig};
use plexmcp_transport::{
    InMemoryEventStore, SessionManager, StreamableHttpClientConfig, StreamableHttpClientTransport,
    StreamableHttpServerConfig, StreamableHttpServerTransport,
};

fn echo_server() -> McpServer {
    let server = McpServer::builder("http-echo", "1.0.0").build();
    server
        .register_tool("echo", ToolConfig::default(), |args, _ctx| {
            Box::pin(async move {
                let message = args
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                Ok(CallToolResult::text(message))
            })
        })
        .unwrap();
    server
}

/// Bind the server on an ephemeral loopback port and return its URL.
async fn serve(server: &McpServer, session_timeout: Option<Duration>) -> (String, SessionManager) {
    let manager = SessionManager::new(session_timeout);
    let transport = StreamableHttpServerTransport::new(StreamableHttpServerConfig {
        stateful: true,
        session_manager: Some(manager.clone()),
        event_store: Some(Arc::new(InMemoryEventStore::default())),
        ..Default::default()
    });
    let router = transport.router();
    server.connect(transport).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://127.0.0.1:{}/", addr.port()), manager)
}

fn echo_args(message: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut args = serde_json::Map::new();
    args.insert("message".into(), json!(message));
    args
}

#[tokio::test]
async fn initialize_and_call_over_http() {
    let server = echo_server();
    let (url, _manager) = serve(&server, None).await;

    let transport = StreamableHttpClientTransport::new(StreamableHttpClientConfig::new(&url));
    let transport_handle = transport.clone();
    let client = Client::new("http-host", "0.1.0");
    client.connect(transport).await.unwrap();

    let init = client.initialize().await.unwrap();
    assert_eq!(init.server_info.name, "http-echo");
    let session = transport_handle.session_id().expect("session assigned");
    assert!(!session.is_empty());

    let outcome = client
        .call_tool("echo", Some(echo_args("over http")), CallToolOptions::default())
        .await
        .unwrap();
    match outcome {
        ToolOutcome::Inline(result) => {
            assert_eq!(result.content[0].as_text(), Some("over http"));
        }
        ToolOutcome::Task(_) => panic!("no task requested"),
    }
}

#[tokio::test]
async fn session_expiry_fires_recovery_and_reinit_gets_fresh_session() {
    let server = echo_server();
    let (url, _manager) = serve(&server, Some(Duration::from_millis(300))).await;

    let transport = StreamableHttpClientTransport::new(StreamableHttpClientConfig::new(&url));
    let transport_handle = transport.clone();
    let recoveries = Arc::new(AtomicUsize::new(0));
    let counter = recoveries.clone();
    transport_handle.on_session_recovery(move |_err| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let client = Client::new("http-host", "0.1.0");
    client.connect(transport).await.unwrap();
    client.initialize().await.unwrap();
    let first_session = transport_handle.session_id().unwrap();

    client
        .call_tool("echo", Some(echo_args("one")), CallToolOptions::default())
        .await
        .unwrap();

    // Let the session idle past its timeout.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let err = client
        .call_tool("echo", Some(echo_args("two")), CallToolOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.json_rpc_code(), -32001, "got {err:?}");
    assert_eq!(recoveries.load(Ordering::SeqCst), 1);

    // Recovery: re-initialize and get a fresh session.
    client.initialize().await.unwrap();
    let second_session = transport_handle.session_id().unwrap();
    assert_ne!(first_session, second_session);

    client
        .call_tool("echo", Some(echo_args("three")), CallToolOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn standalone_stream_carries_list_changed() {
    let server = echo_server();
    let (url, _manager) = serve(&server, None).await;

    let transport = StreamableHttpClientTransport::new(StreamableHttpClientConfig::new(&url));
    let transport_handle = transport.clone();
    let client = Client::new("http-host", "0.1.0");

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    client
        .protocol()
        .on_notification("notifications/tools/list_changed", move |_params, _extra| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

    client.connect(transport).await.unwrap();
    client.initialize().await.unwrap();
    transport_handle.start_standalone_stream();
    tokio::time::sleep(Duration::from_millis(100)).await;

    server
        .register_tool("late", ToolConfig::default(), |_args, _ctx| {
            Box::pin(async { Ok(CallToolResult::text("late")) })
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(notified.load(Ordering::SeqCst) >= 1);
}
