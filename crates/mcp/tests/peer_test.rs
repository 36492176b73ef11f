//! Integration tests for the duplex peer: both sides of one stream
//! originating requests, including a reverse request issued while an
//! inbound request is still being handled.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use metronome_mcp::transport::ChannelTransport;
use metronome_mcp::{CreateMessageParams, McpError, McpPeer, RequestHandler, SamplingClient};

/// Server-side handler: answering `run` requires a sampling round trip
/// back to the requesting peer.
struct ServerHandler {
    peer: OnceLock<Arc<McpPeer>>,
}

#[async_trait]
impl RequestHandler for ServerHandler {
    async fn handle(&self, method: &str, _params: Option<Value>) -> Result<Value, McpError> {
        match method {
            "run" => {
                let peer = self.peer.get().expect("peer wired");
                let result = peer
                    .create_message(
                        CreateMessageParams::user_text("ping", 2000),
                        Duration::from_secs(1),
                    )
                    .await?;
                Ok(serde_json::json!({ "sampled": result.content_text() }))
            }
            other => Err(McpError::MethodNotFound(other.to_string())),
        }
    }
}

/// Client-side handler: plays the model, answering sampling requests.
struct ClientHandler;

#[async_trait]
impl RequestHandler for ClientHandler {
    async fn handle(&self, method: &str, _params: Option<Value>) -> Result<Value, McpError> {
        match method {
            "sampling/createMessage" => Ok(serde_json::json!({
                "model": "stub-model",
                "role": "assistant",
                "content": {"type": "text", "text": "pong"},
            })),
            other => Err(McpError::MethodNotFound(other.to_string())),
        }
    }
}

#[tokio::test]
async fn reverse_request_inside_inbound_request() {
    let ((server_rx, server_tx), (client_rx, client_tx)) = ChannelTransport::pair();

    let server_handler = Arc::new(ServerHandler {
        peer: OnceLock::new(),
    });
    let server = McpPeer::spawn(server_rx, server_tx, server_handler.clone());
    server_handler.peer.set(Arc::clone(&server)).ok();

    let client = McpPeer::spawn(client_rx, client_tx, Arc::new(ClientHandler));

    // The client's `run` call only completes if the server's nested sampling
    // request is serviced while `run` is still in flight.
    let result = client
        .request("run", None, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!({"sampled": "pong"}));
}

#[tokio::test]
async fn sampling_timeout_when_client_never_answers() {
    struct SilentHandler;

    #[async_trait]
    impl RequestHandler for SilentHandler {
        async fn handle(&self, _method: &str, _params: Option<Value>) -> Result<Value, McpError> {
            // Never respond in a useful time.
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    let ((server_rx, server_tx), (client_rx, client_tx)) = ChannelTransport::pair();
    let server = McpPeer::spawn(server_rx, server_tx, Arc::new(ClientHandler));
    let _client = McpPeer::spawn(client_rx, client_tx, Arc::new(SilentHandler));

    let err = server
        .create_message(
            CreateMessageParams::user_text("ping", 2000),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Timeout(_)));
}
