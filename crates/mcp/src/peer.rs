//! Bidirectional MCP peer.
//!
//! One transport carries both directions of traffic: the client's tool calls
//! arrive as requests we must answer, and our `sampling/createMessage` calls
//! go out as requests the client answers. [`McpPeer`] owns the read half in
//! a background task that routes each inbound line: responses are matched to
//! pending outbound requests by id, requests are dispatched to a
//! [`RequestHandler`] on their own task (so a slow tool call never blocks
//! the sampling response it is waiting for), and notifications are handed to
//! the handler without a reply. All writes funnel through an mpsc-fed writer
//! task, which keeps message framing atomic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

use crate::error::McpError;
use crate::transport::{TransportRead, TransportWrite};
use crate::types::{
    CreateMessageParams, CreateMessageResult, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RpcId,
};

/// Handles requests and notifications initiated by the remote peer.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle an inbound request. `Ok` becomes the JSON-RPC result,
    /// `Err` is mapped to a JSON-RPC error object.
    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, McpError>;

    /// Handle an inbound notification (no response is sent).
    async fn handle_notification(&self, method: &str, _params: Option<Value>) {
        debug!(method = %method, "ignoring notification");
    }
}

/// The outbound sampling seam: issue `sampling/createMessage` to the peer
/// and await the generated text under a deadline.
#[async_trait]
pub trait SamplingClient: Send + Sync {
    async fn create_message(
        &self,
        params: CreateMessageParams,
        timeout: Duration,
    ) -> Result<CreateMessageResult, McpError>;
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// A connected MCP peer: issue requests with [`request`](Self::request),
/// receive them through the [`RequestHandler`] given at spawn time.
pub struct McpPeer {
    out_tx: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicI64,
    closed_rx: watch::Receiver<bool>,
    read_handle: tokio::task::JoinHandle<()>,
    write_handle: tokio::task::JoinHandle<()>,
}

impl McpPeer {
    /// Spawn the read and write loops over the given transport halves.
    pub fn spawn<R, W>(reader: R, writer: W, handler: Arc<dyn RequestHandler>) -> Arc<Self>
    where
        R: TransportRead + 'static,
        W: TransportWrite + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (out_tx, out_rx) = mpsc::channel::<String>(256);
        let (closed_tx, closed_rx) = watch::channel(false);

        let write_handle = tokio::spawn(Self::write_loop(writer, out_rx));
        let read_handle = tokio::spawn(Self::read_loop(
            reader,
            handler,
            Arc::clone(&pending),
            out_tx.clone(),
            closed_tx,
        ));

        Arc::new(Self {
            out_tx,
            pending,
            next_id: AtomicI64::new(1),
            closed_rx,
            read_handle,
            write_handle,
        })
    }

    /// Send a request and await the matching response by id.
    ///
    /// Returns [`McpError::Timeout`] if no response arrives in `timeout`,
    /// [`McpError::Peer`] if the peer answered with a JSON-RPC error, and
    /// [`McpError::PeerClosed`] if the transport went away.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = JsonRpcRequest::new(RpcId::Number(id), method, params);
        let json = serde_json::to_string(&request)?;
        debug!(method = %method, id = id, "sending request");

        if self.out_tx.send(json).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(McpError::PeerClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(err) = response.error {
                    return Err(McpError::Peer {
                        code: err.code,
                        message: err.message,
                    });
                }
                Ok(response.result.unwrap_or(Value::Null))
            }
            Ok(Err(_)) => Err(McpError::PeerClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout(timeout))
            }
        }
    }

    /// Wait until the transport closes (client EOF or read error).
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Abort both loops. Outstanding requests fail with `PeerClosed`.
    pub fn shutdown(&self) {
        self.read_handle.abort();
        self.write_handle.abort();
    }

    async fn write_loop<W: TransportWrite>(mut writer: W, mut out_rx: mpsc::Receiver<String>) {
        while let Some(line) = out_rx.recv().await {
            if let Err(e) = writer.send(&line).await {
                warn!(error = %e, "transport write failed");
                break;
            }
        }
    }

    async fn read_loop<R: TransportRead>(
        mut reader: R,
        handler: Arc<dyn RequestHandler>,
        pending: PendingMap,
        out_tx: mpsc::Sender<String>,
        closed_tx: watch::Sender<bool>,
    ) {
        loop {
            let line = match reader.receive().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("transport closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "transport read failed");
                    break;
                }
            };

            let raw: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "failed to parse inbound JSON");
                    let resp = JsonRpcResponse::error(
                        RpcId::Number(0),
                        McpError::JsonParse(e).to_rpc_error().code,
                        "parse error",
                    );
                    Self::enqueue(&out_tx, &resp).await;
                    continue;
                }
            };

            let has_id = raw.get("id").is_some();
            let has_method = raw.get("method").is_some();

            if has_method && has_id {
                // Inbound request: dispatch on its own task so handling never
                // blocks this loop (a sampling response may be right behind).
                match serde_json::from_value::<JsonRpcRequest>(raw) {
                    Ok(request) => {
                        let handler = Arc::clone(&handler);
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            let id = request.id.clone();
                            let response =
                                match handler.handle(&request.method, request.params).await {
                                    Ok(result) => JsonRpcResponse::success(id, result),
                                    Err(e) => {
                                        let rpc_err = e.to_rpc_error();
                                        JsonRpcResponse::error(id, rpc_err.code, rpc_err.message)
                                    }
                                };
                            Self::enqueue(&out_tx, &response).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "malformed inbound request");
                    }
                }
            } else if has_method {
                // Notification.
                if let Ok(notif) = serde_json::from_value::<JsonRpcNotification>(raw) {
                    handler.handle_notification(&notif.method, notif.params).await;
                }
            } else if has_id {
                // Response to one of our requests.
                match serde_json::from_value::<JsonRpcResponse>(raw) {
                    Ok(response) => Self::dispatch_response(&pending, response).await,
                    Err(e) => warn!(error = %e, "malformed inbound response"),
                }
            } else {
                warn!("inbound message with neither id nor method, ignoring");
            }
        }

        // Fail every outstanding request by dropping its sender.
        pending.lock().await.clear();
        let _ = closed_tx.send(true);
    }

    /// Route a response to the caller registered under its id.
    async fn dispatch_response(pending: &PendingMap, response: JsonRpcResponse) {
        let id = match &response.id {
            RpcId::Number(n) => *n,
            RpcId::String(s) => {
                warn!(id = %s, "response with string id does not match any request");
                return;
            }
        };
        match pending.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(id = id, "response for unknown or expired request id"),
        }
    }

    async fn enqueue(out_tx: &mpsc::Sender<String>, response: &JsonRpcResponse) {
        match serde_json::to_string(response) {
            Ok(json) => {
                if out_tx.send(json).await.is_err() {
                    warn!("write loop gone, dropping response");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize response"),
        }
    }
}

#[async_trait]
impl SamplingClient for McpPeer {
    async fn create_message(
        &self,
        params: CreateMessageParams,
        timeout: Duration,
    ) -> Result<CreateMessageResult, McpError> {
        let params = serde_json::to_value(&params)?;
        let result = self
            .request("sampling/createMessage", Some(params), timeout)
            .await?;
        Ok(serde_json::from_value(result)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
            match method {
                "echo" => Ok(params.unwrap_or(Value::Null)),
                other => Err(McpError::MethodNotFound(other.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let ((rx_a, tx_a), (rx_b, tx_b)) = ChannelTransport::pair();
        let a = McpPeer::spawn(rx_a, tx_a, Arc::new(EchoHandler));
        let _b = McpPeer::spawn(rx_b, tx_b, Arc::new(EchoHandler));

        let result = a
            .request(
                "echo",
                Some(serde_json::json!({"hello": "world"})),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn test_method_not_found_surfaces_as_peer_error() {
        let ((rx_a, tx_a), (rx_b, tx_b)) = ChannelTransport::pair();
        let a = McpPeer::spawn(rx_a, tx_a, Arc::new(EchoHandler));
        let _b = McpPeer::spawn(rx_b, tx_b, Arc::new(EchoHandler));

        let err = a
            .request("no/such/method", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            McpError::Peer { code, .. } => {
                assert_eq!(code, crate::types::error_codes::METHOD_NOT_FOUND)
            }
            other => panic!("expected Peer error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_timeout_cleans_pending() {
        // No peer on the other side: the request can never be answered.
        let ((rx_a, tx_a), (_rx_b, _tx_b)) = ChannelTransport::pair();
        let a = McpPeer::spawn(rx_a, tx_a, Arc::new(EchoHandler));

        let err = a
            .request("echo", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout(_)));
        assert!(a.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_closed_resolves_on_peer_drop() {
        let ((rx_a, tx_a), (rx_b, tx_b)) = ChannelTransport::pair();
        let a = McpPeer::spawn(rx_a, tx_a, Arc::new(EchoHandler));

        drop(rx_b);
        drop(tx_b);
        tokio::time::timeout(Duration::from_secs(1), a.closed())
            .await
            .expect("closed() should resolve after peer drop");
    }
}
