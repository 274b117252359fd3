use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::bridge::Dispatcher;
use crate::error::ErrorCode;
use crate::protocol::{
    encode_line, parse_request, DispatchRequest, RpcRequest, RpcResponse, METHOD_INITIALIZE,
    METHOD_PING, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, PROTOCOL_VERSION,
};

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    enabled_only: bool,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    #[serde(flatten)]
    request: DispatchRequest,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Serves the line protocol on top of a dispatcher.
pub struct RpcServer {
    dispatcher: Arc<Dispatcher>,
    permits: Arc<Semaphore>,
}

impl RpcServer {
    pub fn new(dispatcher: Arc<Dispatcher>, workers: usize) -> Self {
        Self {
            dispatcher,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Answer one request
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id;
        match request.method.as_str() {
            METHOD_INITIALIZE => RpcResponse::ok(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": { "tools": { "listChanged": false } },
                }),
            ),
            METHOD_PING => RpcResponse::ok(id, json!({})),
            METHOD_TOOLS_LIST => {
                let params: ListParams = match parse_params(request.params) {
                    Ok(p) => p,
                    Err(msg) => return RpcResponse::err(id, ErrorCode::InvalidParams, msg),
                };
                let tools: Vec<Value> = self
                    .dispatcher
                    .catalogue()
                    .list(params.category.as_deref())
                    .iter()
                    .filter(|d| !params.enabled_only || d.enabled)
                    .map(|d| d.to_listing())
                    .collect();
                RpcResponse::ok(id, json!({ "tools": tools }))
            }
            METHOD_TOOLS_CALL => {
                let params: CallParams = match parse_params(request.params) {
                    Ok(p) => p,
                    Err(msg) => return RpcResponse::err(id, ErrorCode::InvalidParams, msg),
                };
                let deadline = params.timeout_ms.map(Duration::from_millis);
                let result = self.dispatcher.dispatch(params.request, deadline).await;
                match serde_json::to_value(&result) {
                    Ok(v) => RpcResponse::ok(id, v),
                    Err(e) => RpcResponse::err(id, ErrorCode::HandlerError, e.to_string()),
                }
            }
            other => RpcResponse::err(
                id,
                ErrorCode::MethodNotFound,
                format!("unknown method '{}'", other),
            ),
        }
    }

    /// Serve one connection until the reader reaches end of stream.
    /// Requests run concurrently, bounded by the worker permits; responses
    /// are written in completion order.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<RpcResponse>(64);
        let write_task = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let line = match encode_line(&response) {
                    Ok(l) => l,
                    Err(e) => {
                        error!(error = %e, "failed to encode response");
                        continue;
                    }
                };
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        });

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let request = match parse_request(&line) {
                Ok(r) => r,
                Err(response) => {
                    warn!("rejecting malformed request");
                    if tx.send(response).await.is_err() {
                        break;
                    }
                    continue;
                }
            };
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            debug!(method = %request.method, "request received");
            let server = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let response = server.handle(request).await;
                let _ = tx.send(response).await;
                drop(permit);
            });
        }

        // Writer finishes once every in-flight request has answered
        drop(tx);
        match write_task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        }
    }

    /// Serve on stdin/stdout
    pub async fn serve_stdio(self: Arc<Self>) -> std::io::Result<()> {
        info!("serving on stdio");
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Accept TCP connections until shutdown is signalled
    pub async fn serve_tcp(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "serving on tcp");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    info!(peer = %peer, "client connected");
                    let server = self.clone();
                    tokio::spawn(async move {
                        let (r, w) = stream.into_split();
                        if let Err(e) = server.serve(r, w).await {
                            warn!(peer = %peer, error = %e, "connection ended with error");
                        }
                        info!(peer = %peer, "client disconnected");
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("tcp server stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Missing params are treated as an empty object
fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, String> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgePolicy;
    use crate::store::MemoryConfigStore;
    use crate::tools::builtin::register_builtin_tools;
    use crate::tools::registry::Catalogue;
    use crate::transport::{DefaultConnector, LineChannel, RemoteChannel};

    fn server() -> Arc<RpcServer> {
        let cat = Arc::new(Catalogue::new(Arc::new(MemoryConfigStore::new())));
        register_builtin_tools(&cat).unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            cat,
            Arc::new(DefaultConnector::new(Duration::from_millis(100))),
            BridgePolicy::default(),
        ));
        Arc::new(RpcServer::new(dispatcher, 4))
    }

    #[tokio::test]
    async fn test_handle_methods() {
        let s = server();
        let init = s.handle(RpcRequest::new(METHOD_INITIALIZE, Value::Null, json!(1))).await;
        assert_eq!(init.result.unwrap()["protocolVersion"], PROTOCOL_VERSION);

        let list = s
            .handle(RpcRequest::new(METHOD_TOOLS_LIST, json!({"category": "utility"}), json!(2)))
            .await;
        let tools = list.result.unwrap()["tools"].as_array().unwrap().clone();
        assert_eq!(tools.len(), 2);

        let unknown = s.handle(RpcRequest::new("nope", Value::Null, json!(3))).await;
        assert_eq!(unknown.error.unwrap().code, ErrorCode::MethodNotFound);
    }

    #[tokio::test]
    async fn test_tools_call_bad_params() {
        let s = server();
        let resp = s
            .handle(RpcRequest::new(METHOD_TOOLS_CALL, json!({"arguments": {}}), json!(1)))
            .await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidParams);
    }

    #[tokio::test]
    async fn test_list_enabled_only() {
        let s = server();
        s.dispatcher.catalogue().set_enabled("echo", false, "t").unwrap();
        let all = s
            .handle(RpcRequest::new(METHOD_TOOLS_LIST, Value::Null, json!(1)))
            .await
            .result
            .unwrap();
        let enabled = s
            .handle(RpcRequest::new(METHOD_TOOLS_LIST, json!({"enabled_only": true}), json!(2)))
            .await
            .result
            .unwrap();
        let n = |v: &Value| v["tools"].as_array().map(|a| a.len()).unwrap_or(0);
        assert_eq!(n(&all), n(&enabled) + 1);
        let echo = all["tools"]
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["name"] == "echo")
            .cloned()
            .unwrap();
        assert_eq!(echo["enabled"], false);
    }

    #[tokio::test]
    async fn test_serve_over_duplex() {
        let s = server();
        let (client, server_end) = tokio::io::duplex(8192);
        let (sr, sw) = tokio::io::split(server_end);
        let serving = tokio::spawn(s.serve(sr, sw));

        let (cr, cw) = tokio::io::split(client);
        let channel = LineChannel::new(cr, cw);
        let resp = channel
            .call(RpcRequest::new(
                METHOD_TOOLS_CALL,
                json!({"tool_name": "echo", "arguments": {"msg": "hi"}, "request_id": "r1"}),
                json!(9),
            ))
            .await
            .unwrap();
        assert_eq!(resp.id, json!(9));
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "ok");
        assert_eq!(result["payload"], json!({"msg": "hi"}));
        assert_eq!(result["request_id"], "r1");

        drop(channel);
        serving.await.unwrap().unwrap();
    }
}
