//! Dispatch bridge: routes a tool call to its local handler or across a
//! remote channel, under one deadline.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::{ToolError, ToolResult};
use crate::metrics::Metrics;
use crate::protocol::{DispatchRequest, DispatchResult, RpcRequest, RpcResponse, METHOD_TOOLS_CALL};
use crate::tools::registry::{Catalogue, CatalogueEntry};
use crate::tools::{Arguments, HandlerLocation};
use crate::transport::{Connector, RemoteChannel, TransportError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BridgePolicy {
    /// Deadline when the caller gives none
    pub timeout: Duration,
    /// Connection attempts before `BridgeUnavailable`
    pub attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for BridgePolicy {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for BridgePolicy {
    fn from(c: &BridgeConfig) -> Self {
        Self {
            timeout: c.timeout(),
            attempts: c.attempts.max(1),
            backoff_base: Duration::from_millis(c.backoff_base_ms),
            backoff_max: Duration::from_millis(c.backoff_max_ms),
        }
    }
}

impl BridgePolicy {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

pub struct Dispatcher {
    catalogue: Arc<Catalogue>,
    connector: Arc<dyn Connector>,
    policy: BridgePolicy,
    channels: Mutex<HashMap<String, Arc<dyn RemoteChannel>>>,
    metrics: Mutex<Metrics>,
}

impl Dispatcher {
    pub fn new(catalogue: Arc<Catalogue>, connector: Arc<dyn Connector>, policy: BridgePolicy) -> Self {
        Self {
            catalogue,
            connector,
            policy,
            channels: Mutex::new(HashMap::new()),
            metrics: Mutex::new(Metrics::new()),
        }
    }

    pub fn catalogue(&self) -> &Arc<Catalogue> {
        &self.catalogue
    }

    pub fn policy(&self) -> &BridgePolicy {
        &self.policy
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.lock().clone()
    }

    /// Dispatch and wrap the outcome as a normalized result.
    pub async fn dispatch(&self, request: DispatchRequest, deadline: Option<Duration>) -> DispatchResult {
        let outcome = self
            .call(&request.tool_name, request.arguments, deadline)
            .await;
        DispatchResult::from_outcome(request.request_id, outcome)
    }

    /// Look up, check and execute a tool. Always returns within the deadline.
    pub async fn call(
        &self,
        name: &str,
        args: Arguments,
        deadline: Option<Duration>,
    ) -> ToolResult<Value> {
        let started = Instant::now();
        let limit = deadline.unwrap_or(self.policy.timeout);
        let outcome = self.call_inner(name, args, started + limit, limit).await;

        let elapsed = started.elapsed();
        let mut metrics = self.metrics.lock();
        match &outcome {
            Ok(_) => {
                metrics.record_success(name, elapsed);
                debug!(tool = %name, elapsed_ms = elapsed.as_millis() as u64, "dispatch ok");
            }
            Err(e) => {
                metrics.record_failure(name, e.code(), elapsed);
                debug!(tool = %name, code = %e.code(), error = %e, "dispatch failed");
            }
        }
        outcome
    }

    async fn call_inner(
        &self,
        name: &str,
        args: Arguments,
        deadline: Instant,
        limit: Duration,
    ) -> ToolResult<Value> {
        let entry = self.catalogue.resolve(name)?;
        if !entry.descriptor.enabled {
            return Err(ToolError::ToolDisabled(name.to_string()));
        }
        entry
            .descriptor
            .parameter_schema
            .check(&args)
            .map_err(ToolError::Validation)?;

        match &entry.descriptor.handler_location {
            HandlerLocation::Local => self.call_local(&entry, args, deadline, limit).await,
            HandlerLocation::Remote { endpoint } => {
                self.metrics.lock().record_remote();
                self.call_remote(endpoint, name, args, deadline, limit).await
            }
        }
    }

    async fn call_local(
        &self,
        entry: &CatalogueEntry,
        args: Arguments,
        deadline: Instant,
        limit: Duration,
    ) -> ToolResult<Value> {
        let handler = entry
            .handler
            .clone()
            .ok_or_else(|| ToolError::Handler(format!("tool '{}' has no handler", entry.descriptor.name)))?;
        let mut task = tokio::spawn(async move { handler.call(args).await });

        match timeout_at(deadline, &mut task).await {
            Err(_) => {
                task.abort();
                warn!(tool = %entry.descriptor.name, "local handler timed out, task aborted");
                Err(ToolError::Timeout(limit))
            }
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(ToolError::Handler(e.to_string())),
            Ok(Err(join)) if join.is_panic() => {
                warn!(tool = %entry.descriptor.name, "local handler panicked");
                Err(ToolError::Handler("handler panicked".into()))
            }
            Ok(Err(_)) => Err(ToolError::Handler("handler cancelled".into())),
        }
    }

    async fn call_remote(
        &self,
        endpoint: &str,
        name: &str,
        args: Arguments,
        deadline: Instant,
        limit: Duration,
    ) -> ToolResult<Value> {
        let request = RpcRequest::new(
            METHOD_TOOLS_CALL,
            json!({
                "tool_name": name,
                "arguments": args,
                "request_id": uuid::Uuid::new_v4().to_string(),
            }),
            Value::Null,
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            let failure = match self.channel(endpoint, deadline).await {
                Ok(channel) => match timeout_at(deadline, channel.call(request.clone())).await {
                    Err(_) => return Err(ToolError::Timeout(limit)),
                    Ok(Ok(response)) => return decode_response(response),
                    Ok(Err(e)) => {
                        self.forget(endpoint);
                        e
                    }
                },
                Err(Some(e)) => e,
                Err(None) => return Err(ToolError::Timeout(limit)),
            };

            if attempt >= self.policy.attempts {
                warn!(endpoint = %endpoint, attempts = attempt, error = %failure, "remote tool host unavailable");
                return Err(ToolError::BridgeUnavailable {
                    endpoint: endpoint.to_string(),
                    attempts: attempt,
                });
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                endpoint = %endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "remote call failed, retrying"
            );
            self.metrics.lock().record_retry();
            let wake = Instant::now() + delay;
            if wake >= deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(ToolError::Timeout(limit));
            }
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Cached channel for an endpoint, connecting if needed. `Err(None)`
    /// means the deadline passed while connecting. The cache lock is never
    /// held across a connect, so a slow endpoint cannot stall the others.
    async fn channel(
        &self,
        endpoint: &str,
        deadline: Instant,
    ) -> Result<Arc<dyn RemoteChannel>, Option<TransportError>> {
        if let Some(ch) = self.cached(endpoint) {
            return Ok(ch);
        }
        let channel = timeout_at(deadline, self.connector.connect(endpoint))
            .await
            .map_err(|_| None)?
            .map_err(Some)?;

        let mut channels = self.channels.lock();
        // Another caller may have connected meanwhile; keep the first live one
        if let Some(existing) = channels.get(endpoint).filter(|ch| !ch.is_closed()) {
            return Ok(existing.clone());
        }
        info!(endpoint = %endpoint, "remote channel opened");
        channels.insert(endpoint.to_string(), channel.clone());
        Ok(channel)
    }

    fn cached(&self, endpoint: &str) -> Option<Arc<dyn RemoteChannel>> {
        let mut channels = self.channels.lock();
        match channels.get(endpoint) {
            Some(ch) if !ch.is_closed() => Some(ch.clone()),
            Some(_) => {
                channels.remove(endpoint);
                None
            }
            None => None,
        }
    }

    fn forget(&self, endpoint: &str) {
        self.channels.lock().remove(endpoint);
    }
}

fn decode_response(response: RpcResponse) -> ToolResult<Value> {
    if let Some(err) = response.error {
        return Err(ToolError::from_wire(err.code, err.message));
    }
    let result = response
        .result
        .ok_or_else(|| ToolError::Handler("remote response has neither result nor error".into()))?;
    let dispatch: DispatchResult = serde_json::from_value(result)
        .map_err(|e| ToolError::Handler(format!("malformed remote result: {}", e)))?;
    dispatch.into_outcome()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConfigStore;
    use crate::tools::{handler_fn, HandlerError, ParamSchema, ParamType, ToolDescriptor};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RefusingConnector {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, endpoint: &str) -> Result<Arc<dyn RemoteChannel>, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            })
        }
    }

    /// Connects nothing; `tcp://slow:1` hangs, everything else is refused
    struct StallingConnector;

    #[async_trait]
    impl Connector for StallingConnector {
        async fn connect(&self, endpoint: &str) -> Result<Arc<dyn RemoteChannel>, TransportError> {
            if endpoint == "tcp://slow:1" {
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
            Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            })
        }
    }

    fn policy() -> BridgePolicy {
        BridgePolicy {
            timeout: Duration::from_secs(5),
            attempts: 3,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
        }
    }

    fn args(v: Value) -> Arguments {
        v.as_object().cloned().unwrap()
    }

    fn setup() -> (Dispatcher, Arc<RefusingConnector>, Arc<AtomicUsize>) {
        let cat = Arc::new(Catalogue::new(Arc::new(MemoryConfigStore::new())));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        cat.register(
            ToolDescriptor::local("echo", "utility", "")
                .with_schema(ParamSchema::new().required("msg", ParamType::String, "")),
            Some(handler_fn(move |a: Arguments| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, HandlerError>(Value::Object(a)) }
            })),
            false,
        )
        .unwrap();
        cat.register(
            ToolDescriptor::local("slow", "utility", ""),
            Some(handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, HandlerError>(Value::Null)
            })),
            false,
        )
        .unwrap();
        cat.register(
            ToolDescriptor::local("fail", "utility", ""),
            Some(handler_fn(|_| async { Err::<Value, HandlerError>("boom".into()) })),
            false,
        )
        .unwrap();
        cat.register(
            ToolDescriptor::local("panics", "utility", ""),
            Some(handler_fn(|_| async {
                if true {
                    panic!("handler bug");
                }
                Ok::<_, HandlerError>(Value::Null)
            })),
            false,
        )
        .unwrap();
        cat.register(
            ToolDescriptor::remote("far", "remote", "", "tcp://127.0.0.1:1"),
            None,
            false,
        )
        .unwrap();
        let connector = Arc::new(RefusingConnector {
            attempts: AtomicUsize::new(0),
        });
        (Dispatcher::new(cat, connector.clone(), policy()), connector, calls)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(10));
        assert_eq!(p.backoff(2), Duration::from_millis(20));
        assert_eq!(p.backoff(3), Duration::from_millis(40));
        assert_eq!(p.backoff(10), Duration::from_millis(40));
        assert_eq!(p.backoff(64), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_echo_dispatch() {
        let (d, _, _) = setup();
        let result = d
            .dispatch(DispatchRequest::new("echo", args(json!({"msg": "hi"}))), None)
            .await;
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["payload"], json!({"msg": "hi"}));
    }

    #[tokio::test]
    async fn test_not_found_disabled_and_invalid() {
        let (d, _, calls) = setup();
        assert!(matches!(
            d.call("nope", Arguments::new(), None).await,
            Err(ToolError::NotFound(_))
        ));
        assert!(matches!(
            d.call("echo", args(json!({"msg": 1})), None).await,
            Err(ToolError::Validation(_))
        ));

        d.catalogue().set_enabled("echo", false, "test").unwrap();
        assert!(matches!(
            d.call("echo", args(json!({"msg": "hi"})), None).await,
            Err(ToolError::ToolDisabled(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic() {
        let (d, _, _) = setup();
        assert_eq!(
            d.call("fail", Arguments::new(), None).await,
            Err(ToolError::Handler("boom".into()))
        );
        assert!(matches!(
            d.call("panics", Arguments::new(), None).await,
            Err(ToolError::Handler(_))
        ));
    }

    #[tokio::test]
    async fn test_local_timeout() {
        let (d, _, _) = setup();
        let started = std::time::Instant::now();
        let res = d
            .call("slow", Arguments::new(), Some(Duration::from_millis(50)))
            .await;
        assert_eq!(res, Err(ToolError::Timeout(Duration::from_millis(50))));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(d.metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_unreachable_remote_retries_then_unavailable() {
        let (d, connector, _) = setup();
        let started = std::time::Instant::now();
        let res = d.call("far", Arguments::new(), None).await;
        assert_eq!(
            res,
            Err(ToolError::BridgeUnavailable {
                endpoint: "tcp://127.0.0.1:1".into(),
                attempts: 3
            })
        );
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(d.metrics().retries, 2);
    }

    #[tokio::test]
    async fn test_short_deadline_beats_retries() {
        let (d, _, _) = setup();
        let res = d
            .call("far", Arguments::new(), Some(Duration::from_millis(15)))
            .await;
        assert_eq!(res, Err(ToolError::Timeout(Duration::from_millis(15))));
    }

    #[tokio::test]
    async fn test_slow_endpoint_does_not_block_others() {
        let cat = Arc::new(Catalogue::new(Arc::new(MemoryConfigStore::new())));
        for (name, endpoint) in [("slow", "tcp://slow:1"), ("fast", "tcp://fast:1")] {
            cat.register(ToolDescriptor::remote(name, "remote", "", endpoint), None, false)
                .unwrap();
        }
        let d = Arc::new(Dispatcher::new(cat, Arc::new(StallingConnector), policy()));

        let slow = {
            let d = d.clone();
            tokio::spawn(async move {
                d.call("slow", Arguments::new(), Some(Duration::from_secs(2))).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let res = d
            .call("fast", Arguments::new(), Some(Duration::from_millis(500)))
            .await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(matches!(res, Err(ToolError::BridgeUnavailable { attempts: 3, .. })));

        slow.abort();
    }

    #[tokio::test]
    async fn test_unknown_names_do_not_grow_per_tool_metrics() {
        let (d, _, _) = setup();
        for i in 0..200 {
            let res = d.call(&format!("no_such_tool_{}", i), Arguments::new(), None).await;
            assert!(matches!(res, Err(ToolError::NotFound(_))));
        }
        let metrics = d.metrics();
        assert!(metrics.per_tool.is_empty());
        assert_eq!(metrics.errors["NotFound"], 200);
    }
}
