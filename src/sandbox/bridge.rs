//! Capability Bridge
//!
//! Executed code calls external tools through `mcp_call(server, tool, params)`.
//! Inside the isolate that is a blocking call; on the host each request is
//! served by a task on the bridge's `JoinSet`, with a semaphore bounding how
//! many dispatches run at once.
//!
//! Wire format on the per-isolate unix socket: one JSON object per line.
//!
//! ```text
//! → {"id": 1, "server": "calculator", "tool": "add", "params": {"a": 1, "b": 2}}
//! ← {"id": 1, "ok": true, "result": 3}
//! ← {"id": 1, "ok": false, "error": "..."}
//! ```

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Routes capability calls made by executed code
#[async_trait]
pub trait CapabilityDispatcher: Send + Sync {
    async fn call(&self, server: &str, tool: &str, params: Value) -> anyhow::Result<Value>;
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// In-process capability handlers keyed by (server, tool)
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    handlers: HashMap<(String, String), Handler>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler
    pub fn register<F, Fut>(&mut self, server: &str, tool: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |params| {
            Box::pin(handler(params)) as BoxFuture<'static, anyhow::Result<Value>>
        });
        self.handlers
            .insert((server.to_string(), tool.to_string()), boxed);
    }

    /// Register a synchronous handler
    pub fn register_fn<F>(&mut self, server: &str, tool: &str, handler: F)
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(server, tool, move |params| {
            let handler = handler.clone();
            async move { handler(params) }
        });
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl CapabilityDispatcher for CapabilityRegistry {
    async fn call(&self, server: &str, tool: &str, params: Value) -> anyhow::Result<Value> {
        let handler = self
            .handlers
            .get(&(server.to_string(), tool.to_string()))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown capability {}.{}", server, tool))?;
        handler(params).await
    }
}

#[derive(Debug, Deserialize)]
struct BridgeRequest {
    #[serde(default)]
    id: Value,
    server: String,
    tool: String,
    #[serde(default)]
    params: Value,
}

/// Socket server bound for the lifetime of one isolate
pub(crate) struct CapabilityBridge {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl CapabilityBridge {
    /// Bind the socket and start accepting. Must be called inside a runtime.
    pub fn bind(
        socket_path: &Path,
        dispatcher: Arc<dyn CapabilityDispatcher>,
        max_in_flight: usize,
    ) -> std::io::Result<Self> {
        let listener = UnixListener::bind(socket_path)?;
        let limit = Arc::new(Semaphore::new(max_in_flight.max(1)));
        let (shutdown, stop) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, dispatcher, limit, stop));
        debug!("Capability bridge listening on {}", socket_path.display());
        Ok(Self { shutdown, task })
    }

    /// Stop accepting and abort calls still in flight
    pub async fn close(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

async fn accept_loop(
    listener: UnixListener,
    dispatcher: Arc<dyn CapabilityDispatcher>,
    limit: Arc<Semaphore>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut stop => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    connections.spawn(serve_connection(stream, dispatcher.clone(), limit.clone()));
                }
                Err(e) => {
                    warn!("Capability bridge accept failed: {}", e);
                    break;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.abort_all();
    while connections.join_next().await.is_some() {}
}

async fn serve_connection(
    stream: UnixStream,
    dispatcher: Arc<dyn CapabilityDispatcher>,
    limit: Arc<Semaphore>,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let reply = match serde_json::from_str::<BridgeRequest>(&line) {
            Ok(request) => {
                let _permit = limit.acquire().await.ok();
                debug!("Capability call {}.{}", request.server, request.tool);
                match dispatcher
                    .call(&request.server, &request.tool, request.params)
                    .await
                {
                    Ok(result) => json!({"id": request.id, "ok": true, "result": result}),
                    Err(e) => json!({"id": request.id, "ok": false, "error": format!("{:#}", e)}),
                }
            }
            Err(e) => json!({"ok": false, "error": format!("malformed request: {}", e)}),
        };

        let mut out = reply.to_string();
        out.push('\n');
        if write.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}
