use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::Mutex,
};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, info, warn};

use crate::command;

pub type ConnectionId = u64;

/// Write half of an accepted connection. The registry owns these; the read
/// halves stay with their connection tasks.
pub type WsSink = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>;

pub struct Relay {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl Relay {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<RelayState> {
        Arc::clone(&self.state)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &Arc<RelayState>) {
    info!("relay shutting down");
    state.close_all().await;
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<RelayState>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_task(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_task(stream: TcpStream, peer: SocketAddr, state: &Arc<RelayState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

/// The registry of open connections. It is the single source of truth for
/// who receives broadcasts: a connection is a member exactly while it is
/// believed open.
pub struct RelayState {
    connections: Mutex<HashMap<ConnectionId, WsSink>>,
    next_id: AtomicU64,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, sink: WsSink) -> ConnectionId {
        let id = self.next_id();
        let mut connections = self.connections.lock().await;
        connections.insert(id, sink);
        info!(connection = id, total = connections.len(), "client connected");
        id
    }

    /// Remove a connection from the registry. Idempotent: removing an id
    /// that is already gone is a no-op.
    pub async fn unregister(&self, id: ConnectionId) {
        let mut connections = self.connections.lock().await;
        if connections.remove(&id).is_some() {
            info!(connection = id, total = connections.len(), "client disconnected");
        }
    }

    /// Look up an inbound command and broadcast its token. Commands outside
    /// the table are dropped without penalizing the sender.
    pub async fn dispatch(&self, command: &str) {
        let Some(token) = command::lookup(command) else {
            debug!(command, "ignoring unmapped command");
            return;
        };

        info!(command, token, "dispatching command");
        self.broadcast(token).await;
    }

    /// Send `token` to every connection registered at the moment of the
    /// call, the origin of the command included.
    pub async fn broadcast(&self, token: &str) {
        // Snapshot under the lock, send after releasing it: a peer that is
        // slow to take a frame must not hold up registration traffic.
        let targets: Vec<(ConnectionId, WsSink)> = {
            let connections = self.connections.lock().await;
            connections
                .iter()
                .map(|(id, sink)| (*id, Arc::clone(sink)))
                .collect()
        };

        for (id, sink) in targets {
            let delivery = sink.lock().await.send(Message::text(token)).await;
            if let Err(err) = delivery {
                // Best effort: the peer is likely mid-disconnect and its own
                // read task will evict it. Never aborts the sweep.
                debug!(connection = id, error = ?err, "skipping undeliverable peer");
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    async fn close_all(&self) {
        let targets: Vec<WsSink> = {
            let connections = self.connections.lock().await;
            connections.values().map(Arc::clone).collect()
        };

        for sink in targets {
            if let Err(err) = sink.lock().await.send(Message::Close(None)).await {
                debug!(error = ?err, "failed to send close frame");
            }
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<RelayState>,
) -> Result<()> {
    let socket = accept_async(stream).await?;
    let (sink, stream) = socket.split();

    let id = state.register(Arc::new(Mutex::new(sink))).await;
    debug!(peer = %peer, connection = id, "websocket established");

    // Capture the loop outcome instead of propagating it so eviction runs
    // on the error path too.
    let outcome = read_commands(stream, &state).await;
    state.unregister(id).await;
    outcome
}

async fn read_commands(
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    state: &RelayState,
) -> Result<()> {
    while let Some(frame) = stream.next().await {
        match frame? {
            // Dispatch completes before the next read, so one connection's
            // commands are processed in arrival order.
            Message::Text(command) => state.dispatch(command.as_str()).await,
            Message::Close(_) => break,
            // Ping/pong is answered by the protocol layer.
            _ => {}
        }
    }

    Ok(())
}
