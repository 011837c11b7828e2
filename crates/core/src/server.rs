use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::error::{Result, StreamError, TransportError};
use crate::queue::PacketQueue;
use crate::transport::srt::{OptionValue, SocketOption, SrtContext, SrtServerSocket, SrtSocket, SrtStats, StatsSampler};

const EVENT_CAPACITY: usize = 1024;
const DISPATCH_POLL: Duration = Duration::from_millis(100);
const TRANSITION_POLL: Duration = Duration::from_millis(20);

/// Listener and delivery settings for [`SrtServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address to bind (`0.0.0.0` for all interfaces).
    pub address: String,
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    pub backlog: u32,
    /// Connections beyond this many are closed right after accept.
    pub max_clients: usize,
    /// Outbound packets buffered before the oldest is dropped.
    pub queue_capacity: usize,
    /// Per-client statistics sampling period. `None` disables sampling.
    pub stats_interval: Option<Duration>,
    /// Applied to the listener before it binds; accepted sockets inherit them.
    pub socket_options: Vec<(SocketOption, OptionValue)>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 12345,
            backlog: 5,
            max_clients: 10,
            queue_capacity: 256,
            stats_interval: None,
            socket_options: Vec::new(),
        }
    }
}

/// A connected client as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: u64,
    /// Remote `ip:port`.
    pub peer: String,
}

/// Server notifications, delivered on [`SrtServer::events`].
///
/// Events are dropped rather than blocking the server when nobody drains
/// the channel.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Opened { port: u16 },
    /// Emitted once per open, whether closed explicitly or by a listener failure.
    Closed,
    ClientAccepted(ClientInfo),
    /// Connection refused because `max_clients` was reached.
    ClientRejected { peer: String },
    ClientRemoved(ClientInfo),
    /// Transient send failure; the client stays registered.
    SendFailed { client: ClientInfo, error: TransportError },
    Stats { client: ClientInfo, stats: SrtStats },
    /// The first client connected.
    StreamDemanded,
    /// The last client left.
    StreamIdle,
}

struct Client {
    info: ClientInfo,
    socket: SrtSocket,
}

struct Running {
    listener: Arc<SrtServerSocket>,
    queue: Arc<PacketQueue<Bytes>>,
    accept: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
    sampler: Option<StatsSampler>,
}

struct Inner {
    ctx: Arc<SrtContext>,
    config: ServerConfig,
    /// Held for the whole of `open` and `close`, so the teardown of one run
    /// never overlaps the start of the next.
    transition: Mutex<()>,
    state: Mutex<Option<Running>>,
    clients: Mutex<Vec<Arc<Client>>>,
    next_id: AtomicU64,
    events: Sender<ServerEvent>,
}

impl Inner {
    fn emit(&self, event: ServerEvent) {
        if self.events.try_send(event).is_err() {
            tracing::trace!("server event dropped");
        }
    }

    fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.lock().clone()
    }

    fn register(&self, socket: SrtSocket) {
        let info = ClientInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            peer: socket.peer_address().to_string(),
        };

        let mut clients = self.clients.lock();
        if clients.len() >= self.config.max_clients {
            drop(clients);
            tracing::info!(peer = %info.peer, max = self.config.max_clients, "client limit reached, rejecting");
            socket.close();
            self.emit(ServerEvent::ClientRejected { peer: info.peer });
            return;
        }
        clients.push(Arc::new(Client {
            info: info.clone(),
            socket,
        }));
        let first = clients.len() == 1;
        let total = clients.len();
        drop(clients);

        tracing::info!(client = info.id, peer = %info.peer, total, "client connected");
        self.emit(ServerEvent::ClientAccepted(info));
        if first {
            self.emit(ServerEvent::StreamDemanded);
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut clients = self.clients.lock();
        let Some(pos) = clients.iter().position(|c| c.info.id == id) else {
            return false;
        };
        let client = clients.remove(pos);
        let idle = clients.is_empty();
        drop(clients);

        client.socket.close();
        tracing::info!(client = id, peer = %client.info.peer, "client removed");
        self.emit(ServerEvent::ClientRemoved(client.info.clone()));
        if idle {
            self.emit(ServerEvent::StreamIdle);
        }
        true
    }

    fn broadcast(&self, packet: &[u8]) {
        for client in self.snapshot() {
            match client.socket.send(packet) {
                Ok(_) => {}
                Err(StreamError::Transport(e)) if e.is_connection_closed() => {
                    tracing::debug!(client = client.info.id, code = e.code, "client connection closed");
                    self.remove(client.info.id);
                }
                Err(StreamError::Transport(e)) => {
                    tracing::warn!(client = client.info.id, code = e.code, "send failed");
                    self.emit(ServerEvent::SendFailed {
                        client: client.info.clone(),
                        error: e,
                    });
                }
                Err(e) => tracing::warn!(client = client.info.id, error = %e, "send failed"),
            }
        }
    }

    fn sample_stats(&self) {
        for client in self.snapshot() {
            match client.socket.stats(true) {
                Ok(stats) => self.emit(ServerEvent::Stats {
                    client: client.info.clone(),
                    stats,
                }),
                Err(e) => tracing::debug!(client = client.info.id, error = %e, "stats unavailable"),
            }
        }
    }

    fn close(&self) {
        let _transition = self.transition.lock();
        self.shutdown();
    }

    /// Close requested by a worker of the run that owns `listener`.
    ///
    /// A concurrent `close` may hold the transition lock while joining this
    /// very thread, so the lock is only polled. Once the run is no longer
    /// current, its teardown belongs to whoever took it.
    fn close_from_worker(&self, listener: &Arc<SrtServerSocket>) {
        loop {
            if let Some(_transition) = self.transition.try_lock_for(TRANSITION_POLL) {
                if self.is_current(listener) {
                    self.shutdown();
                }
                return;
            }
            if !self.is_current(listener) {
                return;
            }
        }
    }

    fn is_current(&self, listener: &Arc<SrtServerSocket>) -> bool {
        self.state
            .lock()
            .as_ref()
            .is_some_and(|running| Arc::ptr_eq(&running.listener, listener))
    }

    /// Tear down the current run. Caller holds the transition lock.
    fn shutdown(&self) {
        let Some(mut running) = self.state.lock().take() else {
            return;
        };

        running.listener.close();
        running.queue.close();
        if let Some(mut sampler) = running.sampler.take() {
            sampler.stop();
        }
        let current = thread::current().id();
        for handle in [running.accept.take(), running.dispatch.take()].into_iter().flatten() {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }

        let clients = std::mem::take(&mut *self.clients.lock());
        let had_clients = !clients.is_empty();
        for client in clients {
            client.socket.close();
            self.emit(ServerEvent::ClientRemoved(client.info.clone()));
        }
        if had_clients {
            self.emit(ServerEvent::StreamIdle);
        }

        tracing::info!(port = running.listener.port(), "SRT server closed");
        self.emit(ServerEvent::Closed);
    }
}

fn accept_loop(inner: Arc<Inner>, listener: Arc<SrtServerSocket>) {
    loop {
        match listener.accept() {
            Ok(Some(socket)) => inner.register(socket),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed, closing server");
                inner.close_from_worker(&listener);
                break;
            }
        }
    }
    tracing::debug!("accept loop exited");
}

fn dispatch_loop(inner: Arc<Inner>, queue: Arc<PacketQueue<Bytes>>) {
    loop {
        match queue.take(DISPATCH_POLL) {
            Some(packet) => inner.broadcast(&packet),
            None if queue.is_closed() => break,
            None => {}
        }
    }
    tracing::debug!("dispatch loop exited");
}

/// SRT fan-out server.
///
/// One accept thread registers clients; one dispatch thread drains the
/// outbound queue and sends every packet to every registered client.
/// Producers call [`offer`](Self::offer), which never blocks.
///
/// ```text
/// Closed --open()--> Open --close() / accept failure--> Closed
/// ```
pub struct SrtServer {
    inner: Arc<Inner>,
    events: Receiver<ServerEvent>,
}

impl SrtServer {
    pub fn new(ctx: Arc<SrtContext>, config: ServerConfig) -> Self {
        let (tx, rx) = bounded(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                ctx,
                config,
                transition: Mutex::new(()),
                state: Mutex::new(None),
                clients: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                events: tx,
            }),
            events: rx,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Event stream. Clones share one queue.
    pub fn events(&self) -> Receiver<ServerEvent> {
        self.events.clone()
    }

    /// Bind the listener and start the worker threads.
    ///
    /// On failure the server stays closed and the native handle is released.
    pub fn open(&self) -> Result<()> {
        let _transition = self.inner.transition.lock();
        let mut state = self.inner.state.lock();
        if state.is_some() {
            return Err(StreamError::AlreadyRunning);
        }

        let config = &self.inner.config;
        let listener = Arc::new(SrtServerSocket::open(
            &self.inner.ctx,
            &config.address,
            config.port,
            config.backlog,
            &config.socket_options,
        )?);
        let queue = Arc::new(PacketQueue::new(config.queue_capacity));

        let spawned = self.spawn_workers(&listener, &queue);
        let (accept, dispatch, sampler) = match spawned {
            Ok(workers) => workers,
            Err(e) => {
                listener.close();
                queue.close();
                return Err(e);
            }
        };

        let port = listener.port();
        *state = Some(Running {
            listener,
            queue,
            accept: Some(accept),
            dispatch: Some(dispatch),
            sampler,
        });
        drop(state);

        tracing::info!(address = %config.address, port, "SRT server open");
        self.inner.emit(ServerEvent::Opened { port });
        Ok(())
    }

    fn spawn_workers(
        &self,
        listener: &Arc<SrtServerSocket>,
        queue: &Arc<PacketQueue<Bytes>>,
    ) -> Result<(JoinHandle<()>, JoinHandle<()>, Option<StatsSampler>)> {
        let dispatch = {
            let inner = Arc::clone(&self.inner);
            let queue = Arc::clone(queue);
            thread::Builder::new()
                .name("srt-dispatch".to_string())
                .spawn(move || dispatch_loop(inner, queue))?
        };
        let accept = {
            let inner = Arc::clone(&self.inner);
            let listener = Arc::clone(listener);
            thread::Builder::new()
                .name("srt-accept".to_string())
                .spawn(move || accept_loop(inner, listener))?
        };
        let sampler = match self.inner.config.stats_interval {
            Some(interval) => {
                let inner = Arc::clone(&self.inner);
                Some(StatsSampler::start(interval, move || inner.sample_stats())?)
            }
            None => None,
        };
        Ok((accept, dispatch, sampler))
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().is_some()
    }

    /// Bound port while open.
    pub fn port(&self) -> Option<u16> {
        self.inner.state.lock().as_ref().map(|r| r.listener.port())
    }

    /// Queue one packet for every client. Returns `false` when closed.
    pub fn offer(&self, packet: Bytes) -> bool {
        let queue = self
            .inner
            .state
            .lock()
            .as_ref()
            .map(|r| Arc::clone(&r.queue));
        match queue {
            Some(queue) => queue.offer(packet),
            None => false,
        }
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.inner.snapshot().iter().map(|c| c.info.clone()).collect()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Close one client. Returns `false` if it was not registered.
    pub fn disconnect(&self, id: u64) -> bool {
        self.inner.remove(id)
    }

    /// Idempotent; safe from any thread.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for SrtServer {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for SrtServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrtServer")
            .field("config", &self.inner.config)
            .field("open", &self.is_open())
            .field("clients", &self.client_count())
            .finish()
    }
}
