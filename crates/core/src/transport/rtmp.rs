//! RTMP publishing client.
//!
//! A connection runs two threads: the reader drives the handshake and the
//! client session state machine, and the writer drains an outbound channel
//! onto the socket. Publishing only touches the session under its lock and
//! queues bytes, so the encoder thread never blocks on the network.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType,
};
use rml_rtmp::time::RtmpTimestamp;
use url::Url;

use crate::error::{Result, StreamError};

pub const DEFAULT_PORT: u16 = 1935;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

const READ_BUFFER_SIZE: usize = 4096;

/// Connection state changes, delivered on [`RtmpClient::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtmpEvent {
    /// Publish request accepted; media can flow.
    Connected,
    /// The peer closed the connection or a write failed.
    Disconnected,
    /// Handshake or negotiation failed.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed(String),
    Closed,
}

/// Target parsed from `rtmp://host[:port]/app[/...]/stream_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream_key: String,
}

impl RtmpUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| StreamError::Rtmp(format!("invalid URL: {e}")))?;
        if url.scheme() != "rtmp" {
            return Err(StreamError::Rtmp(format!("unsupported scheme {}", url.scheme())));
        }
        let host = url
            .host_str()
            .ok_or_else(|| StreamError::Rtmp("URL has no host".to_string()))?
            .to_string();

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();
        let Some((key, app)) = segments.split_last() else {
            return Err(StreamError::Rtmp("URL has no stream key".to_string()));
        };
        if app.is_empty() {
            return Err(StreamError::Rtmp("URL has no application name".to_string()));
        }

        let mut stream_key = key.to_string();
        if let Some(query) = url.query() {
            stream_key.push('?');
            stream_key.push_str(query);
        }

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            app: app.join("/"),
            stream_key,
        })
    }
}

enum Outbound {
    Data(Vec<u8>),
    Close,
}

struct Shared {
    session: Mutex<Option<ClientSession>>,
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
    outbound: Sender<Outbound>,
    events: Sender<RtmpEvent>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        // Terminal states stick.
        if matches!(
            *state,
            ConnectionState::Closed | ConnectionState::Disconnected | ConnectionState::Failed(_)
        ) {
            return;
        }
        let event = match &next {
            ConnectionState::Connected => Some(RtmpEvent::Connected),
            ConnectionState::Disconnected => Some(RtmpEvent::Disconnected),
            ConnectionState::Failed(reason) => Some(RtmpEvent::Failed(reason.clone())),
            _ => None,
        };
        tracing::debug!(from = ?*state, to = ?next, "RTMP state");
        *state = next;
        drop(state);
        self.state_changed.notify_all();
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    fn queue(&self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            let _ = self.outbound.send(Outbound::Data(bytes));
        }
    }

    /// Queue outbound packets and react to session events. Runs with the
    /// session lock held by the caller.
    fn process(
        &self,
        session: &mut ClientSession,
        stream_key: &str,
        results: Vec<ClientSessionResult>,
    ) -> Result<()> {
        let mut pending = results;
        while !pending.is_empty() {
            let mut follow_up = Vec::new();
            for result in pending {
                match result {
                    ClientSessionResult::OutboundResponse(packet) => self.queue(packet.bytes),
                    ClientSessionResult::RaisedEvent(event) => match event {
                        ClientSessionEvent::ConnectionRequestAccepted => {
                            tracing::debug!(stream_key, "RTMP connect accepted, publishing");
                            let result = session
                                .request_publishing(stream_key.to_string(), PublishRequestType::Live)
                                .map_err(|e| StreamError::Rtmp(format!("{e:?}")))?;
                            follow_up.push(result);
                        }
                        ClientSessionEvent::PublishRequestAccepted => {
                            self.set_state(ConnectionState::Connected);
                        }
                        ClientSessionEvent::ConnectionRequestRejected { .. } => {
                            return Err(StreamError::Rtmp(format!("{event:?}")));
                        }
                        other => tracing::trace!(event = ?other, "RTMP event"),
                    },
                    ClientSessionResult::UnhandleableMessageReceived(message) => {
                        tracing::trace!(?message, "unhandled RTMP message");
                    }
                }
            }
            pending = follow_up;
        }
        Ok(())
    }
}

/// Publishing RTMP connection.
pub struct RtmpClient {
    target: RtmpUrl,
    shared: Arc<Shared>,
    stream: TcpStream,
    events: Receiver<RtmpEvent>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl RtmpClient {
    /// Open the TCP connection and start negotiating in the background.
    ///
    /// Returns once the socket is connected; use
    /// [`wait_connected`](Self::wait_connected) for the publish handshake.
    pub fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let target = RtmpUrl::parse(url)?;
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| StreamError::Rtmp(format!("cannot resolve {}", target.host)))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        tracing::info!(%addr, app = %target.app, "RTMP connected, negotiating");

        let (out_tx, out_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let shared = Arc::new(Shared {
            session: Mutex::new(None),
            state: Mutex::new(ConnectionState::Connecting),
            state_changed: Condvar::new(),
            outbound: out_tx,
            events: event_tx,
        });

        let writer = {
            let stream = stream.try_clone()?;
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("rtmp-writer".to_string())
                .spawn(move || write_loop(stream, out_rx, &shared))?
        };
        let reader = {
            let stream = stream.try_clone()?;
            let shared = Arc::clone(&shared);
            let target = target.clone();
            thread::Builder::new()
                .name("rtmp-reader".to_string())
                .spawn(move || {
                    if let Err(e) = read_loop(stream, &shared, &target) {
                        tracing::warn!(error = %e, "RTMP negotiation failed");
                        shared.set_state(ConnectionState::Failed(e.to_string()));
                    }
                })?
        };

        Ok(Self {
            target,
            shared,
            stream,
            events: event_rx,
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    pub fn target(&self) -> &RtmpUrl {
        &self.target
    }

    /// Connection events. Clones share one queue.
    pub fn events(&self) -> Receiver<RtmpEvent> {
        self.events.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state.lock() == ConnectionState::Connected
    }

    /// Block until the publish request is accepted or negotiation fails,
    /// at most `timeout`.
    pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed(reason) => return Err(StreamError::Rtmp(reason.clone())),
                ConnectionState::Disconnected | ConnectionState::Closed => {
                    return Err(StreamError::Disconnected);
                }
                ConnectionState::Connecting => {}
            }
            if self
                .shared
                .state_changed
                .wait_for(&mut state, timeout)
                .timed_out()
            {
                return match &*state {
                    ConnectionState::Connected => Ok(()),
                    _ => Err(StreamError::Timeout("RTMP publish")),
                };
            }
        }
    }

    /// Send an FLV video tag body. Returns `false` when dropped because
    /// publishing has not started yet.
    pub fn publish_video(&self, data: Bytes, timestamp_ms: u32) -> Result<bool> {
        self.publish(data, timestamp_ms, MediaKind::Video)
    }

    /// Send an FLV audio tag body. Same contract as [`publish_video`](Self::publish_video).
    pub fn publish_audio(&self, data: Bytes, timestamp_ms: u32) -> Result<bool> {
        self.publish(data, timestamp_ms, MediaKind::Audio)
    }

    fn publish(&self, data: Bytes, timestamp_ms: u32, kind: MediaKind) -> Result<bool> {
        match self.state() {
            ConnectionState::Connecting => return Ok(false),
            ConnectionState::Connected => {}
            _ => return Err(StreamError::Disconnected),
        }

        let mut guard = self.shared.session.lock();
        let Some(session) = guard.as_mut() else {
            return Ok(false);
        };
        let timestamp = RtmpTimestamp::new(timestamp_ms);
        let result = match kind {
            MediaKind::Video => session.publish_video_data(data, timestamp, false),
            MediaKind::Audio => session.publish_audio_data(data, timestamp, false),
        };
        match result {
            Ok(ClientSessionResult::OutboundResponse(packet)) => {
                self.shared.queue(packet.bytes);
                Ok(true)
            }
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(error = ?e, "RTMP publish failed");
                Ok(false)
            }
        }
    }

    /// Idempotent. Stops both threads.
    pub fn close(&mut self) {
        self.shared.set_state(ConnectionState::Closed);
        let _ = self.shared.outbound.send(Outbound::Close);
        let _ = self.stream.shutdown(Shutdown::Both);
        for handle in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for RtmpClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RtmpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtmpClient")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy)]
enum MediaKind {
    Video,
    Audio,
}

fn write_loop(mut stream: TcpStream, outbound: Receiver<Outbound>, shared: &Shared) {
    for message in outbound.iter() {
        match message {
            Outbound::Data(bytes) => {
                if let Err(e) = stream.write_all(&bytes) {
                    tracing::debug!(error = %e, "RTMP write failed");
                    shared.set_state(ConnectionState::Disconnected);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    tracing::debug!("RTMP writer exited");
}

fn read_loop(mut stream: TcpStream, shared: &Shared, target: &RtmpUrl) -> Result<()> {
    let mut buf = [0u8; READ_BUFFER_SIZE];

    let mut handshake = Handshake::new(PeerType::Client);
    let p0_and_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| StreamError::Rtmp(format!("{e:?}")))?;
    shared.queue(p0_and_p1);

    let remaining = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(StreamError::Rtmp("peer closed during handshake".to_string()));
        }
        match handshake
            .process_bytes(&buf[..n])
            .map_err(|e| StreamError::Rtmp(format!("{e:?}")))?
        {
            HandshakeProcessResult::InProgress { response_bytes } => shared.queue(response_bytes),
            HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            } => {
                shared.queue(response_bytes);
                break remaining_bytes;
            }
        }
    };
    tracing::debug!("RTMP handshake complete");

    {
        let (mut session, initial) = ClientSession::new(ClientSessionConfig::new())
            .map_err(|e| StreamError::Rtmp(format!("{e:?}")))?;
        shared.process(&mut session, &target.stream_key, initial)?;
        let request = session
            .request_connection(target.app.clone())
            .map_err(|e| StreamError::Rtmp(format!("{e:?}")))?;
        shared.process(&mut session, &target.stream_key, vec![request])?;
        *shared.session.lock() = Some(session);
    }

    if !remaining.is_empty() {
        handle_input(shared, &target.stream_key, &remaining)?;
    }

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "RTMP read ended");
                break;
            }
        };
        handle_input(shared, &target.stream_key, &buf[..n])?;
    }

    shared.set_state(ConnectionState::Disconnected);
    tracing::debug!("RTMP reader exited");
    Ok(())
}

fn handle_input(shared: &Shared, stream_key: &str, bytes: &[u8]) -> Result<()> {
    let mut guard = shared.session.lock();
    let Some(session) = guard.as_mut() else {
        return Ok(());
    };
    let results = session
        .handle_input(bytes)
        .map_err(|e| StreamError::Rtmp(format!("{e:?}")))?;
    shared.process(session, stream_key, results)
}
