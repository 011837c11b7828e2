//! SRT socket wrapper over a native [`Driver`].
//!
//! The native library is reached only through the [`Driver`] trait:
//! process-wide startup/cleanup, socket creation, listen/accept/connect,
//! message send/recv, options and statistics. Failures carry the native
//! error code (see [`code`]).
//!
//! Socket lifecycle is monotonic:
//!
//! ```text
//! NotOpen ──connect──▶ Connected ──close──▶ Closed
//!    └───────────────────close──────────────────┘
//! ```
//!
//! A closed socket never reopens; send/recv on it fail fast with
//! [`TransportErrorKind::AlreadyClosed`].

pub mod driver;
pub mod stats;
pub mod tcp;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, TransportError, TransportErrorKind};

pub use driver::{Driver, DriverResult};
pub use stats::{SrtStats, StatsSampler};
pub use tcp::TcpDriver;

/// Native error codes (libsrt `SRT_ERRNO`).
pub mod code {
    pub const EUNKNOWN: i32 = -1;
    pub const SUCCESS: i32 = 0;
    pub const ECONNSETUP: i32 = 1000;
    pub const ECONNREJ: i32 = 1002;
    pub const ESOCKFAIL: i32 = 1003;
    pub const ECONNFAIL: i32 = 2000;
    pub const ECONNLOST: i32 = 2001;
    pub const ENOCONN: i32 = 2002;
    pub const ENOBUF: i32 = 3002;
    pub const EINVOP: i32 = 5000;
    pub const EINVPARAM: i32 = 5003;
    pub const EINVSOCK: i32 = 5004;
    pub const ENOLISTEN: i32 = 5006;
    pub const ETIMEOUT: i32 = 6003;
    pub const ECONGEST: i32 = 6004;

    /// Codes after which the connection cannot carry more data.
    pub fn is_connection_closed(code: i32) -> bool {
        matches!(code, ECONNLOST | ENOCONN | EINVSOCK)
    }
}

/// Native socket option id (`SRT_SOCKOPT`), forwarded opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketOption(pub i32);

impl SocketOption {
    pub const SNDSYN: Self = Self(1);
    pub const RCVSYN: Self = Self(2);
    pub const SNDBUF: Self = Self(5);
    pub const RCVBUF: Self = Self(6);
    pub const MAXBW: Self = Self(16);
    pub const LATENCY: Self = Self(23);
    pub const PASSPHRASE: Self = Self(26);
    pub const PBKEYLEN: Self = Self(27);
    pub const CONNTIMEO: Self = Self(36);
    pub const RCVLATENCY: Self = Self(43);
    pub const PEERLATENCY: Self = Self(44);
    pub const STREAMID: Self = Self(46);
    pub const PAYLOADSIZE: Self = Self(49);
    pub const TRANSTYPE: Self = Self(50);
    pub const PEERIDLETIMEO: Self = Self(55);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(i32),
    Int64(i64),
    Bool(bool),
    Str(String),
}

/// Process-wide native library handle.
///
/// Startup runs once per context; cleanup runs when the last `Arc` is
/// dropped. Sockets hold a clone, so the library outlives every socket.
pub struct SrtContext {
    driver: Arc<dyn Driver>,
}

impl SrtContext {
    pub fn startup(driver: Arc<dyn Driver>) -> Result<Arc<Self>> {
        driver
            .startup()
            .map_err(|code| TransportError::new(TransportErrorKind::StartupFailed, code))?;
        tracing::debug!("SRT library started");
        Ok(Arc::new(Self { driver }))
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }
}

impl Drop for SrtContext {
    fn drop(&mut self) {
        self.driver.cleanup();
        tracing::debug!("SRT library cleaned up");
    }
}

impl fmt::Debug for SrtContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtContext").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    NotOpen,
    Connected,
    Closed,
}

fn apply_options(
    ctx: &SrtContext,
    handle: i32,
    options: &[(SocketOption, OptionValue)],
) -> Result<()> {
    for (option, value) in options {
        ctx.driver()
            .set_option(handle, *option, value)
            .map_err(|code| TransportError::new(TransportErrorKind::OptionFailed, code))?;
    }
    Ok(())
}

/// One message-oriented SRT connection.
#[derive(Debug)]
pub struct SrtSocket {
    ctx: Arc<SrtContext>,
    handle: i32,
    peer: String,
    state: Mutex<SocketState>,
}

impl SrtSocket {
    /// Create an unconnected caller socket.
    pub fn new(ctx: &Arc<SrtContext>) -> Result<Self> {
        let handle = ctx
            .driver()
            .create_socket()
            .map_err(|code| TransportError::new(TransportErrorKind::ConnectFailed, code))?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            handle,
            peer: String::new(),
            state: Mutex::new(SocketState::NotOpen),
        })
    }

    fn accepted(ctx: &Arc<SrtContext>, handle: i32, peer: String) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            handle,
            peer,
            state: Mutex::new(SocketState::Connected),
        }
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }

    /// `address:port` of the remote end, empty until connected.
    pub fn peer_address(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> SocketState {
        *self.state.lock()
    }

    pub fn set_option(&self, option: SocketOption, value: OptionValue) -> Result<()> {
        if self.state() == SocketState::Closed {
            return Err(TransportError::already_closed().into());
        }
        apply_options(&self.ctx, self.handle, &[(option, value)])
    }

    /// `NotOpen → Connected`. Any other state is `InvalidState`.
    pub fn connect(&mut self, address: &str, port: u16) -> Result<()> {
        let state = self.state();
        if state != SocketState::NotOpen {
            return Err(TransportError::new(TransportErrorKind::InvalidState, code::EINVOP).into());
        }
        self.ctx
            .driver()
            .connect(self.handle, address, port)
            .map_err(|code| TransportError::new(TransportErrorKind::ConnectFailed, code))?;
        self.peer = format!("{address}:{port}");
        *self.state.lock() = SocketState::Connected;
        tracing::debug!(peer = %self.peer, handle = self.handle, "SRT connected");
        Ok(())
    }

    /// Send one message.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        if self.state() != SocketState::Connected {
            return Err(TransportError::already_closed().into());
        }
        self.ctx
            .driver()
            .send(self.handle, data)
            .map_err(|code| TransportError::new(TransportErrorKind::SendFailed, code).into())
    }

    /// Receive one message into `buf`.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        if self.state() != SocketState::Connected {
            return Err(TransportError::already_closed().into());
        }
        self.ctx
            .driver()
            .recv(self.handle, buf)
            .map_err(|code| TransportError::new(TransportErrorKind::RecvFailed, code).into())
    }

    /// Snapshot of the connection statistics. `clear` resets the interval counters.
    pub fn stats(&self, clear: bool) -> Result<SrtStats> {
        if self.state() == SocketState::Closed {
            return Err(TransportError::already_closed().into());
        }
        self.ctx
            .driver()
            .stats(self.handle, clear)
            .map_err(|code| TransportError::new(TransportErrorKind::StatsFailed, code).into())
    }

    /// Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state == SocketState::Closed {
            return;
        }
        *state = SocketState::Closed;
        drop(state);
        self.ctx.driver().close(self.handle);
        tracing::debug!(peer = %self.peer, handle = self.handle, "SRT socket closed");
    }
}

impl Drop for SrtSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Listening SRT socket.
#[derive(Debug)]
pub struct SrtServerSocket {
    ctx: Arc<SrtContext>,
    handle: i32,
    port: u16,
    closed: Mutex<bool>,
}

impl SrtServerSocket {
    /// Create, configure, bind and listen. The native handle is released on
    /// every failure path.
    pub fn open(
        ctx: &Arc<SrtContext>,
        address: &str,
        port: u16,
        backlog: u32,
        options: &[(SocketOption, OptionValue)],
    ) -> Result<Self> {
        let driver = ctx.driver();
        let handle = driver
            .create_socket()
            .map_err(|code| TransportError::new(TransportErrorKind::BindFailed, code))?;

        if let Err(e) = apply_options(ctx, handle, options) {
            driver.close(handle);
            return Err(e);
        }

        if let Err(code) = driver.listen(handle, address, port, backlog) {
            driver.close(handle);
            return Err(TransportError::new(TransportErrorKind::BindFailed, code).into());
        }

        let port = match driver.local_port(handle) {
            Ok(p) => p,
            Err(code) => {
                driver.close(handle);
                return Err(TransportError::new(TransportErrorKind::BindFailed, code).into());
            }
        };

        tracing::info!(address, port, backlog, "SRT listening");
        Ok(Self {
            ctx: Arc::clone(ctx),
            handle,
            port,
            closed: Mutex::new(false),
        })
    }

    /// Bound port (resolves port 0 to the ephemeral one).
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Block until a client connects.
    ///
    /// `Ok(None)` means the listener was closed, possibly concurrently;
    /// callers treat it as a graceful shutdown.
    pub fn accept(&self) -> Result<Option<SrtSocket>> {
        if self.is_closed() {
            return Ok(None);
        }
        match self.ctx.driver().accept(self.handle) {
            Ok((handle, peer)) => {
                tracing::debug!(handle, peer = %peer, "SRT client accepted");
                Ok(Some(SrtSocket::accepted(&self.ctx, handle, peer)))
            }
            Err(_) if self.is_closed() => Ok(None),
            Err(code) => Err(TransportError::new(TransportErrorKind::AcceptFailed, code).into()),
        }
    }

    /// Idempotent; unblocks a pending [`accept`](Self::accept).
    pub fn close(&self) {
        let mut closed = self.closed.lock();
        if *closed {
            return;
        }
        *closed = true;
        drop(closed);
        self.ctx.driver().close(self.handle);
        tracing::debug!(port = self.port, "SRT listener closed");
    }
}

impl Drop for SrtServerSocket {
    fn drop(&mut self) {
        self.close();
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockDriver;
    use super::*;
    use crate::error::StreamError;
    use std::sync::atomic::Ordering;

    fn context(driver: &Arc<MockDriver>) -> Arc<SrtContext> {
        SrtContext::startup(Arc::clone(driver) as Arc<dyn Driver>).unwrap()
    }

    fn transport_kind(err: StreamError) -> TransportErrorKind {
        match err {
            StreamError::Transport(e) => e.kind,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn closed_codes() {
        assert!(code::is_connection_closed(code::ECONNLOST));
        assert!(code::is_connection_closed(code::ENOCONN));
        assert!(code::is_connection_closed(code::EINVSOCK));
        assert!(!code::is_connection_closed(code::ENOBUF));
        assert!(!code::is_connection_closed(code::ETIMEOUT));
    }

    #[test]
    fn context_cleans_up_after_last_reference() {
        let driver = MockDriver::new();
        let ctx = context(&driver);
        let socket = SrtSocket::new(&ctx).unwrap();
        drop(ctx);
        assert_eq!(driver.cleanups.load(Ordering::SeqCst), 0);
        drop(socket);
        assert_eq!(driver.startups.load(Ordering::SeqCst), 1);
        assert_eq!(driver.cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn socket_state_is_monotonic() {
        let driver = MockDriver::new();
        let ctx = context(&driver);
        let mut socket = SrtSocket::new(&ctx).unwrap();
        assert_eq!(socket.state(), SocketState::NotOpen);

        socket.connect("127.0.0.1", 9000).unwrap();
        assert_eq!(socket.state(), SocketState::Connected);
        assert_eq!(socket.peer_address(), "127.0.0.1:9000");
        assert_eq!(
            transport_kind(socket.connect("127.0.0.1", 9000).unwrap_err()),
            TransportErrorKind::InvalidState
        );

        socket.close();
        socket.close();
        assert_eq!(socket.state(), SocketState::Closed);
        assert_eq!(driver.closed.lock().len(), 1);

        let err = socket.send(b"x").unwrap_err();
        assert_eq!(transport_kind(err), TransportErrorKind::AlreadyClosed);
        assert!(matches!(
            socket.recv(&mut [0u8; 4]),
            Err(StreamError::Transport(e)) if e.is_connection_closed()
        ));
        assert_eq!(
            transport_kind(socket.connect("127.0.0.1", 9000).unwrap_err()),
            TransportErrorKind::InvalidState
        );
    }

    #[test]
    fn send_failure_carries_native_code() {
        let driver = MockDriver::new();
        let ctx = context(&driver);
        let mut socket = SrtSocket::new(&ctx).unwrap();
        socket.connect("127.0.0.1", 9000).unwrap();
        driver.send_errors.lock().insert(socket.handle(), code::ECONNLOST);

        match socket.send(b"payload") {
            Err(StreamError::Transport(e)) => {
                assert_eq!(e.kind, TransportErrorKind::SendFailed);
                assert_eq!(e.code, code::ECONNLOST);
                assert!(e.is_connection_closed());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bind_failure_releases_handle() {
        let driver = MockDriver::new();
        *driver.listen_error.lock() = Some(code::ESOCKFAIL);
        let ctx = context(&driver);

        match SrtServerSocket::open(&ctx, "0.0.0.0", 9000, 5, &[]) {
            Err(StreamError::Transport(e)) => {
                assert_eq!(e.kind, TransportErrorKind::BindFailed);
                assert_eq!(e.code, code::ESOCKFAIL);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(driver.closed.lock().len(), 1);
    }

    #[test]
    fn option_failure_releases_handle() {
        let driver = MockDriver::new();
        *driver.option_error.lock() = Some(code::EINVPARAM);
        let ctx = context(&driver);
        let options = [(SocketOption::LATENCY, OptionValue::Int(120))];

        let err = SrtServerSocket::open(&ctx, "0.0.0.0", 9000, 5, &options).unwrap_err();
        assert_eq!(transport_kind(err), TransportErrorKind::OptionFailed);
        assert_eq!(driver.closed.lock().len(), 1);
    }

    #[test]
    fn accept_returns_none_after_close() {
        let driver = MockDriver::new();
        let ctx = context(&driver);
        let server = Arc::new(SrtServerSocket::open(&ctx, "0.0.0.0", 0, 5, &[]).unwrap());

        driver.push_client("10.0.0.2:5000");
        let client = server.accept().unwrap().unwrap();
        assert_eq!(client.peer_address(), "10.0.0.2:5000");
        assert_eq!(client.state(), SocketState::Connected);

        let acceptor = {
            let server = Arc::clone(&server);
            std::thread::spawn(move || server.accept())
        };
        std::thread::sleep(std::time::Duration::from_millis(30));
        server.close();
        assert!(acceptor.join().unwrap().unwrap().is_none());
    }

    #[test]
    fn stats_are_forwarded() {
        let driver = MockDriver::new();
        let ctx = context(&driver);
        let mut socket = SrtSocket::new(&ctx).unwrap();
        socket.connect("127.0.0.1", 1).unwrap();
        assert_eq!(socket.stats(false).unwrap().rtt_ms, 12.5);
    }
}
