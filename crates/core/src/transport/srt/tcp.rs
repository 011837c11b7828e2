//! Message-framed TCP [`Driver`].
//!
//! Each SRT message travels as one relay frame (`01 02 03 04` + LE length +
//! payload) over a plain TCP connection. Message boundaries, blocking
//! semantics and error codes match the native library closely enough for
//! the server and muxers to run unchanged where libsrt is not linked.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::driver::{Driver, DriverResult};
use super::{OptionValue, SocketOption, SrtStats, code};
use crate::protocol::relay;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Map an I/O failure to the closest native code.
fn io_code(e: &io::Error) -> i32 {
    match e.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::UnexpectedEof => code::ECONNLOST,
        io::ErrorKind::NotConnected => code::ENOCONN,
        io::ErrorKind::ConnectionRefused => code::ECONNREJ,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => code::ETIMEOUT,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => code::EINVPARAM,
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => code::ESOCKFAIL,
        _ => code::EUNKNOWN,
    }
}

#[derive(Debug)]
struct Listener {
    inner: TcpListener,
    closed: AtomicBool,
}

#[derive(Debug)]
struct Stream {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    control: TcpStream,
    closed: AtomicBool,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Stream {
    fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: Mutex::new(stream.try_clone()?),
            writer: Mutex::new(stream.try_clone()?),
            control: stream,
            closed: AtomicBool::new(false),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        })
    }
}

#[derive(Debug)]
enum Entry {
    /// Created, not yet bound or connected.
    Fresh(HashMap<SocketOption, OptionValue>),
    Listener(Arc<Listener>),
    Stream(Arc<Stream>),
}

/// [`Driver`] over TCP with relay framing.
#[derive(Debug)]
pub struct TcpDriver {
    next_handle: AtomicI32,
    sockets: Mutex<HashMap<i32, Entry>>,
    active: AtomicUsize,
}

impl Default for TcpDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpDriver {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicI32::new(1),
            sockets: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
        }
    }

    /// Outstanding startup calls without a matching cleanup.
    pub fn active_contexts(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of live handles.
    pub fn open_handles(&self) -> usize {
        self.sockets.lock().len()
    }

    fn stream(&self, handle: i32) -> DriverResult<Arc<Stream>> {
        match self.sockets.lock().get(&handle) {
            Some(Entry::Stream(s)) => Ok(Arc::clone(s)),
            Some(_) => Err(code::ENOCONN),
            None => Err(code::EINVSOCK),
        }
    }

    fn listener(&self, handle: i32) -> DriverResult<Arc<Listener>> {
        match self.sockets.lock().get(&handle) {
            Some(Entry::Listener(l)) => Ok(Arc::clone(l)),
            Some(_) => Err(code::ENOLISTEN),
            None => Err(code::EINVSOCK),
        }
    }

    fn register(&self, entry: Entry) -> i32 {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.sockets.lock().insert(handle, entry);
        handle
    }

    /// Options of a fresh socket; other states accept options silently.
    fn fresh_options(&self, handle: i32) -> DriverResult<HashMap<SocketOption, OptionValue>> {
        match self.sockets.lock().get(&handle) {
            Some(Entry::Fresh(options)) => Ok(options.clone()),
            Some(_) => Err(code::EINVOP),
            None => Err(code::EINVSOCK),
        }
    }
}

fn validate_option(option: SocketOption, value: &OptionValue) -> DriverResult<()> {
    match (option, value) {
        (SocketOption::PASSPHRASE, OptionValue::Str(s)) if s.is_empty() || (10..=79).contains(&s.len()) => Ok(()),
        (SocketOption::PASSPHRASE, _) => Err(code::EINVPARAM),
        (SocketOption::STREAMID, OptionValue::Str(s)) if s.len() <= 512 => Ok(()),
        (SocketOption::STREAMID, _) => Err(code::EINVPARAM),
        (SocketOption::LATENCY | SocketOption::RCVLATENCY | SocketOption::PEERLATENCY, OptionValue::Int(ms))
            if *ms < 0 =>
        {
            Err(code::EINVPARAM)
        }
        _ => Ok(()),
    }
}

impl Driver for TcpDriver {
    fn startup(&self) -> DriverResult<()> {
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cleanup(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn create_socket(&self) -> DriverResult<i32> {
        Ok(self.register(Entry::Fresh(HashMap::new())))
    }

    fn set_option(&self, handle: i32, option: SocketOption, value: &OptionValue) -> DriverResult<()> {
        validate_option(option, value)?;
        let mut sockets = self.sockets.lock();
        match sockets.get_mut(&handle) {
            Some(Entry::Fresh(options)) => {
                options.insert(option, value.clone());
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(code::EINVSOCK),
        }
    }

    fn listen(&self, handle: i32, address: &str, port: u16, backlog: u32) -> DriverResult<()> {
        self.fresh_options(handle)?;
        let inner = TcpListener::bind((address, port)).map_err(|e| io_code(&e))?;
        inner.set_nonblocking(true).map_err(|e| io_code(&e))?;
        tracing::debug!(handle, address, port, backlog, "TCP driver listening");

        let listener = Arc::new(Listener {
            inner,
            closed: AtomicBool::new(false),
        });
        self.sockets.lock().insert(handle, Entry::Listener(listener));
        Ok(())
    }

    fn local_port(&self, handle: i32) -> DriverResult<u16> {
        let listener = self.listener(handle)?;
        listener
            .inner
            .local_addr()
            .map(|a| a.port())
            .map_err(|e| io_code(&e))
    }

    fn accept(&self, handle: i32) -> DriverResult<(i32, String)> {
        let listener = self.listener(handle)?;
        loop {
            if listener.closed.load(Ordering::SeqCst) {
                return Err(code::EINVSOCK);
            }
            match listener.inner.accept() {
                Ok((socket, peer)) => {
                    socket.set_nonblocking(false).map_err(|e| io_code(&e))?;
                    let stream = Stream::new(socket).map_err(|e| io_code(&e))?;
                    let client = self.register(Entry::Stream(Arc::new(stream)));
                    return Ok((client, peer.to_string()));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "TCP accept error");
                    return Err(io_code(&e));
                }
            }
        }
    }

    fn connect(&self, handle: i32, address: &str, port: u16) -> DriverResult<()> {
        let options = self.fresh_options(handle)?;
        let timeout = match options.get(&SocketOption::CONNTIMEO) {
            Some(OptionValue::Int(ms)) if *ms > 0 => Duration::from_millis(*ms as u64),
            _ => DEFAULT_CONNECT_TIMEOUT,
        };

        let addrs: Vec<SocketAddr> = (address, port)
            .to_socket_addrs()
            .map_err(|_| code::EINVPARAM)?
            .collect();
        let mut last = code::ECONNSETUP;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(socket) => {
                    let stream = Stream::new(socket).map_err(|e| io_code(&e))?;
                    self.sockets.lock().insert(handle, Entry::Stream(Arc::new(stream)));
                    return Ok(());
                }
                Err(e) => last = io_code(&e),
            }
        }
        Err(last)
    }

    fn send(&self, handle: i32, data: &[u8]) -> DriverResult<usize> {
        let stream = self.stream(handle)?;
        if stream.closed.load(Ordering::SeqCst) {
            return Err(code::EINVSOCK);
        }
        let mut writer = stream.writer.lock();
        relay::write_frame(&mut *writer, data).map_err(|e| io_code(&e))?;
        writer.flush().map_err(|e| io_code(&e))?;
        stream.packets_sent.fetch_add(1, Ordering::Relaxed);
        stream.bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data.len())
    }

    fn recv(&self, handle: i32, buf: &mut [u8]) -> DriverResult<usize> {
        let stream = self.stream(handle)?;
        let mut reader = stream.reader.lock();
        match relay::read_frame(&mut *reader) {
            Ok(Some(message)) => {
                let n = message.len().min(buf.len());
                buf[..n].copy_from_slice(&message[..n]);
                stream.packets_received.fetch_add(1, Ordering::Relaxed);
                stream.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                Ok(n)
            }
            Ok(None) => Err(code::ECONNLOST),
            Err(crate::StreamError::Io(e)) => Err(io_code(&e)),
            Err(_) => Err(code::ECONNLOST),
        }
    }

    fn close(&self, handle: i32) {
        let entry = self.sockets.lock().remove(&handle);
        match entry {
            Some(Entry::Stream(stream)) => {
                stream.closed.store(true, Ordering::SeqCst);
                let _ = stream.control.shutdown(Shutdown::Both);
            }
            Some(Entry::Listener(listener)) => {
                listener.closed.store(true, Ordering::SeqCst);
            }
            Some(Entry::Fresh(_)) | None => {}
        }
    }

    /// Counters cover the interval since the last clearing read.
    fn stats(&self, handle: i32, clear: bool) -> DriverResult<SrtStats> {
        let stream = self.stream(handle)?;
        let read = |counter: &AtomicU64| {
            if clear {
                counter.swap(0, Ordering::Relaxed)
            } else {
                counter.load(Ordering::Relaxed)
            }
        };
        Ok(SrtStats {
            packets_sent: read(&stream.packets_sent),
            packets_received: read(&stream.packets_received),
            bytes_sent: read(&stream.bytes_sent),
            bytes_received: read(&stream.bytes_received),
            ..SrtStats::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::srt::{SrtContext, SrtServerSocket, SrtSocket};

    fn context() -> (Arc<TcpDriver>, Arc<SrtContext>) {
        let driver = Arc::new(TcpDriver::new());
        let ctx = SrtContext::startup(Arc::clone(&driver) as Arc<dyn Driver>).unwrap();
        (driver, ctx)
    }

    #[test]
    fn messages_keep_boundaries() {
        let (_driver, ctx) = context();
        let server = SrtServerSocket::open(&ctx, "127.0.0.1", 0, 4, &[]).unwrap();
        let port = server.port();

        let mut client = SrtSocket::new(&ctx).unwrap();
        client.connect("127.0.0.1", port).unwrap();
        let accepted = server.accept().unwrap().unwrap();

        accepted.send(b"one").unwrap();
        accepted.send(b"two!").unwrap();

        let mut buf = [0u8; 64];
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two!");

        let stats = accepted.stats(false).unwrap();
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_sent, 7);
    }

    #[test]
    fn clearing_read_resets_counters() {
        let (_driver, ctx) = context();
        let server = SrtServerSocket::open(&ctx, "127.0.0.1", 0, 4, &[]).unwrap();
        let mut client = SrtSocket::new(&ctx).unwrap();
        client.connect("127.0.0.1", server.port()).unwrap();
        let accepted = server.accept().unwrap().unwrap();

        accepted.send(b"abc").unwrap();
        let stats = accepted.stats(true).unwrap();
        assert_eq!((stats.packets_sent, stats.bytes_sent), (1, 3));
        let stats = accepted.stats(false).unwrap();
        assert_eq!((stats.packets_sent, stats.bytes_sent), (0, 0));

        accepted.send(b"de").unwrap();
        let stats = accepted.stats(false).unwrap();
        assert_eq!((stats.packets_sent, stats.bytes_sent), (1, 2));
    }

    #[test]
    fn peer_close_is_connection_closed() {
        let (_driver, ctx) = context();
        let server = SrtServerSocket::open(&ctx, "127.0.0.1", 0, 4, &[]).unwrap();
        let mut client = SrtSocket::new(&ctx).unwrap();
        client.connect("127.0.0.1", server.port()).unwrap();
        let accepted = server.accept().unwrap().unwrap();

        accepted.close();
        match client.recv(&mut [0u8; 8]) {
            Err(crate::StreamError::Transport(e)) => assert!(e.is_connection_closed()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn connect_refused_reports_code() {
        let (_driver, ctx) = context();
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut client = SrtSocket::new(&ctx).unwrap();
        match client.connect("127.0.0.1", port) {
            Err(crate::StreamError::Transport(e)) => {
                assert_eq!(e.kind, crate::TransportErrorKind::ConnectFailed);
                assert_eq!(e.code, code::ECONNREJ);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bad_passphrase_is_rejected() {
        let (_driver, ctx) = context();
        let options = [(SocketOption::PASSPHRASE, OptionValue::Str("short".into()))];
        match SrtServerSocket::open(&ctx, "127.0.0.1", 0, 4, &options) {
            Err(crate::StreamError::Transport(e)) => {
                assert_eq!(e.kind, crate::TransportErrorKind::OptionFailed);
                assert_eq!(e.code, code::EINVPARAM);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn handles_are_released() {
        let (driver, ctx) = context();
        let server = SrtServerSocket::open(&ctx, "127.0.0.1", 0, 4, &[]).unwrap();
        assert_eq!(driver.open_handles(), 1);
        server.close();
        assert_eq!(driver.open_handles(), 0);
        assert!(server.accept().unwrap().is_none());
    }

    #[test]
    fn context_refcount() {
        let (driver, ctx) = context();
        assert_eq!(driver.active_contexts(), 1);
        drop(ctx);
        assert_eq!(driver.active_contexts(), 0);
    }
}
