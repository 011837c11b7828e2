use super::{OptionValue, SocketOption, SrtStats};

/// Native call result: the error side is the library's error code.
pub type DriverResult<T> = std::result::Result<T, i32>;

/// Boundary to the native SRT library.
///
/// Handles are opaque integers owned by the driver. Every method may be
/// called concurrently from different threads; `accept` and `recv` block,
/// and `close` on a handle must unblock them.
pub trait Driver: Send + Sync {
    /// Process-wide initialization, paired with [`cleanup`](Self::cleanup).
    fn startup(&self) -> DriverResult<()>;

    fn cleanup(&self);

    fn create_socket(&self) -> DriverResult<i32>;

    fn set_option(&self, handle: i32, option: SocketOption, value: &OptionValue) -> DriverResult<()>;

    /// Bind and start listening.
    fn listen(&self, handle: i32, address: &str, port: u16, backlog: u32) -> DriverResult<()>;

    fn local_port(&self, handle: i32) -> DriverResult<u16>;

    /// Block for the next connection; returns its handle and `ip:port`.
    fn accept(&self, listener: i32) -> DriverResult<(i32, String)>;

    fn connect(&self, handle: i32, address: &str, port: u16) -> DriverResult<()>;

    /// Send one message; returns the bytes accepted.
    fn send(&self, handle: i32, data: &[u8]) -> DriverResult<usize>;

    /// Receive one message into `buf`.
    fn recv(&self, handle: i32, buf: &mut [u8]) -> DriverResult<usize>;

    /// Release the handle. Unknown handles are ignored.
    fn close(&self, handle: i32);

    fn stats(&self, handle: i32, clear: bool) -> DriverResult<SrtStats>;
}
