pub mod error;
pub mod media;
pub mod muxer;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod session;
pub mod transport;

pub use error::{Result, StreamError, TransportError, TransportErrorKind};
pub use media::{AccessUnit, AudioFormat, AudioQuality, BufferFlags, Packetizer, VideoFormat, VideoQuality};
pub use muxer::{AnyMuxer, Muxer};
pub use server::{ClientInfo, ServerConfig, ServerEvent, SrtServer};
pub use session::{Session, SessionState};
