//! Network transports.
//!
//! - **SRT** ([`srt`]): message-oriented reliable connections behind a
//!   native driver seam, used by the server for fan-out.
//! - **UDP** ([`udp`]): RTP/RTCP socket pairs for the RTP muxer.
//! - **RTMP** ([`rtmp`]): publishing client for the RTMP muxer.

#[cfg(feature = "rtmp")]
pub mod rtmp;
pub mod srt;
pub mod udp;

pub use srt::{SrtContext, SrtServerSocket, SrtSocket, TcpDriver};
pub use udp::UdpPair;
