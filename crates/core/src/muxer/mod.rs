//! Output containers.
//!
//! Every muxer receives the same encoder callbacks through [`Muxer`]:
//!
//! ```text
//! on_prepare ─► on_*_format_changed ─► on_write_*_data … ─► on_released
//! ```
//!
//! Video and audio callbacks arrive from different encoder threads, so all
//! methods take `&self` and muxers synchronize internally. A write only
//! returns an error for a fatal disconnect ([`StreamError::Disconnected`]);
//! other steady-state problems are logged and the frame is skipped.
//!
//! | Muxer | Output |
//! |-------|--------|
//! | [`RtpMuxer`] | RTP over UDP, one port pair per track, plus SDP |
//! | [`RtmpMuxer`] | FLV tags published to an RTMP server |
//! | [`HlsMuxer`] | MPEG-TS segments and a sliding `.m3u8` playlist |
//! | [`Mp4Muxer`] | Progressive `.mp4` file |
//! | [`SrtMuxer`] | MPEG-TS messages fanned out by an [`SrtServer`](crate::server::SrtServer) |
//!
//! [`StreamError::Disconnected`]: crate::error::StreamError::Disconnected

pub mod hls;
pub mod mp4;
#[cfg(feature = "rtmp")]
pub mod rtmp;
pub mod rtp;
pub mod srt;

pub use hls::{HlsConfig, HlsMuxer, Segmenter};
pub use mp4::{Mp4Muxer, Mp4MuxerConfig};
#[cfg(feature = "rtmp")]
pub use rtmp::{RtmpMuxer, RtmpMuxerConfig};
pub use rtp::{RtpMuxer, RtpMuxerConfig};
pub use srt::{SrtMuxer, SrtMuxerConfig};

use crate::error::Result;
use crate::media::{AccessUnit, AudioFormat, AudioQuality, VideoFormat, VideoQuality};

/// Encoder-facing container interface.
pub trait Muxer: Send + Sync {
    /// Allocate output resources for the configured tracks. Blocks until
    /// any transport negotiation finishes. An error aborts the session.
    fn on_prepare(&self, video: Option<&VideoQuality>, audio: Option<&AudioQuality>) -> Result<()>;

    fn on_video_format_changed(&self, format: &VideoFormat) -> Result<()>;

    fn on_write_video_data(&self, unit: &AccessUnit<'_>) -> Result<()>;

    fn on_audio_format_changed(&self, format: &AudioFormat) -> Result<()>;

    fn on_write_audio_data(&self, unit: &AccessUnit<'_>) -> Result<()>;

    /// Release output resources. Idempotent and safe against concurrent writes.
    fn on_released(&self);
}

/// Muxer chosen once per session.
#[derive(Debug)]
pub enum AnyMuxer {
    Rtp(RtpMuxer),
    #[cfg(feature = "rtmp")]
    Rtmp(RtmpMuxer),
    Hls(HlsMuxer),
    Mp4(Mp4Muxer),
    Srt(SrtMuxer),
}

macro_rules! dispatch {
    ($self:ident, $m:ident => $body:expr) => {
        match $self {
            AnyMuxer::Rtp($m) => $body,
            #[cfg(feature = "rtmp")]
            AnyMuxer::Rtmp($m) => $body,
            AnyMuxer::Hls($m) => $body,
            AnyMuxer::Mp4($m) => $body,
            AnyMuxer::Srt($m) => $body,
        }
    };
}

impl AnyMuxer {
    pub fn name(&self) -> &'static str {
        match self {
            AnyMuxer::Rtp(_) => "rtp",
            #[cfg(feature = "rtmp")]
            AnyMuxer::Rtmp(_) => "rtmp",
            AnyMuxer::Hls(_) => "hls",
            AnyMuxer::Mp4(_) => "mp4",
            AnyMuxer::Srt(_) => "srt",
        }
    }
}

impl Muxer for AnyMuxer {
    fn on_prepare(&self, video: Option<&VideoQuality>, audio: Option<&AudioQuality>) -> Result<()> {
        dispatch!(self, m => m.on_prepare(video, audio))
    }

    fn on_video_format_changed(&self, format: &VideoFormat) -> Result<()> {
        dispatch!(self, m => m.on_video_format_changed(format))
    }

    fn on_write_video_data(&self, unit: &AccessUnit<'_>) -> Result<()> {
        dispatch!(self, m => m.on_write_video_data(unit))
    }

    fn on_audio_format_changed(&self, format: &AudioFormat) -> Result<()> {
        dispatch!(self, m => m.on_audio_format_changed(format))
    }

    fn on_write_audio_data(&self, unit: &AccessUnit<'_>) -> Result<()> {
        dispatch!(self, m => m.on_write_audio_data(unit))
    }

    fn on_released(&self) {
        dispatch!(self, m => m.on_released())
    }
}

impl From<RtpMuxer> for AnyMuxer {
    fn from(m: RtpMuxer) -> Self {
        AnyMuxer::Rtp(m)
    }
}

#[cfg(feature = "rtmp")]
impl From<RtmpMuxer> for AnyMuxer {
    fn from(m: RtmpMuxer) -> Self {
        AnyMuxer::Rtmp(m)
    }
}

impl From<HlsMuxer> for AnyMuxer {
    fn from(m: HlsMuxer) -> Self {
        AnyMuxer::Hls(m)
    }
}

impl From<Mp4Muxer> for AnyMuxer {
    fn from(m: Mp4Muxer) -> Self {
        AnyMuxer::Mp4(m)
    }
}

impl From<SrtMuxer> for AnyMuxer {
    fn from(m: SrtMuxer) -> Self {
        AnyMuxer::Srt(m)
    }
}
