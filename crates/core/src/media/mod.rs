//! Media codecs, container framers and RTP packetization.
//!
//! This module provides the encoder-facing data model ([`AccessUnit`],
//! [`VideoFormat`], [`AudioFormat`]), the [`Packetizer`] trait, and the
//! codec-specific framers that the muxers in [`crate::muxer`] compose.
//!
//! ## RTP overview (RFC 3550)
//!
//! Each encoded access unit is split into one or more RTP packets.
//! Every RTP packet carries a 12-byte fixed header ([`rtp::RtpHeader`])
//! containing:
//!
//! - **Sequence number** (16-bit, wrapping): reordering and loss detection.
//! - **Timestamp** (32-bit): presentation time on the payload clock.
//! - **SSRC** (32-bit): randomly chosen to identify the sender.
//! - **Marker bit**: set on the last packet of an access unit.
//!
//! ## Framers
//!
//! | Format | Module | Reference |
//! |--------|--------|-----------|
//! | H.264 over RTP | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) |
//! | AAC over RTP | [`aac`] | [RFC 3640](https://tools.ietf.org/html/rfc3640) |
//! | ADTS | [`adts`] | ISO/IEC 13818-7 |
//! | MPEG-TS | [`mpegts`] | ITU-T H.222.0 |
//! | FLV tag bodies | [`flv`] | FLV v10.1 |
//! | MP4 | [`mp4`] | ISO/IEC 14496-12/15 |

pub mod aac;
pub mod adts;
pub mod flv;
pub mod h264;
pub mod mp4;
pub mod mpegts;
pub mod rtp;

use crate::error::Result;
use crate::protocol::sdp::Attribute;

/// Flags attached to an encoded buffer by the encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags(u8);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    /// Buffer holds codec configuration (SPS/PPS, AudioSpecificConfig), not media.
    pub const CODEC_CONFIG: Self = Self(0b001);
    /// Buffer holds a sync sample (IDR for H.264).
    pub const KEY_FRAME: Self = Self(0b010);
    /// Last buffer of the stream.
    pub const END_OF_STREAM: Self = Self(0b100);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// One encoded frame as handed over by an encoder callback.
///
/// The data is borrowed for the duration of the call only; anything a
/// muxer needs later must be copied out.
#[derive(Debug, Clone, Copy)]
pub struct AccessUnit<'a> {
    pub data: &'a [u8],
    pub flags: BufferFlags,
    /// Presentation timestamp in microseconds from session start.
    pub pts_us: u64,
}

impl<'a> AccessUnit<'a> {
    pub fn new(data: &'a [u8], pts_us: u64) -> Self {
        Self {
            data,
            flags: BufferFlags::NONE,
            pts_us,
        }
    }

    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_codec_config(&self) -> bool {
        self.flags.contains(BufferFlags::CODEC_CONFIG)
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(BufferFlags::KEY_FRAME)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }
}

/// H.264 output format reported once by the video encoder.
///
/// `sps`/`pps` are raw NAL units without start codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

impl VideoFormat {
    /// Build a format from an Annex B codec-config buffer (`00 00 00 01 SPS 00 00 00 01 PPS`).
    pub fn from_codec_config(width: u32, height: u32, config: &[u8]) -> Result<Self> {
        let sets = h264::ParameterSets::from_config(config);
        match (sets.sps, sets.pps) {
            (Some(sps), Some(pps)) => Ok(Self {
                width,
                height,
                sps,
                pps,
            }),
            _ => Err(crate::StreamError::MissingParameterSets),
        }
    }
}

/// AAC output format reported once by the audio encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channel_count: u8,
    /// MPEG-4 audio object type (2 = AAC LC).
    pub profile: u8,
}

impl AudioFormat {
    pub fn aac_lc(sample_rate: u32, channel_count: u8) -> Self {
        Self {
            sample_rate,
            channel_count,
            profile: adts::AAC_LC,
        }
    }
}

/// Video encoder settings the session was configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoQuality {
    pub width: u32,
    pub height: u32,
    pub bitrate: u32,
    pub frame_rate: u32,
    pub key_frame_interval_secs: u32,
}

impl Default for VideoQuality {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            bitrate: 2_000_000,
            frame_rate: 30,
            key_frame_interval_secs: 1,
        }
    }
}

/// Audio encoder settings the session was configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioQuality {
    pub sample_rate: u32,
    pub channel_count: u8,
    pub bitrate: u32,
}

impl Default for AudioQuality {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channel_count: 1,
            bitrate: 64_000,
        }
    }
}

/// Codec-specific RTP packetizer.
///
/// Each supported codec implements this trait, providing:
/// - **Packetization**: splitting an access unit into RTP-sized packets
/// - **SDP attributes**: codec parameters for the media description
/// - **RTP metadata**: payload type, clock rate, sequence/timestamp state
///
/// The generic RTP header is handled by [`rtp::RtpHeader`]; packetizers
/// compose it rather than reimplementing header serialization.
pub trait Packetizer: Send {
    /// Packetize one access unit into RTP packets.
    ///
    /// Each returned `Vec<u8>` is a complete RTP packet: 12-byte header
    /// (RFC 3550 §5.1) followed by the codec-specific payload. Config
    /// buffers are absorbed and produce no packets.
    fn packetize(&mut self, unit: &AccessUnit<'_>) -> Result<Vec<Vec<u8>>>;

    /// SDP media type (`"video"` or `"audio"`).
    fn media_type(&self) -> &'static str;

    /// Codec name for the SDP `a=rtpmap` attribute (e.g. `"H264"`).
    fn codec_name(&self) -> &'static str;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    /// RTP payload type number (RFC 3551). Dynamic types use 96–127.
    fn payload_type(&self) -> u8;

    /// Media-level SDP attributes (`rtpmap` first, then `fmtp`).
    fn sdp_attributes(&self) -> Vec<Attribute>;

    /// Sequence number the next packet will carry.
    fn next_sequence(&self) -> u16;

    /// RTP timestamp of the most recent access unit.
    fn next_rtp_timestamp(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let flags = BufferFlags::KEY_FRAME | BufferFlags::END_OF_STREAM;
        assert!(flags.contains(BufferFlags::KEY_FRAME));
        assert!(flags.contains(BufferFlags::END_OF_STREAM));
        assert!(!flags.contains(BufferFlags::CODEC_CONFIG));
    }

    #[test]
    fn access_unit_flag_accessors() {
        let data = [0u8; 4];
        let unit = AccessUnit::new(&data, 33_000).with_flags(BufferFlags::CODEC_CONFIG);
        assert!(unit.is_codec_config());
        assert!(!unit.is_key_frame());
        assert_eq!(unit.pts_us, 33_000);
    }

    #[test]
    fn video_format_from_config() {
        let config = [0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e, 0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80];
        let format = VideoFormat::from_codec_config(640, 480, &config).unwrap();
        assert_eq!(format.sps, vec![0x67, 0x42, 0x00, 0x1e]);
        assert_eq!(format.pps, vec![0x68, 0xce, 0x38, 0x80]);
    }

    #[test]
    fn video_format_requires_both_sets() {
        let config = [0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1e];
        assert!(matches!(
            VideoFormat::from_codec_config(640, 480, &config),
            Err(crate::StreamError::MissingParameterSets)
        ));
    }
}
