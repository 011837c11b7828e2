use super::adts::{self, ADTS_HEADER_LEN, AdtsHeader};
use super::rtp::{RTP_HEADER_LEN, RtpHeader};
use super::{AccessUnit, AudioFormat, Packetizer};
use crate::error::Result;
use crate::protocol::sdp::Attribute;

/// Length of the AU-headers-length field plus one AAC-hbr AU header.
const AU_HEADER_SECTION_LEN: usize = 4;

/// AAC RTP packetizer (RFC 3640, `mode=AAC-hbr`).
///
/// Each raw AAC access unit is sent in its own RTP packet behind a 4-byte
/// AU header section:
///
/// ```text
/// +--------------------------+------------------------------+
/// | AU-headers-length = 16   | AU-size (13) | AU-index (3)  |
/// +--------------------------+------------------------------+
/// ```
///
/// Access units never span packets, so the marker bit is always set.
/// The RTP clock equals the sampling rate.
#[derive(Debug)]
pub struct AacPacketizer {
    header: RtpHeader,
    format: AudioFormat,
    config: [u8; 2],
}

impl AacPacketizer {
    /// Fails with `UnsupportedSampleRate` when the rate has no ADTS index.
    pub fn new(pt: u8, ssrc: u32, format: AudioFormat) -> Result<Self> {
        let config = adts::audio_specific_config(&format)?;
        Ok(Self {
            header: RtpHeader::new(pt, ssrc, format.sample_rate),
            format,
            config,
        })
    }

    pub fn with_random_ssrc(pt: u8, format: AudioFormat) -> Result<Self> {
        let config = adts::audio_specific_config(&format)?;
        Ok(Self {
            header: RtpHeader::with_random_ssrc(pt, format.sample_rate),
            format,
            config,
        })
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn config_hex(&self) -> String {
        self.config.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl Packetizer for AacPacketizer {
    fn packetize(&mut self, unit: &AccessUnit<'_>) -> Result<Vec<Vec<u8>>> {
        if unit.data.is_empty() || unit.is_codec_config() {
            return Ok(Vec::new());
        }

        // Some encoders hand over ADTS frames; RTP carries the raw AU.
        let payload = match AdtsHeader::parse(unit.data) {
            Some(_) => &unit.data[ADTS_HEADER_LEN..],
            None => unit.data,
        };
        let au_size = (payload.len() as u16) & 0x1fff;

        self.header.set_presentation_time(unit.pts_us);
        let hdr = self.header.write(true);

        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + AU_HEADER_SECTION_LEN + payload.len());
        packet.extend_from_slice(&hdr);
        packet.extend_from_slice(&16u16.to_be_bytes());
        packet.extend_from_slice(&(au_size << 3).to_be_bytes());
        packet.extend_from_slice(payload);

        tracing::trace!(
            au_size,
            seq = self.header.sequence(),
            ts = self.header.timestamp(),
            "AAC access unit packetized"
        );

        Ok(vec![packet])
    }

    fn media_type(&self) -> &'static str {
        "audio"
    }

    fn codec_name(&self) -> &'static str {
        "mpeg4-generic"
    }

    fn clock_rate(&self) -> u32 {
        self.format.sample_rate
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn sdp_attributes(&self) -> Vec<Attribute> {
        let pt = self.payload_type();
        vec![
            Attribute::value(
                "rtpmap",
                format!(
                    "{} {}/{}/{}",
                    pt,
                    self.codec_name(),
                    self.clock_rate(),
                    self.format.channel_count
                ),
            ),
            Attribute::value(
                "fmtp",
                format!(
                    "{pt} streamtype=5;profile-level-id=15;mode=AAC-hbr;config={};\
                     SizeLength=13;IndexLength=3;IndexDeltaLength=3",
                    self.config_hex()
                ),
            ),
        ]
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn next_rtp_timestamp(&self) -> u32 {
        self.header.timestamp() as u32
    }
}
