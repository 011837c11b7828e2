//! ADTS framing for raw AAC access units (ISO/IEC 13818-7 §6.2).
//!
//! ```text
//! AAAAAAAA AAAABCCD EEFFFFGH HHIJKLMM MMMMMMMM MMMOOOOO OOOOOOPP
//!
//! A  syncword 0xFFF          B  MPEG version (0 = MPEG-4)
//! C  layer (always 0)        D  protection absent (1 = no CRC)
//! E  profile (object type-1) F  sampling frequency index
//! H  channel configuration   M  frame length incl. header
//! O  buffer fullness (0x7FF) P  raw data blocks - 1
//! ```

use crate::error::{Result, StreamError};

use super::AudioFormat;

/// Header length without CRC.
pub const ADTS_HEADER_LEN: usize = 7;

/// MPEG-4 audio object type for AAC LC.
pub const AAC_LC: u8 = 2;

const MAX_FRAME_LEN: usize = (1 << 13) - 1;

/// Sampling frequencies addressable by the 4-bit index.
pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Position of `rate` in [`SAMPLE_RATES`].
pub fn sample_rate_index(rate: u32) -> Result<u8> {
    SAMPLE_RATES
        .iter()
        .position(|&r| r == rate)
        .map(|i| i as u8)
        .ok_or(StreamError::UnsupportedSampleRate(rate))
}

/// Check that `format` fits the 2-bit ADTS profile, the 3-bit channel
/// configuration and the sampling frequency table.
pub fn validate(format: &AudioFormat) -> Result<()> {
    if !(1..=4).contains(&format.profile) || !(1..=7).contains(&format.channel_count) {
        return Err(StreamError::UnsupportedAudioFormat {
            profile: format.profile,
            channels: format.channel_count,
        });
    }
    sample_rate_index(format.sample_rate).map(drop)
}

/// Two-byte `AudioSpecificConfig` (ISO/IEC 14496-3 §1.6.2.1), as carried in
/// SDP `config=`, FLV sequence headers and the MP4 `esds` box.
pub fn audio_specific_config(format: &AudioFormat) -> Result<[u8; 2]> {
    validate(format)?;
    let index = sample_rate_index(format.sample_rate)? as u16;
    let value = ((format.profile as u16) << 11) | (index << 7) | ((format.channel_count as u16) << 3);
    Ok(value.to_be_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    /// MPEG-4 audio object type (1..=4).
    pub profile: u8,
    pub sample_rate_index: u8,
    pub channel_config: u8,
    /// Header plus payload, in bytes.
    pub frame_length: u16,
}

impl AdtsHeader {
    /// Header for a payload of `payload_len` bytes in `format`.
    pub fn for_payload(format: &AudioFormat, payload_len: usize) -> Result<Self> {
        let frame_length = payload_len + ADTS_HEADER_LEN;
        if frame_length > MAX_FRAME_LEN {
            return Err(StreamError::InvalidState("AAC frame exceeds ADTS length field"));
        }
        validate(format)?;
        Ok(Self {
            profile: format.profile,
            sample_rate_index: sample_rate_index(format.sample_rate)?,
            channel_config: format.channel_count,
            frame_length: frame_length as u16,
        })
    }

    /// Serialize. Fields are expected in range, as built by
    /// [`for_payload`](Self::for_payload) or [`parse`](Self::parse).
    pub fn write(&self) -> [u8; ADTS_HEADER_LEN] {
        let len = self.frame_length;
        let profile = self.profile.wrapping_sub(1) & 0x03;
        [
            0xff,
            0xf1,
            (profile << 6) | ((self.sample_rate_index & 0x0f) << 2) | (self.channel_config >> 2),
            ((self.channel_config & 0x03) << 6) | ((len >> 11) as u8 & 0x03),
            (len >> 3) as u8,
            (((len & 0x07) as u8) << 5) | 0x1f,
            0xfc,
        ]
    }

    /// Parse a header, or `None` when the sync word is absent or input is short.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ADTS_HEADER_LEN || data[0] != 0xff || data[1] & 0xf0 != 0xf0 {
            return None;
        }
        let frame_length = ((data[3] as u16 & 0x03) << 11)
            | ((data[4] as u16) << 3)
            | ((data[5] as u16) >> 5);
        Some(Self {
            profile: (data[2] >> 6) + 1,
            sample_rate_index: (data[2] >> 2) & 0x0f,
            channel_config: ((data[2] & 0x01) << 2) | (data[3] >> 6),
            frame_length,
        })
    }

    pub fn sample_rate(&self) -> Option<u32> {
        SAMPLE_RATES.get(self.sample_rate_index as usize).copied()
    }
}

/// Prefix `payload` with its ADTS header.
pub fn frame(format: &AudioFormat, payload: &[u8]) -> Result<Vec<u8>> {
    let header = AdtsHeader::for_payload(format, payload.len())?;
    let mut out = Vec::with_capacity(header.frame_length as usize);
    out.extend_from_slice(&header.write());
    out.extend_from_slice(payload);
    Ok(out)
}
