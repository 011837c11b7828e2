//! FLV audio/video tag bodies (FLV v10.1 §E.4.2/§E.4.3) as carried in
//! RTMP message payloads.

use bytes::{BufMut, Bytes, BytesMut};

use super::AudioFormat;
use super::{adts, h264};
use crate::error::Result;

const CODEC_AVC: u8 = 7;
const FRAME_KEY: u8 = 1;
const FRAME_INTER: u8 = 2;

const AVC_SEQUENCE_HEADER: u8 = 0;
const AVC_NALU: u8 = 1;

/// SoundFormat 10 (AAC), 44 kHz, 16-bit, stereo. FLV requires these fixed
/// values for AAC; the real parameters live in the AudioSpecificConfig.
const AAC_SOUND_HEADER: u8 = 0xaf;
const AAC_SEQUENCE_HEADER: u8 = 0;
const AAC_RAW: u8 = 1;

fn video_header(buf: &mut BytesMut, key_frame: bool, packet_type: u8, composition_ms: i32) {
    let frame = if key_frame { FRAME_KEY } else { FRAME_INTER };
    buf.put_u8((frame << 4) | CODEC_AVC);
    buf.put_u8(packet_type);
    let cts = composition_ms.to_be_bytes();
    buf.put_slice(&cts[1..]);
}

/// AVC sequence header carrying the decoder configuration record.
pub fn avc_sequence_header(sps: &[u8], pps: &[u8]) -> Bytes {
    let record = h264::avc_decoder_configuration_record(sps, pps);
    let mut buf = BytesMut::with_capacity(5 + record.len());
    video_header(&mut buf, true, AVC_SEQUENCE_HEADER, 0);
    buf.put_slice(&record);
    buf.freeze()
}

/// AVC NALU tag from an Annex B access unit. `None` when nothing but
/// parameter sets or delimiters remain after conversion.
pub fn avc_nalu(annex_b: &[u8], key_frame: bool) -> Option<Bytes> {
    let avcc = h264::annex_b_to_avcc(annex_b);
    if avcc.is_empty() {
        return None;
    }
    let mut buf = BytesMut::with_capacity(5 + avcc.len());
    video_header(&mut buf, key_frame, AVC_NALU, 0);
    buf.put_slice(&avcc);
    Some(buf.freeze())
}

/// AAC sequence header carrying the AudioSpecificConfig.
pub fn aac_sequence_header(format: &AudioFormat) -> Result<Bytes> {
    let config = adts::audio_specific_config(format)?;
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(AAC_SOUND_HEADER);
    buf.put_u8(AAC_SEQUENCE_HEADER);
    buf.put_slice(&config);
    Ok(buf.freeze())
}

/// Raw AAC tag. A leading ADTS header is stripped.
pub fn aac_raw(frame: &[u8]) -> Bytes {
    let raw = match adts::AdtsHeader::parse(frame) {
        Some(_) => &frame[adts::ADTS_HEADER_LEN..],
        None => frame,
    };
    let mut buf = BytesMut::with_capacity(2 + raw.len());
    buf.put_u8(AAC_SOUND_HEADER);
    buf.put_u8(AAC_RAW);
    buf.put_slice(raw);
    buf.freeze()
}
