//! MPEG-2 transport stream output (ITU-T H.222.0) on top of `xmpegts`.
//!
//! A [`TsWriter`] carries a single program with at most one H.264 stream
//! and one AAC (ADTS) stream. The underlying muxer emits PAT/PMT at the
//! start of the stream, after [`TsWriter::start_segment`], and
//! periodically thereafter. The PCR rides on the video PID, or on the
//! audio PID in audio-only programs.

use std::fmt;

use bytes::BytesMut;
use xmpegts::define::{MPEG_FLAG_IDR_FRAME, epsi_stream_type};
use xmpegts::ts::TsMuxer;

use super::rtp::pts_to_clock;
use crate::error::{Result, StreamError};

pub const TS_PACKET_SIZE: usize = 188;
const TS_CLOCK: u32 = 90_000;

fn mux_error(e: impl fmt::Debug) -> StreamError {
    StreamError::Mux(format!("{e:?}"))
}

/// Transport stream writer for one H.264 and/or one AAC elementary stream.
///
/// All `write_*` methods append whole 188-byte packets to `out`.
pub struct TsWriter {
    muxer: TsMuxer,
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
}

impl fmt::Debug for TsWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsWriter")
            .field("video_pid", &self.video_pid)
            .field("audio_pid", &self.audio_pid)
            .finish_non_exhaustive()
    }
}

impl TsWriter {
    pub fn new(has_video: bool, has_audio: bool) -> Result<Self> {
        let mut muxer = TsMuxer::new();
        let video_pid = has_video
            .then(|| muxer.add_stream(epsi_stream_type::PSI_STREAM_H264, BytesMut::new()))
            .transpose()
            .map_err(mux_error)?;
        let audio_pid = has_audio
            .then(|| muxer.add_stream(epsi_stream_type::PSI_STREAM_AAC, BytesMut::new()))
            .transpose()
            .map_err(mux_error)?;
        Ok(Self {
            muxer,
            video_pid,
            audio_pid,
        })
    }

    pub fn has_video(&self) -> bool {
        self.video_pid.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio_pid.is_some()
    }

    pub fn video_pid(&self) -> Option<u16> {
        self.video_pid
    }

    pub fn audio_pid(&self) -> Option<u16> {
        self.audio_pid
    }

    /// Make the next write open with PAT/PMT, as a standalone segment must.
    pub fn start_segment(&mut self) {
        self.muxer.reset();
    }

    /// Append one H.264 access unit in Annex B form. Key frames are flagged
    /// as random access points.
    pub fn write_video(
        &mut self,
        annex_b: &[u8],
        pts_us: u64,
        key_frame: bool,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let pid = self.video_pid.ok_or(StreamError::TrackNotConfigured)?;
        let flags = if key_frame { MPEG_FLAG_IDR_FRAME } else { 0 };
        self.write(pid, pts_us, flags, annex_b, out)
    }

    /// Append one AAC frame that already carries its ADTS header.
    pub fn write_audio(&mut self, adts_frame: &[u8], pts_us: u64, out: &mut Vec<u8>) -> Result<()> {
        let pid = self.audio_pid.ok_or(StreamError::TrackNotConfigured)?;
        self.write(pid, pts_us, 0, adts_frame, out)
    }

    fn write(&mut self, pid: u16, pts_us: u64, flags: u16, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let ts = pts_to_clock(pts_us, TS_CLOCK) as i64;
        self.muxer
            .write(pid, ts, ts, flags, BytesMut::from(payload))
            .map_err(mux_error)?;
        out.extend_from_slice(&self.muxer.get_data());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAT_PID: u16 = 0x0000;

    fn packets(data: &[u8]) -> Vec<&[u8]> {
        assert_eq!(data.len() % TS_PACKET_SIZE, 0);
        data.chunks(TS_PACKET_SIZE).collect()
    }

    fn pid(packet: &[u8]) -> u16 {
        u16::from_be_bytes([packet[1], packet[2]]) & 0x1fff
    }

    fn payload(packet: &[u8]) -> &[u8] {
        if packet[3] & 0x20 != 0 {
            &packet[5 + packet[4] as usize..]
        } else {
            &packet[4..]
        }
    }

    /// Concatenated payloads of every packet on `pid`.
    fn elementary(data: &[u8], pid_of: u16) -> Vec<u8> {
        packets(data)
            .into_iter()
            .filter(|p| pid(p) == pid_of)
            .flat_map(|p| payload(p).to_vec())
            .collect()
    }

    fn decode_pts(b: &[u8]) -> u64 {
        (((b[0] as u64 >> 1) & 0x07) << 30)
            | ((u16::from_be_bytes([b[1], b[2]]) as u64 >> 1) << 15)
            | (u16::from_be_bytes([b[3], b[4]]) as u64 >> 1)
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn first_write_opens_with_tables() {
        let mut writer = TsWriter::new(true, false).unwrap();
        let mut out = Vec::new();
        writer.write_video(&[0, 0, 0, 1, 0x65, 1, 2, 3], 0, true, &mut out).unwrap();

        let pkts = packets(&out);
        assert!(pkts.len() >= 3);
        assert!(pkts.iter().all(|p| p[0] == 0x47));
        assert_eq!(pid(pkts[0]), PAT_PID);
        // PMT: pointer field, then table_id 2.
        assert_eq!(&payload(pkts[1])[..2], &[0x00, 0x02]);
        assert_eq!(pid(pkts[pkts.len() - 1]), writer.video_pid().unwrap());
    }

    #[test]
    fn video_pes_carries_pts_and_frame() {
        let mut writer = TsWriter::new(true, false).unwrap();
        let mut out = Vec::new();
        let mut frame = vec![0, 0, 0, 1, 0x65];
        frame.extend((0..1000u32).map(|i| i as u8));
        writer.write_video(&frame, 1_000_000, true, &mut out).unwrap();

        let video_pid = writer.video_pid().unwrap();
        let video: Vec<&[u8]> = packets(&out).into_iter().filter(|p| pid(p) == video_pid).collect();
        assert!(video.len() > 5);
        for pair in video.windows(2) {
            assert_eq!(pair[1][3] & 0x0f, (pair[0][3] + 1) & 0x0f);
        }

        let pes = elementary(&out, video_pid);
        assert_eq!(&pes[..4], &[0, 0, 1, 0xe0]);
        assert_eq!(decode_pts(&pes[9..14]), 90000);
        assert!(contains(&pes, &frame));
    }

    #[test]
    fn audio_only_program() {
        let mut writer = TsWriter::new(false, true).unwrap();
        assert!(!writer.has_video());
        let mut out = Vec::new();
        assert!(matches!(
            writer.write_video(&[0, 0, 0, 1, 0x65], 0, true, &mut out),
            Err(StreamError::TrackNotConfigured)
        ));

        let frame = [0xffu8, 0xf1, 0x50, 0x80, 0x01, 0x7f, 0xfc, 1, 2, 3];
        writer.write_audio(&frame, 500_000, &mut out).unwrap();
        assert_eq!(pid(packets(&out)[0]), PAT_PID);

        let pes = elementary(&out, writer.audio_pid().unwrap());
        assert_eq!(&pes[..4], &[0, 0, 1, 0xc0]);
        assert_eq!(decode_pts(&pes[9..14]), 45000);
        assert!(contains(&pes, &frame));
    }

    #[test]
    fn new_segment_repeats_tables() {
        let mut writer = TsWriter::new(true, false).unwrap();
        let mut out = Vec::new();
        writer.write_video(&[0, 0, 0, 1, 0x65, 1], 0, true, &mut out).unwrap();

        writer.start_segment();
        out.clear();
        writer.write_video(&[0, 0, 0, 1, 0x41, 1], 33_333, false, &mut out).unwrap();
        assert_eq!(pid(packets(&out)[0]), PAT_PID);
    }
}
