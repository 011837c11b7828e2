//! HTTP Live Streaming output.
//!
//! [`HlsMuxer`] adapts encoder callbacks to a [`Segmenter`], which writes
//! MPEG-TS segments to disk and keeps a sliding-window media playlist next
//! to them:
//!
//! ```text
//! out/
//! ├── index.m3u8
//! ├── segment7.ts
//! ├── segment8.ts
//! └── segment9.ts
//! ```
//!
//! With video, segments are cut only on key frames once the target duration
//! has elapsed, so every segment starts decodable. Audio-only streams cut
//! on any frame.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use super::Muxer;
use crate::error::{Result, StreamError};
use crate::media::adts::{self, AdtsHeader};
use crate::media::h264::ParameterSets;
use crate::media::mpegts::TsWriter;
use crate::media::{AccessUnit, AudioFormat, AudioQuality, VideoFormat, VideoQuality};

#[derive(Debug, Clone)]
pub struct HlsConfig {
    pub output_dir: PathBuf,
    pub playlist_name: String,
    /// Segment files are named `<prefix><sequence>.ts`.
    pub segment_prefix: String,
    pub target_duration: Duration,
    /// Segments listed in the playlist.
    pub window: usize,
    /// Remove segment files that slide out of the window.
    pub delete_old_segments: bool,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("hls"),
            playlist_name: "index.m3u8".to_string(),
            segment_prefix: "segment".to_string(),
            target_duration: Duration::from_secs(2),
            window: 5,
            delete_old_segments: true,
        }
    }
}

impl HlsConfig {
    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(&self.playlist_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SegmentEntry {
    sequence: u64,
    name: String,
    duration_secs: f64,
}

#[derive(Debug)]
struct OpenSegment {
    sequence: u64,
    name: String,
    file: BufWriter<File>,
    start_us: u64,
}

/// MPEG-TS segment writer with a sliding-window playlist.
#[derive(Debug)]
pub struct Segmenter {
    config: HlsConfig,
    ts: TsWriter,
    current: Option<OpenSegment>,
    segments: VecDeque<SegmentEntry>,
    next_sequence: u64,
    last_pts_us: u64,
    buf: Vec<u8>,
    finished: bool,
}

impl Segmenter {
    pub fn new(config: HlsConfig, has_video: bool, has_audio: bool) -> Result<Self> {
        Ok(Self {
            config,
            ts: TsWriter::new(has_video, has_audio)?,
            current: None,
            segments: VecDeque::new(),
            next_sequence: 0,
            last_pts_us: 0,
            buf: Vec::with_capacity(64 * 1024),
            finished: false,
        })
    }

    /// Write one Annex B access unit. Frames before the first key frame are
    /// dropped.
    pub fn write_video(&mut self, annex_b: &[u8], pts_us: u64, key_frame: bool) -> Result<()> {
        if self.finished {
            return Err(StreamError::InvalidState("segmenter finished"));
        }
        if key_frame && self.segment_full(pts_us) {
            self.cut(pts_us)?;
        }
        if self.current.is_none() {
            tracing::trace!(pts_us, "waiting for key frame");
            return Ok(());
        }

        self.buf.clear();
        self.ts.write_video(annex_b, pts_us, key_frame, &mut self.buf)?;
        self.append(pts_us)
    }

    /// Write one ADTS frame. In streams with video, audio before the first
    /// segment is dropped.
    pub fn write_audio(&mut self, adts_frame: &[u8], pts_us: u64) -> Result<()> {
        if self.finished {
            return Err(StreamError::InvalidState("segmenter finished"));
        }
        if !self.ts.has_video() && self.segment_full(pts_us) {
            self.cut(pts_us)?;
        }
        if self.current.is_none() {
            return Ok(());
        }

        self.buf.clear();
        self.ts.write_audio(adts_frame, pts_us, &mut self.buf)?;
        self.append(pts_us)
    }

    /// Close the open segment and mark the playlist complete. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.close_segment(self.last_pts_us)?;
        self.write_playlist()
    }

    /// Names of the segments currently in the playlist, oldest first.
    pub fn segment_names(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.name.clone()).collect()
    }

    pub fn playlist(&self) -> String {
        let target = self
            .segments
            .iter()
            .map(|s| s.duration_secs)
            .fold(self.config.target_duration.as_secs_f64(), f64::max)
            .ceil() as u64;
        let media_sequence = self.segments.front().map_or(self.next_sequence, |s| s.sequence);

        let mut out = String::new();
        let _ = writeln!(out, "#EXTM3U");
        let _ = writeln!(out, "#EXT-X-VERSION:3");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target}");
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{media_sequence}");
        for segment in &self.segments {
            let _ = writeln!(out, "#EXTINF:{:.3},", segment.duration_secs);
            let _ = writeln!(out, "{}", segment.name);
        }
        if self.finished {
            let _ = writeln!(out, "#EXT-X-ENDLIST");
        }
        out
    }

    fn segment_full(&self, pts_us: u64) -> bool {
        match &self.current {
            None => true,
            Some(seg) => {
                pts_us.saturating_sub(seg.start_us) >= self.config.target_duration.as_micros() as u64
            }
        }
    }

    fn append(&mut self, pts_us: u64) -> Result<()> {
        if let Some(seg) = self.current.as_mut() {
            seg.file.write_all(&self.buf)?;
        }
        self.last_pts_us = self.last_pts_us.max(pts_us);
        Ok(())
    }

    fn cut(&mut self, pts_us: u64) -> Result<()> {
        if self.current.is_some() {
            self.close_segment(pts_us)?;
            self.write_playlist()?;
        }
        self.open_segment(pts_us)
    }

    fn open_segment(&mut self, pts_us: u64) -> Result<()> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let name = format!("{}{}.ts", self.config.segment_prefix, sequence);
        let file = File::create(self.config.output_dir.join(&name))?;
        let file = BufWriter::new(file);
        self.ts.start_segment();

        tracing::debug!(segment = %name, pts_us, "HLS segment opened");
        self.current = Some(OpenSegment {
            sequence,
            name,
            file,
            start_us: pts_us,
        });
        Ok(())
    }

    fn close_segment(&mut self, end_us: u64) -> Result<()> {
        let Some(mut seg) = self.current.take() else {
            return Ok(());
        };
        seg.file.flush()?;
        let duration_secs = end_us.saturating_sub(seg.start_us) as f64 / 1_000_000.0;
        tracing::debug!(segment = %seg.name, duration_secs, "HLS segment closed");

        self.segments.push_back(SegmentEntry {
            sequence: seg.sequence,
            name: seg.name,
            duration_secs,
        });
        while self.segments.len() > self.config.window.max(1) {
            if let Some(old) = self.segments.pop_front() {
                if self.config.delete_old_segments {
                    remove_segment(&self.config.output_dir.join(&old.name));
                }
            }
        }
        Ok(())
    }

    fn write_playlist(&self) -> Result<()> {
        let path = self.config.playlist_path();
        let tmp = path.with_extension("m3u8.tmp");
        fs::write(&tmp, self.playlist())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn remove_segment(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to delete old segment");
    }
}

#[derive(Debug, Default)]
struct HlsState {
    segmenter: Option<Segmenter>,
    /// `00 00 00 01 SPS 00 00 00 01 PPS`, prepended to key frames.
    parameter_sets: Option<Vec<u8>>,
    audio_format: Option<AudioFormat>,
}

/// HLS output muxer.
#[derive(Debug)]
pub struct HlsMuxer {
    config: HlsConfig,
    state: Mutex<HlsState>,
}

impl HlsMuxer {
    pub fn new(config: HlsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HlsState::default()),
        }
    }

    pub fn config(&self) -> &HlsConfig {
        &self.config
    }

    /// Segments currently listed in the playlist.
    pub fn segment_names(&self) -> Vec<String> {
        self.state
            .lock()
            .segmenter
            .as_ref()
            .map(Segmenter::segment_names)
            .unwrap_or_default()
    }
}

impl Muxer for HlsMuxer {
    fn on_prepare(&self, video: Option<&VideoQuality>, audio: Option<&AudioQuality>) -> Result<()> {
        if video.is_none() && audio.is_none() {
            return Err(StreamError::TrackNotConfigured);
        }
        let audio_format = audio.map(|q| AudioFormat::aac_lc(q.sample_rate, q.channel_count));
        if let Some(format) = &audio_format {
            adts::validate(format)?;
        }
        fs::create_dir_all(&self.config.output_dir)?;

        let mut state = self.state.lock();
        state.segmenter = Some(Segmenter::new(self.config.clone(), video.is_some(), audio.is_some())?);
        state.audio_format = audio_format;
        tracing::info!(dir = %self.config.output_dir.display(), "HLS muxer prepared");
        Ok(())
    }

    fn on_video_format_changed(&self, format: &VideoFormat) -> Result<()> {
        let sets = ParameterSets {
            sps: Some(format.sps.clone()),
            pps: Some(format.pps.clone()),
        };
        self.state.lock().parameter_sets = sets.annex_b();
        Ok(())
    }

    fn on_write_video_data(&self, unit: &AccessUnit<'_>) -> Result<()> {
        let mut state = self.state.lock();
        if unit.is_codec_config() {
            let sets = ParameterSets::from_config(unit.data);
            if let Some(annex_b) = sets.annex_b() {
                state.parameter_sets = Some(annex_b);
            }
            return Ok(());
        }

        let HlsState {
            segmenter,
            parameter_sets,
            ..
        } = &mut *state;
        let Some(segmenter) = segmenter.as_mut() else {
            return Ok(());
        };

        let result = match (unit.is_key_frame(), parameter_sets.as_ref()) {
            (true, Some(sets)) => {
                let mut data = Vec::with_capacity(sets.len() + unit.data.len());
                data.extend_from_slice(sets);
                data.extend_from_slice(unit.data);
                segmenter.write_video(&data, unit.pts_us, true)
            }
            (key_frame, _) => segmenter.write_video(unit.data, unit.pts_us, key_frame),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, pts_us = unit.pts_us, "HLS video write failed");
        }
        Ok(())
    }

    fn on_audio_format_changed(&self, format: &AudioFormat) -> Result<()> {
        adts::validate(format)?;
        self.state.lock().audio_format = Some(*format);
        Ok(())
    }

    fn on_write_audio_data(&self, unit: &AccessUnit<'_>) -> Result<()> {
        if unit.is_codec_config() || unit.data.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let Some(format) = state.audio_format else {
            return Ok(());
        };
        let Some(segmenter) = state.segmenter.as_mut() else {
            return Ok(());
        };

        let result = match AdtsHeader::parse(unit.data) {
            Some(_) => segmenter.write_audio(unit.data, unit.pts_us),
            None => adts::frame(&format, unit.data)
                .and_then(|framed| segmenter.write_audio(&framed, unit.pts_us)),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "HLS audio write failed");
        }
        Ok(())
    }

    fn on_released(&self) {
        let Some(mut segmenter) = self.state.lock().segmenter.take() else {
            return;
        };
        if let Err(e) = segmenter.finish() {
            tracing::warn!(error = %e, "HLS finalize failed");
        }
        tracing::info!(segments = segmenter.segment_names().len(), "HLS muxer released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::BufferFlags;
    use crate::media::mpegts::TS_PACKET_SIZE;

    const IDR: [u8; 6] = [0, 0, 0, 1, 0x65, 0x88];
    const SLICE: [u8; 6] = [0, 0, 0, 1, 0x41, 0x9a];

    fn config(dir: &Path, window: usize) -> HlsConfig {
        HlsConfig {
            output_dir: dir.to_path_buf(),
            target_duration: Duration::from_secs(2),
            window,
            ..Default::default()
        }
    }

    fn video_format() -> VideoFormat {
        VideoFormat {
            width: 320,
            height: 240,
            sps: vec![0x67, 0x42, 0x00, 0x1e],
            pps: vec![0x68, 0xce, 0x38, 0x80],
        }
    }

    #[test]
    fn cuts_on_key_frames_after_target_duration() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = Segmenter::new(config(dir.path(), 5), true, false).unwrap();

        seg.write_video(&SLICE, 0, false).unwrap();
        assert!(!dir.path().join("segment0.ts").exists());

        for second in 0..5u64 {
            let pts = second * 1_000_000;
            seg.write_video(&IDR, pts, true).unwrap();
            seg.write_video(&SLICE, pts + 500_000, false).unwrap();
        }
        assert_eq!(seg.segment_names(), ["segment0.ts", "segment1.ts"]);

        seg.finish().unwrap();
        seg.finish().unwrap();
        assert_eq!(seg.segment_names(), ["segment0.ts", "segment1.ts", "segment2.ts"]);

        let playlist = fs::read_to_string(dir.path().join("index.m3u8")).unwrap();
        assert!(playlist.starts_with("#EXTM3U\n"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:2\n"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        assert!(playlist.contains("#EXTINF:2.000,\nsegment0.ts\n"));
        assert!(playlist.contains("#EXTINF:0.500,\nsegment2.ts\n"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));

        let bytes = fs::read(dir.path().join("segment0.ts")).unwrap();
        assert_eq!(bytes.len() % TS_PACKET_SIZE, 0);
        assert_eq!(bytes[0], 0x47);
        assert!(matches!(
            seg.write_video(&IDR, 9_000_000, true),
            Err(StreamError::InvalidState(_))
        ));
    }

    #[test]
    fn window_slides_and_deletes_old_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut seg = Segmenter::new(config(dir.path(), 2), true, false).unwrap();
        for i in 0..5u64 {
            seg.write_video(&IDR, i * 2_000_000, true).unwrap();
        }
        assert_eq!(seg.segment_names(), ["segment2.ts", "segment3.ts"]);
        assert!(!dir.path().join("segment0.ts").exists());
        assert!(!dir.path().join("segment1.ts").exists());
        assert!(dir.path().join("segment4.ts").exists());
        assert!(seg.playlist().contains("#EXT-X-MEDIA-SEQUENCE:2\n"));
    }

    #[test]
    fn audio_only_cuts_on_duration() {
        let dir = tempfile::tempdir().unwrap();
        let format = AudioFormat::aac_lc(48000, 2);
        let mut seg = Segmenter::new(config(dir.path(), 5), false, true).unwrap();
        let frame = adts::frame(&format, &[0x21; 10]).unwrap();
        for i in 0..100u64 {
            seg.write_audio(&frame, i * 50_000).unwrap();
        }
        assert_eq!(seg.segment_names(), ["segment0.ts", "segment1.ts"]);
    }

    #[test]
    fn prepare_fails_when_directory_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let muxer = HlsMuxer::new(config(&blocker.join("out"), 3));
        assert!(matches!(
            muxer.on_prepare(Some(&VideoQuality::default()), None),
            Err(StreamError::Io(_))
        ));
    }

    #[test]
    fn unsignalable_channel_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = HlsMuxer::new(config(&dir.path().join("live"), 3));
        let quality = AudioQuality {
            channel_count: 8,
            ..Default::default()
        };
        assert!(matches!(
            muxer.on_prepare(None, Some(&quality)),
            Err(StreamError::UnsupportedAudioFormat { channels: 8, .. })
        ));

        muxer.on_prepare(None, Some(&AudioQuality::default())).unwrap();
        assert!(matches!(
            muxer.on_audio_format_changed(&AudioFormat::aac_lc(48000, 8)),
            Err(StreamError::UnsupportedAudioFormat { channels: 8, .. })
        ));
    }

    #[test]
    fn muxer_prepends_parameter_sets_to_key_frames() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("live");
        let muxer = HlsMuxer::new(config(&out, 3));
        muxer.on_prepare(Some(&VideoQuality::default()), None).unwrap();
        muxer.on_video_format_changed(&video_format()).unwrap();

        let unit = AccessUnit::new(&IDR, 0).with_flags(BufferFlags::KEY_FRAME);
        muxer.on_write_video_data(&unit).unwrap();
        muxer.on_released();
        muxer.on_released();

        let bytes = fs::read(out.join("segment0.ts")).unwrap();
        let sps_at = bytes.windows(4).position(|w| w == [0x67, 0x42, 0x00, 0x1e]);
        let idr_at = bytes.windows(2).position(|w| w == [0x65, 0x88]);
        assert!(sps_at.unwrap() < idr_at.unwrap());
        assert!(out.join("index.m3u8").exists());
    }
}
