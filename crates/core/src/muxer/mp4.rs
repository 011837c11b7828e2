use std::path::PathBuf;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::Muxer;
use crate::error::{Result, StreamError};
use crate::media::adts::{self, ADTS_HEADER_LEN, AdtsHeader};
use crate::media::h264;
use crate::media::mp4::{ContainerWriter, Mp4FileWriter};
use crate::media::{AccessUnit, AudioFormat, AudioQuality, VideoFormat, VideoQuality};

#[derive(Debug, Clone)]
pub struct Mp4MuxerConfig {
    pub path: PathBuf,
    /// How long a format-changed call waits for the other track's format.
    pub track_sync_timeout: Duration,
}

impl Default for Mp4MuxerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("output.mp4"),
            track_sync_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct Mp4State {
    writer: Option<Mp4FileWriter>,
    expect_video: bool,
    expect_audio: bool,
    video_format: Option<VideoFormat>,
    audio_format: Option<AudioFormat>,
    video_track: Option<usize>,
    audio_track: Option<usize>,
    started: bool,
    released: bool,
    video_samples: u64,
    audio_samples: u64,
}

impl Mp4State {
    fn formats_complete(&self) -> bool {
        (!self.expect_video || self.video_format.is_some())
            && (!self.expect_audio || self.audio_format.is_some())
    }

    fn start(&mut self) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(StreamError::NotStarted);
        };
        if let Some(format) = &self.video_format {
            self.video_track = Some(writer.add_video_track(format)?);
        }
        if let Some(format) = &self.audio_format {
            self.audio_track = Some(writer.add_audio_track(format)?);
        }
        writer.start()?;
        self.started = true;
        Ok(())
    }
}

/// MPEG-4 file output.
///
/// The container needs every track's format before the first sample, so
/// the writer starts only once each track configured in `on_prepare` has
/// reported one. A format-changed call that leaves the set incomplete
/// waits up to `track_sync_timeout` for the others. Samples written before
/// the writer starts are dropped.
#[derive(Debug)]
pub struct Mp4Muxer {
    config: Mp4MuxerConfig,
    state: Mutex<Mp4State>,
    formats_ready: Condvar,
}

impl Mp4Muxer {
    pub fn new(config: Mp4MuxerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(Mp4State::default()),
            formats_ready: Condvar::new(),
        }
    }

    pub fn config(&self) -> &Mp4MuxerConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Samples accepted so far as `(video, audio)`.
    pub fn samples_written(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.video_samples, state.audio_samples)
    }

    fn format_changed(&self, apply: impl FnOnce(&mut Mp4State)) -> Result<()> {
        let mut state = self.state.lock();
        if state.writer.is_none() || state.started {
            return Ok(());
        }
        apply(&mut state);

        if state.formats_complete() {
            state.start()?;
            tracing::info!(path = %self.config.path.display(), "MP4 writer started");
            drop(state);
            self.formats_ready.notify_all();
            return Ok(());
        }

        let deadline = Instant::now() + self.config.track_sync_timeout;
        while !state.started && !state.released {
            if self.formats_ready.wait_until(&mut state, deadline).timed_out() {
                if !state.started {
                    tracing::warn!(
                        timeout = ?self.config.track_sync_timeout,
                        "other track format not reported, samples dropped until it is"
                    );
                }
                break;
            }
        }
        Ok(())
    }

    fn write(&self, track: Option<usize>, data: &[u8], pts_us: u64, key_frame: bool) -> bool {
        let mut state = self.state.lock();
        if !state.started {
            tracing::trace!(pts_us, "MP4 writer not started, sample dropped");
            return false;
        }
        let (Some(track), Some(writer)) = (track, state.writer.as_mut()) else {
            return false;
        };
        match writer.write_sample(track, data, pts_us, key_frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, track, "MP4 sample write failed");
                false
            }
        }
    }
}

impl Muxer for Mp4Muxer {
    fn on_prepare(&self, video: Option<&VideoQuality>, audio: Option<&AudioQuality>) -> Result<()> {
        if video.is_none() && audio.is_none() {
            return Err(StreamError::TrackNotConfigured);
        }
        let writer = Mp4FileWriter::create(&self.config.path)?;
        let mut state = self.state.lock();
        *state = Mp4State {
            writer: Some(writer),
            expect_video: video.is_some(),
            expect_audio: audio.is_some(),
            ..Default::default()
        };
        tracing::info!(path = %self.config.path.display(), "MP4 muxer prepared");
        Ok(())
    }

    fn on_video_format_changed(&self, format: &VideoFormat) -> Result<()> {
        self.format_changed(|state| {
            if state.expect_video {
                state.video_format = Some(format.clone());
            }
        })
    }

    fn on_write_video_data(&self, unit: &AccessUnit<'_>) -> Result<()> {
        if unit.is_codec_config() || unit.data.is_empty() {
            return Ok(());
        }
        let avcc = h264::annex_b_to_avcc(unit.data);
        if avcc.is_empty() {
            return Ok(());
        }
        let key_frame = unit.is_key_frame() || h264::contains_idr(unit.data);
        let track = self.state.lock().video_track;
        if self.write(track, &avcc, unit.pts_us, key_frame) {
            self.state.lock().video_samples += 1;
        }
        Ok(())
    }

    fn on_audio_format_changed(&self, format: &AudioFormat) -> Result<()> {
        adts::validate(format)?;
        self.format_changed(|state| {
            if state.expect_audio {
                state.audio_format = Some(*format);
            }
        })
    }

    fn on_write_audio_data(&self, unit: &AccessUnit<'_>) -> Result<()> {
        if unit.is_codec_config() || unit.data.is_empty() {
            return Ok(());
        }
        let raw = match AdtsHeader::parse(unit.data) {
            Some(_) => &unit.data[ADTS_HEADER_LEN..],
            None => unit.data,
        };
        let track = self.state.lock().audio_track;
        if self.write(track, raw, unit.pts_us, true) {
            self.state.lock().audio_samples += 1;
        }
        Ok(())
    }

    fn on_released(&self) {
        let mut state = self.state.lock();
        if state.released {
            return;
        }
        state.released = true;
        state.started = false;
        if let Some(mut writer) = state.writer.take() {
            if let Err(e) = writer.finish() {
                tracing::warn!(error = %e, "MP4 finalize failed");
            }
        }
        drop(state);
        self.formats_ready.notify_all();
        tracing::info!(path = %self.config.path.display(), "MP4 muxer released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::BufferFlags;
    use std::sync::Arc;
    use std::thread;

    const IDR: [u8; 7] = [0, 0, 0, 1, 0x65, 0x88, 0x84];
    const AAC: [u8; 4] = [0x21, 0x10, 0x05, 0x00];

    fn video_format() -> VideoFormat {
        VideoFormat {
            width: 320,
            height: 240,
            sps: vec![0x67, 0x42, 0x00, 0x1e],
            pps: vec![0x68, 0xce, 0x38, 0x80],
        }
    }

    fn muxer(dir: &tempfile::TempDir, timeout: Duration) -> Mp4Muxer {
        Mp4Muxer::new(Mp4MuxerConfig {
            path: dir.path().join("out.mp4"),
            track_sync_timeout: timeout,
        })
    }

    fn key_frame(pts_us: u64) -> AccessUnit<'static> {
        AccessUnit::new(&IDR, pts_us).with_flags(BufferFlags::KEY_FRAME)
    }

    #[test]
    fn video_only_starts_on_first_format() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = muxer(&dir, Duration::from_secs(5));
        muxer.on_prepare(Some(&VideoQuality::default()), None).unwrap();

        muxer.on_write_video_data(&key_frame(0)).unwrap();
        assert_eq!(muxer.samples_written(), (0, 0));

        muxer.on_video_format_changed(&video_format()).unwrap();
        assert!(muxer.is_started());
        muxer.on_write_video_data(&key_frame(33_000)).unwrap();
        assert_eq!(muxer.samples_written(), (1, 0));

        muxer.on_released();
        muxer.on_released();
        let bytes = std::fs::read(dir.path().join("out.mp4")).unwrap();
        assert_eq!(&bytes[4..8], b"ftyp");
        assert!(bytes.windows(4).any(|w| w == b"moov"));
    }

    #[test]
    fn early_frames_dropped_until_every_track_reports() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = muxer(&dir, Duration::from_millis(20));
        muxer
            .on_prepare(Some(&VideoQuality::default()), Some(&AudioQuality::default()))
            .unwrap();

        // Times out waiting for audio and returns without starting.
        muxer.on_video_format_changed(&video_format()).unwrap();
        assert!(!muxer.is_started());
        muxer.on_write_video_data(&key_frame(0)).unwrap();
        muxer.on_write_video_data(&key_frame(33_000)).unwrap();
        assert_eq!(muxer.samples_written(), (0, 0));

        muxer
            .on_audio_format_changed(&AudioFormat::aac_lc(44100, 1))
            .unwrap();
        assert!(muxer.is_started());
        muxer.on_write_video_data(&key_frame(66_000)).unwrap();
        muxer.on_write_audio_data(&AccessUnit::new(&AAC, 70_000)).unwrap();
        assert_eq!(muxer.samples_written(), (1, 1));
        muxer.on_released();
    }

    #[test]
    fn format_call_waits_for_other_track() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = Arc::new(muxer(&dir, Duration::from_secs(5)));
        muxer
            .on_prepare(Some(&VideoQuality::default()), Some(&AudioQuality::default()))
            .unwrap();

        let video = {
            let muxer = Arc::clone(&muxer);
            thread::spawn(move || {
                let begun = Instant::now();
                muxer.on_video_format_changed(&video_format()).unwrap();
                begun.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!muxer.is_started());
        muxer.on_write_video_data(&key_frame(0)).unwrap();
        assert_eq!(muxer.samples_written(), (0, 0));

        muxer
            .on_audio_format_changed(&AudioFormat::aac_lc(44100, 1))
            .unwrap();
        let waited = video.join().unwrap();
        assert!(waited >= Duration::from_millis(40));
        assert!(waited < Duration::from_secs(5));

        muxer.on_write_video_data(&key_frame(33_000)).unwrap();
        assert_eq!(muxer.samples_written(), (1, 0));
        muxer.on_released();
    }

    #[test]
    fn release_unblocks_waiting_format_call() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = Arc::new(muxer(&dir, Duration::from_secs(5)));
        muxer
            .on_prepare(Some(&VideoQuality::default()), Some(&AudioQuality::default()))
            .unwrap();

        let video = {
            let muxer = Arc::clone(&muxer);
            thread::spawn(move || {
                let begun = Instant::now();
                muxer.on_video_format_changed(&video_format()).unwrap();
                begun.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(30));
        muxer.on_released();
        assert!(video.join().unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn prepare_without_tracks_fails() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = muxer(&dir, Duration::from_secs(1));
        assert!(matches!(muxer.on_prepare(None, None), Err(StreamError::TrackNotConfigured)));
    }
}
