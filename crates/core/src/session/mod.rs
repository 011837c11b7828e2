//! Streaming session: one muxer driven by the encoder callbacks.
//!
//! A session owns the muxer chosen for its output and gates every encoder
//! callback on its lifecycle:
//!
//! ```text
//! new()      -> Idle
//! start()    -> Starting -> Streaming   (muxer on_prepare succeeded)
//!                        -> Idle        (on_prepare failed)
//! stop()     -> Released                (from any state; final)
//! write Err(Disconnected) -> Released
//! ```
//!
//! `start` and `stop` are idempotent. The state lock is never held while
//! the muxer works, so video and audio writes proceed concurrently.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, StreamError};
use crate::media::{AccessUnit, AudioFormat, AudioQuality, VideoFormat, VideoQuality};
use crate::muxer::{AnyMuxer, Muxer};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// `on_prepare` in progress.
    Starting,
    Streaming,
    Released,
}

#[derive(Debug)]
pub struct Session {
    id: u64,
    muxer: AnyMuxer,
    video: Option<VideoQuality>,
    audio: Option<AudioQuality>,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(muxer: impl Into<AnyMuxer>) -> Self {
        Self {
            id: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
            muxer: muxer.into(),
            video: None,
            audio: None,
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub fn with_video(mut self, quality: VideoQuality) -> Self {
        self.video = Some(quality);
        self
    }

    pub fn with_audio(mut self, quality: AudioQuality) -> Self {
        self.audio = Some(quality);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn muxer(&self) -> &AnyMuxer {
        &self.muxer
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SessionState::Streaming
    }

    /// Prepare the muxer. Blocks for as long as the muxer negotiates.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Idle => *state = SessionState::Starting,
                SessionState::Starting | SessionState::Streaming => return Ok(()),
                SessionState::Released => return Err(StreamError::InvalidState("session released")),
            }
        }

        let prepared = self.muxer.on_prepare(self.video.as_ref(), self.audio.as_ref());

        let mut state = self.state.lock();
        match (prepared, *state) {
            (Ok(()), SessionState::Starting) => {
                *state = SessionState::Streaming;
                tracing::info!(session = self.id, muxer = self.muxer.name(), "session streaming");
                Ok(())
            }
            (Ok(()), _) => {
                // Stopped while preparing.
                drop(state);
                self.muxer.on_released();
                Err(StreamError::InvalidState("session released"))
            }
            (Err(e), current) => {
                if current == SessionState::Starting {
                    *state = SessionState::Idle;
                }
                tracing::warn!(session = self.id, error = %e, "session start failed");
                Err(e)
            }
        }
    }

    /// Release the muxer. Final and idempotent.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), SessionState::Released);
        if previous == SessionState::Released {
            return;
        }
        self.muxer.on_released();
        tracing::info!(session = self.id, "session released");
    }

    fn ensure_streaming(&self) -> Result<()> {
        match self.state() {
            SessionState::Streaming => Ok(()),
            SessionState::Released => Err(StreamError::InvalidState("session released")),
            SessionState::Idle | SessionState::Starting => Err(StreamError::NotStarted),
        }
    }

    fn check(&self, result: Result<()>) -> Result<()> {
        if let Err(StreamError::Disconnected) = result {
            tracing::warn!(session = self.id, "transport disconnected, releasing session");
            self.stop();
        }
        result
    }

    pub fn video_format_changed(&self, format: &VideoFormat) -> Result<()> {
        self.ensure_streaming()?;
        self.check(self.muxer.on_video_format_changed(format))
    }

    pub fn write_video(&self, unit: &AccessUnit<'_>) -> Result<()> {
        self.ensure_streaming()?;
        self.check(self.muxer.on_write_video_data(unit))
    }

    pub fn audio_format_changed(&self, format: &AudioFormat) -> Result<()> {
        self.ensure_streaming()?;
        self.check(self.muxer.on_audio_format_changed(format))
    }

    pub fn write_audio(&self, unit: &AccessUnit<'_>) -> Result<()> {
        self.ensure_streaming()?;
        self.check(self.muxer.on_write_audio_data(unit))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}
