use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::Muxer;
use crate::error::{Result, StreamError};
use crate::media::adts::{self, AdtsHeader};
use crate::media::h264::ParameterSets;
use crate::media::mpegts::{TS_PACKET_SIZE, TsWriter};
use crate::media::{AccessUnit, AudioFormat, AudioQuality, VideoFormat, VideoQuality};
use crate::server::SrtServer;

/// TS packets per SRT message: 7 × 188 = 1316 bytes fits a 1500-byte MTU.
pub const DEFAULT_PACKETS_PER_MESSAGE: usize = 7;

#[derive(Debug, Clone)]
pub struct SrtMuxerConfig {
    pub packets_per_message: usize,
}

impl Default for SrtMuxerConfig {
    fn default() -> Self {
        Self {
            packets_per_message: DEFAULT_PACKETS_PER_MESSAGE,
        }
    }
}

#[derive(Debug, Default)]
struct SrtState {
    ts: Option<TsWriter>,
    parameter_sets: Option<Vec<u8>>,
    audio_format: Option<AudioFormat>,
    buf: Vec<u8>,
}

/// MPEG-TS over SRT: muxed packets are offered to a running [`SrtServer`],
/// which fans them out to every connected client.
///
/// Key frames carry the cached SPS/PPS and the stream repeats PAT/PMT, so
/// a client can join at any key frame.
#[derive(Debug)]
pub struct SrtMuxer {
    server: Arc<SrtServer>,
    config: SrtMuxerConfig,
    state: Mutex<SrtState>,
}

impl SrtMuxer {
    pub fn new(server: Arc<SrtServer>, config: SrtMuxerConfig) -> Self {
        Self {
            server,
            config,
            state: Mutex::new(SrtState::default()),
        }
    }

    pub fn server(&self) -> &Arc<SrtServer> {
        &self.server
    }

    fn message_size(&self) -> usize {
        self.config.packets_per_message.max(1) * TS_PACKET_SIZE
    }

    fn flush(&self, buf: &[u8]) {
        for message in buf.chunks(self.message_size()) {
            if !self.server.offer(Bytes::copy_from_slice(message)) {
                tracing::trace!("server closed, TS message dropped");
                return;
            }
        }
    }
}

impl Muxer for SrtMuxer {
    fn on_prepare(&self, video: Option<&VideoQuality>, audio: Option<&AudioQuality>) -> Result<()> {
        if video.is_none() && audio.is_none() {
            return Err(StreamError::TrackNotConfigured);
        }
        let audio_format = audio.map(|q| AudioFormat::aac_lc(q.sample_rate, q.channel_count));
        if let Some(format) = &audio_format {
            adts::validate(format)?;
        }
        if !self.server.is_open() {
            return Err(StreamError::NotStarted);
        }
        let mut state = self.state.lock();
        *state = SrtState {
            ts: Some(TsWriter::new(video.is_some(), audio.is_some())?),
            audio_format,
            ..Default::default()
        };
        tracing::info!(
            video = video.is_some(),
            audio = audio.is_some(),
            "SRT muxer prepared"
        );
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
            if let Some(annex_b) = ParameterSets::from_config(unit.data).annex_b() {
                state.parameter_sets = Some(annex_b);
            }
            return Ok(());
        }
        if unit.data.is_empty() {
            return Ok(());
        }

        let SrtState {
            ts,
            parameter_sets,
            buf,
            ..
        } = &mut *state;
        let Some(ts) = ts.as_mut() else {
            return Ok(());
        };

        buf.clear();
        let written = match (unit.is_key_frame(), parameter_sets.as_ref()) {
            (true, Some(sets)) => {
                let mut data = Vec::with_capacity(sets.len() + unit.data.len());
                data.extend_from_slice(sets);
                data.extend_from_slice(unit.data);
                ts.write_video(&data, unit.pts_us, true, buf)
            }
            (key_frame, _) => ts.write_video(unit.data, unit.pts_us, key_frame, buf),
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, pts_us = unit.pts_us, "video frame dropped");
            return Ok(());
        }
        self.flush(buf);
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
        let SrtState {
            ts,
            audio_format,
            buf,
            ..
        } = &mut *state;
        let (Some(ts), Some(format)) = (ts.as_mut(), audio_format.as_ref()) else {
            return Ok(());
        };

        buf.clear();
        let written = match AdtsHeader::parse(unit.data) {
            Some(_) => ts.write_audio(unit.data, unit.pts_us, buf),
            None => adts::frame(format, unit.data).and_then(|framed| ts.write_audio(&framed, unit.pts_us, buf)),
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, "audio frame dropped");
            return Ok(());
        }
        self.flush(buf);
        Ok(())
    }

    fn on_released(&self) {
        let mut state = self.state.lock();
        if state.ts.take().is_some() {
            *state = SrtState::default();
            tracing::info!("SRT muxer released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::BufferFlags;
    use crate::server::ServerConfig;
    use crate::transport::srt::mock::MockDriver;
    use crate::transport::srt::{Driver, SrtContext};
    use std::time::{Duration, Instant};

    fn open_server(driver: &Arc<MockDriver>) -> Arc<SrtServer> {
        let ctx = SrtContext::startup(Arc::clone(driver) as Arc<dyn Driver>).unwrap();
        let server = Arc::new(SrtServer::new(ctx, ServerConfig::default()));
        server.open().unwrap();
        server
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn prepare_requires_open_server() {
        let driver = MockDriver::new();
        let ctx = SrtContext::startup(Arc::clone(&driver) as Arc<dyn Driver>).unwrap();
        let server = Arc::new(SrtServer::new(ctx, ServerConfig::default()));
        let muxer = SrtMuxer::new(server, SrtMuxerConfig::default());
        assert!(matches!(
            muxer.on_prepare(Some(&VideoQuality::default()), None),
            Err(StreamError::NotStarted)
        ));
        assert!(matches!(muxer.on_prepare(None, None), Err(StreamError::TrackNotConfigured)));
    }

    #[test]
    fn key_frame_is_sent_as_ts_messages() {
        let driver = MockDriver::new();
        let server = open_server(&driver);
        let client = driver.push_client("10.0.0.9:4000");
        wait_until(|| server.client_count() == 1);

        let muxer = SrtMuxer::new(Arc::clone(&server), SrtMuxerConfig::default());
        muxer.on_prepare(Some(&VideoQuality::default()), None).unwrap();
        muxer
            .on_video_format_changed(&VideoFormat {
                width: 320,
                height: 240,
                sps: vec![0x67, 0x42, 0x00, 0x1e],
                pps: vec![0x68, 0xce, 0x38, 0x80],
            })
            .unwrap();

        let mut frame = vec![0, 0, 0, 1, 0x65];
        frame.extend(std::iter::repeat_n(0xab, 3000));
        let unit = AccessUnit::new(&frame, 0).with_flags(BufferFlags::KEY_FRAME);
        muxer.on_write_video_data(&unit).unwrap();

        // Tables plus the PES span several packets, grouped by seven.
        wait_until(|| driver.sent_to(client).len() >= 3);
        let messages = driver.sent_to(client);
        let mut stream = Vec::new();
        for message in &messages {
            assert!(message.len() <= 1316);
            assert_eq!(message.len() % TS_PACKET_SIZE, 0);
            assert_eq!(message[0], 0x47);
            stream.extend_from_slice(message);
        }
        assert_eq!(messages[0].len(), 1316);
        let sps_at = stream.windows(4).position(|w| w == [0x67, 0x42, 0x00, 0x1e]).unwrap();
        let idr_at = stream.windows(2).position(|w| w == [0x65, 0xab]).unwrap();
        assert!(sps_at < idr_at);

        muxer.on_released();
        muxer.on_released();
        muxer.on_write_video_data(&unit).unwrap();
        server.close();
    }

    #[test]
    fn raw_aac_is_framed_before_muxing() {
        let driver = MockDriver::new();
        let server = open_server(&driver);
        let client = driver.push_client("10.0.0.9:4000");
        wait_until(|| server.client_count() == 1);

        let muxer = SrtMuxer::new(Arc::clone(&server), SrtMuxerConfig::default());
        muxer.on_prepare(None, Some(&AudioQuality::default())).unwrap();
        muxer.on_write_audio_data(&AccessUnit::new(&[0x21; 20], 0)).unwrap();

        wait_until(|| !driver.sent_to(client).is_empty());
        let stream: Vec<u8> = driver.sent_to(client).concat();
        assert!(stream.windows(2).any(|w| w == [0xff, 0xf1]));
        server.close();
    }
}
