use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use super::Muxer;
use crate::error::{Result, StreamError};
use crate::media::h264::ParameterSets;
use crate::media::{AccessUnit, AudioFormat, AudioQuality, VideoFormat, VideoQuality, adts, flv};
use crate::transport::rtmp::{DEFAULT_CONNECT_TIMEOUT, RtmpClient, RtmpEvent};

#[derive(Debug, Clone)]
pub struct RtmpMuxerConfig {
    /// `rtmp://host[:port]/app/stream_key`
    pub url: String,
    /// Bound on TCP connect plus handshake and publish negotiation.
    pub connect_timeout: Duration,
}

impl RtmpMuxerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
struct RtmpState {
    client: Option<RtmpClient>,
    video_format: Option<VideoFormat>,
    audio_format: Option<AudioFormat>,
    video_header_sent: bool,
    audio_header_sent: bool,
}

/// RTMP publisher: H.264 and AAC as FLV tag bodies.
///
/// Sequence headers go out before the first frame of each track and again
/// after a format change. Frames written while the connection is still
/// negotiating are dropped.
#[derive(Debug)]
pub struct RtmpMuxer {
    config: RtmpMuxerConfig,
    state: Mutex<RtmpState>,
}

fn timestamp_ms(pts_us: u64) -> u32 {
    (pts_us / 1000) as u32
}

impl RtmpMuxer {
    pub fn new(config: RtmpMuxerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RtmpState::default()),
        }
    }

    pub fn config(&self) -> &RtmpMuxerConfig {
        &self.config
    }

    /// Connection events while prepared.
    pub fn events(&self) -> Option<Receiver<RtmpEvent>> {
        self.state.lock().client.as_ref().map(RtmpClient::events)
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .client
            .as_ref()
            .is_some_and(RtmpClient::is_connected)
    }
}

/// `Ok(false)` when the frame was dropped; `Err` only on disconnect.
fn publish(client: &RtmpClient, data: Bytes, ts: u32, video: bool) -> Result<bool> {
    let result = if video {
        client.publish_video(data, ts)
    } else {
        client.publish_audio(data, ts)
    };
    match result {
        Err(StreamError::Disconnected) => {
            tracing::warn!("RTMP connection lost");
            Err(StreamError::Disconnected)
        }
        Err(e) => {
            tracing::warn!(error = %e, "RTMP publish failed");
            Ok(false)
        }
        Ok(sent) => Ok(sent),
    }
}

impl Muxer for RtmpMuxer {
    fn on_prepare(&self, video: Option<&VideoQuality>, audio: Option<&AudioQuality>) -> Result<()> {
        if video.is_none() && audio.is_none() {
            return Err(StreamError::TrackNotConfigured);
        }
        let audio_format = audio.map(|q| AudioFormat::aac_lc(q.sample_rate, q.channel_count));
        if let Some(format) = &audio_format {
            adts::validate(format)?;
        }
        let mut client = RtmpClient::connect(&self.config.url, self.config.connect_timeout)?;
        if let Err(e) = client.wait_connected(self.config.connect_timeout) {
            client.close();
            return Err(e);
        }
        tracing::info!(url = %self.config.url, "RTMP publishing");

        let mut state = self.state.lock();
        *state = RtmpState {
            client: Some(client),
            audio_format,
            ..Default::default()
        };
        Ok(())
    }

    fn on_video_format_changed(&self, format: &VideoFormat) -> Result<()> {
        let mut state = self.state.lock();
        state.video_format = Some(format.clone());
        state.video_header_sent = false;
        Ok(())
    }

    fn on_write_video_data(&self, unit: &AccessUnit<'_>) -> Result<()> {
        let mut state = self.state.lock();
        if unit.is_codec_config() {
            let sets = ParameterSets::from_config(unit.data);
            if let (Some(sps), Some(pps)) = (sets.sps, sets.pps) {
                let (width, height) = state
                    .video_format
                    .as_ref()
                    .map_or((0, 0), |f| (f.width, f.height));
                state.video_format = Some(VideoFormat {
                    width,
                    height,
                    sps,
                    pps,
                });
                state.video_header_sent = false;
            }
            return Ok(());
        }

        let RtmpState {
            client,
            video_format,
            video_header_sent,
            ..
        } = &mut *state;
        let Some(client) = client.as_ref() else {
            return Ok(());
        };
        let ts = timestamp_ms(unit.pts_us);

        if !*video_header_sent {
            let Some(format) = video_format.as_ref() else {
                tracing::trace!("no SPS/PPS yet, video frame dropped");
                return Ok(());
            };
            let header = flv::avc_sequence_header(&format.sps, &format.pps);
            if !publish(client, header, ts, true)? {
                return Ok(());
            }
            *video_header_sent = true;
        }

        if let Some(tag) = flv::avc_nalu(unit.data, unit.is_key_frame()) {
            publish(client, tag, ts, true)?;
        }
        Ok(())
    }

    fn on_audio_format_changed(&self, format: &AudioFormat) -> Result<()> {
        adts::validate(format)?;
        let mut state = self.state.lock();
        state.audio_format = Some(*format);
        state.audio_header_sent = false;
        Ok(())
    }

    fn on_write_audio_data(&self, unit: &AccessUnit<'_>) -> Result<()> {
        if unit.is_codec_config() || unit.data.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock();
        let RtmpState {
            client,
            audio_format,
            audio_header_sent,
            ..
        } = &mut *state;
        let (Some(client), Some(format)) = (client.as_ref(), audio_format.as_ref()) else {
            return Ok(());
        };
        let ts = timestamp_ms(unit.pts_us);

        if !*audio_header_sent {
            let header = match flv::aac_sequence_header(format) {
                Ok(header) => header,
                Err(e) => {
                    tracing::warn!(error = %e, "audio frame dropped");
                    return Ok(());
                }
            };
            if !publish(client, header, ts, false)? {
                return Ok(());
            }
            *audio_header_sent = true;
        }

        publish(client, flv::aac_raw(unit.data), ts, false)?;
        Ok(())
    }

    fn on_released(&self) {
        let client = self.state.lock().client.take();
        if let Some(mut client) = client {
            client.close();
            tracing::info!(url = %self.config.url, "RTMP muxer released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::BufferFlags;
    use crossbeam_channel::{Sender, unbounded};
    use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
    use rml_rtmp::sessions::{
        ServerSession, ServerSessionConfig, ServerSessionEvent, ServerSessionResult,
    };
    use crate::muxer::AnyMuxer;
    use crate::session::{Session, SessionState};
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpListener, TcpStream};
    use std::thread;
    use std::time::Instant;

    #[derive(Debug)]
    enum Received {
        Published(String, String),
        Video(Vec<u8>, u32),
        Audio(Vec<u8>, u32),
    }

    /// Returns whether a publish request was accepted.
    fn respond(stream: &mut TcpStream, session: &mut ServerSession, results: Vec<ServerSessionResult>, seen: &Sender<Received>) -> bool {
        let mut published = false;
        let mut pending = results;
        while !pending.is_empty() {
            let mut next = Vec::new();
            for result in pending {
                match result {
                    ServerSessionResult::OutboundResponse(packet) => {
                        stream.write_all(&packet.bytes).unwrap();
                    }
                    ServerSessionResult::RaisedEvent(event) => match event {
                        ServerSessionEvent::ConnectionRequested { request_id, .. } => {
                            next.extend(session.accept_request(request_id).unwrap());
                        }
                        ServerSessionEvent::PublishStreamRequested {
                            request_id,
                            app_name,
                            stream_key,
                            ..
                        } => {
                            next.extend(session.accept_request(request_id).unwrap());
                            published = true;
                            let _ = seen.send(Received::Published(app_name, stream_key));
                        }
                        ServerSessionEvent::VideoDataReceived { data, timestamp, .. } => {
                            let _ = seen.send(Received::Video(data.to_vec(), timestamp.value));
                        }
                        ServerSessionEvent::AudioDataReceived { data, timestamp, .. } => {
                            let _ = seen.send(Received::Audio(data.to_vec(), timestamp.value));
                        }
                        _ => {}
                    },
                    _ => {}
                }
            }
            pending = next;
        }
        published
    }

    fn ingest() -> (u16, Receiver<Received>) {
        serve_ingest(None)
    }

    /// Minimal RTMP ingest that accepts one publisher. With `hang_up`, the
    /// connection is shut down once the publisher is accepted and the
    /// signal fires.
    fn serve_ingest(hang_up: Option<Receiver<()>>) -> (u16, Receiver<Received>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = unbounded();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let mut handshake = Handshake::new(PeerType::Server);
            let remaining = loop {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    return;
                }
                match handshake.process_bytes(&buf[..n]).unwrap() {
                    HandshakeProcessResult::InProgress { response_bytes } => {
                        stream.write_all(&response_bytes).unwrap();
                    }
                    HandshakeProcessResult::Completed {
                        response_bytes,
                        remaining_bytes,
                    } => {
                        stream.write_all(&response_bytes).unwrap();
                        break remaining_bytes;
                    }
                }
            };

            let (mut session, initial) = ServerSession::new(ServerSessionConfig::new()).unwrap();
            let mut published = respond(&mut stream, &mut session, initial, &tx);
            if !remaining.is_empty() {
                let results = session.handle_input(&remaining).unwrap();
                published |= respond(&mut stream, &mut session, results, &tx);
            }
            loop {
                if let (true, Some(signal)) = (published, hang_up.as_ref()) {
                    let _ = signal.recv();
                    let _ = stream.shutdown(Shutdown::Write);
                    while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
                    return;
                }
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let results = session.handle_input(&buf[..n]).unwrap();
                published |= respond(&mut stream, &mut session, results, &tx);
            }
        });
        (port, rx)
    }

    fn next(rx: &Receiver<Received>) -> Received {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn publishes_sequence_headers_then_frames() {
        let (port, rx) = ingest();
        let muxer = RtmpMuxer::new(RtmpMuxerConfig::new(format!("rtmp://127.0.0.1:{port}/live/cam1")));
        muxer
            .on_prepare(Some(&VideoQuality::default()), Some(&AudioQuality::default()))
            .unwrap();
        assert!(muxer.is_connected());
        assert!(matches!(next(&rx), Received::Published(app, key) if app == "live" && key == "cam1"));

        muxer
            .on_video_format_changed(&VideoFormat {
                width: 320,
                height: 240,
                sps: vec![0x67, 0x42, 0x00, 0x1e],
                pps: vec![0x68, 0xce, 0x38, 0x80],
            })
            .unwrap();
        let idr = [0, 0, 0, 1, 0x65, 0x88];
        muxer
            .on_write_video_data(&AccessUnit::new(&idr, 40_000).with_flags(BufferFlags::KEY_FRAME))
            .unwrap();

        match next(&rx) {
            Received::Video(data, ts) => {
                assert_eq!(&data[..2], [0x17, 0x00]);
                assert_eq!(ts, 40);
            }
            other => panic!("unexpected {other:?}"),
        }
        match next(&rx) {
            Received::Video(data, _) => {
                assert_eq!(&data[..2], [0x17, 0x01]);
                assert_eq!(&data[5..], [0, 0, 0, 2, 0x65, 0x88]);
            }
            other => panic!("unexpected {other:?}"),
        }

        muxer.on_write_audio_data(&AccessUnit::new(&[0x21, 0x10], 50_000)).unwrap();
        assert!(matches!(next(&rx), Received::Audio(data, 50) if data == [0xaf, 0x00, 0x12, 0x08]));
        assert!(matches!(next(&rx), Received::Audio(data, 50) if data == [0xaf, 0x01, 0x21, 0x10]));

        muxer.on_released();
        muxer.on_released();
        assert!(!muxer.is_connected());
    }

    #[test]
    fn ingest_hang_up_releases_session() {
        let (hang_up, signal) = unbounded();
        let (port, rx) = serve_ingest(Some(signal));
        let session = Session::new(RtmpMuxer::new(RtmpMuxerConfig::new(format!(
            "rtmp://127.0.0.1:{port}/live/cam1"
        ))))
        .with_video(VideoQuality::default());
        session.start().unwrap();
        assert!(matches!(next(&rx), Received::Published(..)));
        session
            .video_format_changed(&VideoFormat {
                width: 320,
                height: 240,
                sps: vec![0x67, 0x42, 0x00, 0x1e],
                pps: vec![0x68, 0xce, 0x38, 0x80],
            })
            .unwrap();

        let AnyMuxer::Rtmp(muxer) = session.muxer() else {
            panic!("not an RTMP session");
        };
        hang_up.send(()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while muxer.is_connected() {
            assert!(Instant::now() < deadline, "ingest hang-up not observed");
            thread::sleep(Duration::from_millis(10));
        }

        let idr = [0, 0, 0, 1, 0x65, 0x88];
        let unit = AccessUnit::new(&idr, 40_000).with_flags(BufferFlags::KEY_FRAME);
        assert!(matches!(session.write_video(&unit), Err(StreamError::Disconnected)));
        assert_eq!(session.state(), SessionState::Released);
        assert!(muxer.events().is_none());
        assert!(matches!(session.write_video(&unit), Err(StreamError::InvalidState(_))));
    }

    #[test]
    fn prepare_fails_when_nothing_listens() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let muxer = RtmpMuxer::new(RtmpMuxerConfig::new(format!("rtmp://127.0.0.1:{port}/live/key")));
        assert!(muxer.on_prepare(Some(&VideoQuality::default()), None).is_err());
        assert!(muxer.events().is_none());
    }

    #[test]
    fn writes_before_prepare_are_ignored() {
        let muxer = RtmpMuxer::new(RtmpMuxerConfig::new("rtmp://127.0.0.1/live/key"));
        let frame = [0, 0, 0, 1, 0x41, 0x9a];
        muxer.on_write_video_data(&AccessUnit::new(&frame, 0)).unwrap();
        muxer.on_write_audio_data(&AccessUnit::new(&[1, 2], 0)).unwrap();
        muxer.on_released();
    }
}
