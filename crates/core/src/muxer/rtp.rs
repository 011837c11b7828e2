use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngExt;

use super::Muxer;
use crate::error::{Result, StreamError};
use crate::media::aac::AacPacketizer;
use crate::media::h264::{DEFAULT_MTU, H264Packetizer};
use crate::media::{AccessUnit, AudioFormat, AudioQuality, Packetizer, VideoFormat, VideoQuality};
use crate::protocol::sdp::{self, SessionDescription};
use crate::transport::UdpPair;

#[derive(Debug, Clone)]
pub struct RtpMuxerConfig {
    /// Local interface the sockets bind to.
    pub local_ip: IpAddr,
    /// Receiver host; RTCP goes to each port + 1.
    pub destination: IpAddr,
    pub video_port: u16,
    pub audio_port: u16,
    /// Local RTP ports; 0 picks ephemeral ones.
    pub local_video_port: u16,
    pub local_audio_port: u16,
    pub video_payload_type: u8,
    pub audio_payload_type: u8,
    pub mtu: usize,
    pub session_name: String,
}

impl Default for RtpMuxerConfig {
    fn default() -> Self {
        Self {
            local_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            destination: IpAddr::V4(Ipv4Addr::LOCALHOST),
            video_port: 5006,
            audio_port: 5008,
            local_video_port: 0,
            local_audio_port: 0,
            video_payload_type: 96,
            audio_payload_type: 97,
            mtu: DEFAULT_MTU,
            session_name: "Stream".to_string(),
        }
    }
}

#[derive(Debug)]
struct VideoTrack {
    packetizer: H264Packetizer,
    pair: Arc<UdpPair>,
}

#[derive(Debug)]
struct AudioTrack {
    packetizer: AacPacketizer,
    pair: Arc<UdpPair>,
}

/// RTP/UDP output: one packetizer and one RTP/RTCP socket pair per track.
#[derive(Debug)]
pub struct RtpMuxer {
    config: RtpMuxerConfig,
    session_id: u64,
    video: Mutex<Option<VideoTrack>>,
    audio: Mutex<Option<AudioTrack>>,
}

impl RtpMuxer {
    pub fn new(config: RtpMuxerConfig) -> Self {
        Self {
            config,
            session_id: rand::rng().random::<u32>() as u64,
            video: Mutex::new(None),
            audio: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RtpMuxerConfig {
        &self.config
    }

    /// Local `(rtp, rtcp)` ports of the video pair while prepared.
    pub fn video_ports(&self) -> Option<(u16, u16)> {
        self.video.lock().as_ref().map(|t| t.pair.local_ports())
    }

    pub fn audio_ports(&self) -> Option<(u16, u16)> {
        self.audio.lock().as_ref().map(|t| t.pair.local_ports())
    }

    /// Session description for a receiver of this stream. `None` before
    /// [`on_prepare`](Muxer::on_prepare).
    pub fn sdp(&self) -> Option<SessionDescription> {
        let video = self.video.lock();
        let audio = self.audio.lock();
        let mut tracks: Vec<(&dyn Packetizer, u16)> = Vec::with_capacity(2);
        if let Some(v) = video.as_ref() {
            tracks.push((&v.packetizer, self.config.video_port));
        }
        if let Some(a) = audio.as_ref() {
            tracks.push((&a.packetizer, self.config.audio_port));
        }
        if tracks.is_empty() {
            return None;
        }
        Some(sdp::describe(
            &self.config.destination.to_string(),
            self.session_id,
            &self.config.session_name,
            &tracks,
        ))
    }

    fn bind(&self, local_port: u16, remote_port: u16) -> Result<UdpPair> {
        UdpPair::bind(
            self.config.local_ip,
            local_port,
            SocketAddr::new(self.config.destination, remote_port),
        )
    }

    fn prepare_tracks(
        &self,
        video: Option<&VideoQuality>,
        audio: Option<&AudioQuality>,
    ) -> Result<(Option<VideoTrack>, Option<AudioTrack>)> {
        let video_track = match video {
            Some(_) => Some(VideoTrack {
                packetizer: H264Packetizer::with_random_ssrc(self.config.video_payload_type)
                    .with_mtu(self.config.mtu),
                pair: Arc::new(self.bind(self.config.local_video_port, self.config.video_port)?),
            }),
            None => None,
        };

        let audio_track = match audio {
            Some(quality) => {
                let format = AudioFormat::aac_lc(quality.sample_rate, quality.channel_count);
                let built = AacPacketizer::with_random_ssrc(self.config.audio_payload_type, format)
                    .and_then(|packetizer| {
                        let pair = self.bind(self.config.local_audio_port, self.config.audio_port)?;
                        Ok(AudioTrack {
                            packetizer,
                            pair: Arc::new(pair),
                        })
                    });
                match built {
                    Ok(track) => Some(track),
                    Err(e) => {
                        if let Some(v) = &video_track {
                            v.pair.close();
                        }
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        Ok((video_track, audio_track))
    }

    fn send(pair: &UdpPair, packets: Vec<Vec<u8>>) {
        for packet in packets {
            if let Err(e) = pair.send_rtp(&packet) {
                tracing::warn!(error = %e, dest = %pair.destination(), "RTP send failed");
                return;
            }
        }
    }
}

impl Muxer for RtpMuxer {
    fn on_prepare(&self, video: Option<&VideoQuality>, audio: Option<&AudioQuality>) -> Result<()> {
        if video.is_none() && audio.is_none() {
            return Err(StreamError::TrackNotConfigured);
        }
        let (video_track, audio_track) = self.prepare_tracks(video, audio)?;
        tracing::info!(
            destination = %self.config.destination,
            video = video_track.is_some(),
            audio = audio_track.is_some(),
            "RTP muxer prepared"
        );
        *self.video.lock() = video_track;
        *self.audio.lock() = audio_track;
        Ok(())
    }

    fn on_video_format_changed(&self, format: &VideoFormat) -> Result<()> {
        if let Some(track) = self.video.lock().as_mut() {
            track.packetizer.set_parameter_sets(&format.sps, &format.pps);
        }
        Ok(())
    }

    fn on_write_video_data(&self, unit: &AccessUnit<'_>) -> Result<()> {
        let (pair, packets) = {
            let mut guard = self.video.lock();
            let Some(track) = guard.as_mut() else {
                return Ok(());
            };
            match track.packetizer.packetize(unit) {
                Ok(packets) => (Arc::clone(&track.pair), packets),
                Err(e) => {
                    tracing::warn!(error = %e, pts_us = unit.pts_us, "video frame skipped");
                    return Ok(());
                }
            }
        };
        Self::send(&pair, packets);
        Ok(())
    }

    fn on_audio_format_changed(&self, format: &AudioFormat) -> Result<()> {
        let mut guard = self.audio.lock();
        let Some(track) = guard.as_mut() else {
            return Ok(());
        };
        if track.packetizer.format() == format {
            return Ok(());
        }
        match AacPacketizer::with_random_ssrc(self.config.audio_payload_type, *format) {
            Ok(packetizer) => track.packetizer = packetizer,
            Err(e) => tracing::warn!(error = %e, "audio format rejected"),
        }
        Ok(())
    }

    fn on_write_audio_data(&self, unit: &AccessUnit<'_>) -> Result<()> {
        let (pair, packets) = {
            let mut guard = self.audio.lock();
            let Some(track) = guard.as_mut() else {
                return Ok(());
            };
            match track.packetizer.packetize(unit) {
                Ok(packets) => (Arc::clone(&track.pair), packets),
                Err(e) => {
                    tracing::warn!(error = %e, "audio frame skipped");
                    return Ok(());
                }
            }
        };
        Self::send(&pair, packets);
        Ok(())
    }

    fn on_released(&self) {
        let video = self.video.lock().take();
        let audio = self.audio.lock().take();
        if video.is_none() && audio.is_none() {
            return;
        }
        for pair in video.map(|t| t.pair).into_iter().chain(audio.map(|t| t.pair)) {
            pair.close();
        }
        tracing::info!("RTP muxer released");
    }
}
