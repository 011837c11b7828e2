use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use streaming::media::h264::{self, NAL_AUD, NAL_IDR, NAL_PPS, NAL_SLICE, NAL_SPS};
use streaming::muxer::{
    AnyMuxer, HlsConfig, HlsMuxer, Mp4Muxer, Mp4MuxerConfig, RtmpMuxer, RtmpMuxerConfig, RtpMuxer,
    RtpMuxerConfig, SrtMuxer, SrtMuxerConfig,
};
use streaming::transport::srt::{Driver, SrtContext, TcpDriver};
use streaming::{
    AccessUnit, BufferFlags, ServerConfig, ServerEvent, Session, SrtServer, StreamError,
    VideoFormat, VideoQuality,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// MPEG-TS fan-out to SRT clients
    Srt,
    /// RTP/UDP to one receiver; prints the SDP
    Rtp,
    /// HLS segments and playlist
    Hls,
    /// Progressive MP4 file
    Mp4,
    /// Publish to an RTMP ingest
    Rtmp,
}

#[derive(Parser)]
#[command(
    name = "srt-stream",
    about = "Stream an H.264 Annex B file over SRT, RTP or RTMP, or write it as HLS/MP4"
)]
struct Args {
    /// Output mode
    #[arg(long, short, value_enum, default_value_t = Mode::Srt)]
    mode: Mode,

    /// H.264 Annex B elementary stream
    #[arg(long, short)]
    input: PathBuf,

    /// Listen address (srt)
    #[arg(long, short, default_value = "0.0.0.0")]
    bind: String,

    /// Listen port (srt)
    #[arg(long, short, default_value_t = 12345)]
    port: u16,

    /// Maximum concurrent clients (srt)
    #[arg(long, default_value_t = 10)]
    max_clients: usize,

    /// Receiver host (rtp)
    #[arg(long, default_value = "127.0.0.1")]
    destination: IpAddr,

    /// Receiver RTP port (rtp)
    #[arg(long, default_value_t = 5006)]
    rtp_port: u16,

    /// Output directory (hls) or file (mp4)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Ingest URL, rtmp://host[:port]/app/key (rtmp)
    #[arg(long)]
    url: Option<String>,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,
}

/// One access unit in Annex B form.
struct Frame {
    data: Vec<u8>,
    key: bool,
}

struct Clip {
    format: VideoFormat,
    frames: Vec<Frame>,
    frame_duration_us: u64,
}

impl Clip {
    fn load(path: &Path, width: u32, height: u32, fps: u32) -> streaming::Result<Self> {
        let data = std::fs::read(path)?;
        let (mut sps, mut pps) = (None, None);
        let mut frames = Vec::new();
        let mut pending = Vec::new();

        for nal in h264::extract_nal_units(&data) {
            match h264::nal_type(nal) {
                NAL_SPS => sps = Some(nal.to_vec()),
                NAL_PPS => pps = Some(nal.to_vec()),
                NAL_AUD => {}
                kind @ (NAL_SLICE | NAL_IDR) => {
                    pending.extend_from_slice(&[0, 0, 0, 1]);
                    pending.extend_from_slice(nal);
                    frames.push(Frame {
                        data: std::mem::take(&mut pending),
                        key: kind == NAL_IDR,
                    });
                }
                _ => {
                    pending.extend_from_slice(&[0, 0, 0, 1]);
                    pending.extend_from_slice(nal);
                }
            }
        }

        let (Some(sps), Some(pps)) = (sps, pps) else {
            return Err(StreamError::MissingParameterSets);
        };
        if frames.is_empty() {
            return Err(StreamError::InvalidState("input has no slices"));
        }
        Ok(Self {
            format: VideoFormat {
                width,
                height,
                sps,
                pps,
            },
            frames,
            frame_duration_us: 1_000_000 / u64::from(fps.max(1)),
        })
    }

    fn unit(&self, index: usize, tick: u64) -> AccessUnit<'_> {
        let frame = &self.frames[index % self.frames.len()];
        let unit = AccessUnit::new(&frame.data, tick * self.frame_duration_us);
        if frame.key {
            unit.with_flags(BufferFlags::KEY_FRAME)
        } else {
            unit
        }
    }
}

/// Sleeps until each successive frame is due.
struct Pacer {
    next: Instant,
    interval: Duration,
}

impl Pacer {
    fn new(interval_us: u64) -> Self {
        Self {
            next: Instant::now(),
            interval: Duration::from_micros(interval_us),
        }
    }

    fn wait(&mut self) {
        self.next += self.interval;
        thread::sleep(self.next.saturating_duration_since(Instant::now()));
    }
}

fn stop_on_enter() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    thread::spawn(move || {
        let mut line = String::new();
        let _ = io::stdin().read_line(&mut line);
        flag.store(true, Ordering::SeqCst);
    });
    stop
}

fn write(session: &Session, unit: &AccessUnit<'_>) -> bool {
    match session.write_video(unit) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "write failed");
            session.is_streaming()
        }
    }
}

/// Loop the clip in real time until stopped or the session ends.
fn play(session: &Session, clip: &Clip, stop: &AtomicBool) {
    let mut pacer = Pacer::new(clip.frame_duration_us);
    let mut tick = 0u64;
    while !stop.load(Ordering::SeqCst) {
        if !write(session, &clip.unit(tick as usize, tick)) {
            break;
        }
        tick += 1;
        pacer.wait();
    }
}

/// Write every frame once, as fast as the muxer accepts them.
fn write_all(session: &Session, clip: &Clip) {
    for (index, _) in clip.frames.iter().enumerate() {
        if !write(session, &clip.unit(index, index as u64)) {
            break;
        }
    }
}

fn start(session: &Session, clip: &Clip) -> streaming::Result<()> {
    session.start()?;
    session.video_format_changed(&clip.format)
}

fn serve_srt(args: &Args, clip: &Clip, quality: &VideoQuality) -> streaming::Result<()> {
    let ctx = SrtContext::startup(Arc::new(TcpDriver::new()) as Arc<dyn Driver>)?;
    let server = Arc::new(SrtServer::new(
        ctx,
        ServerConfig {
            address: args.bind.clone(),
            port: args.port,
            max_clients: args.max_clients,
            ..Default::default()
        },
    ));
    let events = server.events();
    server.open()?;
    println!(
        "SRT server on {}:{}, press Enter to stop",
        args.bind,
        server.port().unwrap_or(args.port)
    );

    let stop = stop_on_enter();
    let mut session: Option<Session> = None;
    let mut pacer = Pacer::new(clip.frame_duration_us);
    let (mut tick, mut index) = (0u64, 0usize);

    while !stop.load(Ordering::SeqCst) {
        while let Ok(event) = events.try_recv() {
            match event {
                ServerEvent::StreamDemanded => {
                    let next = Session::new(SrtMuxer::new(Arc::clone(&server), SrtMuxerConfig::default()))
                        .with_video(quality.clone());
                    match start(&next, clip) {
                        Ok(()) => {
                            index = 0;
                            session = Some(next);
                        }
                        Err(e) => tracing::error!(error = %e, "session start failed"),
                    }
                }
                ServerEvent::StreamIdle => session = None,
                ServerEvent::ClientAccepted(client) => {
                    tracing::info!(id = client.id, peer = %client.peer, "client connected")
                }
                ServerEvent::ClientRemoved(client) => {
                    tracing::info!(id = client.id, peer = %client.peer, "client disconnected")
                }
                ServerEvent::Closed => stop.store(true, Ordering::SeqCst),
                other => tracing::debug!(event = ?other, "server event"),
            }
        }

        if let Some(current) = &session {
            write(current, &clip.unit(index, tick));
            index += 1;
        }
        tick += 1;
        pacer.wait();
    }

    drop(session);
    server.close();
    Ok(())
}

fn run(args: Args) -> streaming::Result<()> {
    let clip = Clip::load(&args.input, args.width, args.height, args.fps)?;
    tracing::info!(
        input = %args.input.display(),
        frames = clip.frames.len(),
        "input loaded"
    );
    let quality = VideoQuality {
        width: args.width,
        height: args.height,
        frame_rate: args.fps,
        ..Default::default()
    };

    let muxer: AnyMuxer = match args.mode {
        Mode::Srt => return serve_srt(&args, &clip, &quality),
        Mode::Rtp => RtpMuxer::new(RtpMuxerConfig {
            destination: args.destination,
            video_port: args.rtp_port,
            ..Default::default()
        })
        .into(),
        Mode::Hls => HlsMuxer::new(HlsConfig {
            output_dir: args.output.clone().unwrap_or_else(|| PathBuf::from("hls")),
            ..Default::default()
        })
        .into(),
        Mode::Mp4 => Mp4Muxer::new(Mp4MuxerConfig {
            path: args.output.clone().unwrap_or_else(|| PathBuf::from("output.mp4")),
            ..Default::default()
        })
        .into(),
        Mode::Rtmp => {
            let url = args
                .url
                .clone()
                .ok_or(StreamError::InvalidState("--url is required for rtmp"))?;
            RtmpMuxer::new(RtmpMuxerConfig::new(url)).into()
        }
    };

    let session = Session::new(muxer).with_video(quality);
    start(&session, &clip)?;

    match args.mode {
        Mode::Hls | Mode::Mp4 => {
            write_all(&session, &clip);
            session.stop();
            println!("wrote {} frames", clip.frames.len());
        }
        _ => {
            if let AnyMuxer::Rtp(rtp) = session.muxer() {
                if let Some(sdp) = rtp.sdp() {
                    print!("{sdp}");
                }
            }
            println!("streaming, press Enter to stop");
            let stop = stop_on_enter();
            play(&session, &clip, &stop);
            session.stop();
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
