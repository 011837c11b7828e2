//! Progressive MP4 writer (ISO/IEC 14496-12, 14496-15 for AVC).
//!
//! Layout on disk:
//!
//! ```text
//! ftyp | mdat (64-bit size, samples appended as they arrive) | moov
//! ```
//!
//! The `mdat` size is patched and `moov` is appended by [`ContainerWriter::finish`].
//! Every sample is its own chunk, so `stsc` has a single entry and `co64`
//! lists one offset per sample.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};
use bytes::BufMut;

use super::{AudioFormat, VideoFormat, adts, h264};
use crate::error::{Result, StreamError};

const MOVIE_TIMESCALE: u32 = 1000;
const VIDEO_TIMESCALE: u32 = 90000;
const AAC_FRAME_SAMPLES: u32 = 1024;

/// Sink for muxed tracks. Samples are container-ready: length-prefixed NAL
/// units for video, raw AAC for audio.
pub trait ContainerWriter: Send {
    /// Register a track; returns its index. Only valid before `start`.
    fn add_video_track(&mut self, format: &VideoFormat) -> Result<usize>;

    fn add_audio_track(&mut self, format: &AudioFormat) -> Result<usize>;

    /// Begin writing media data. Tracks cannot be added afterwards.
    fn start(&mut self) -> Result<()>;

    fn write_sample(&mut self, track: usize, data: &[u8], pts_us: u64, key_frame: bool) -> Result<()>;

    /// Finalize the container. Idempotent.
    fn finish(&mut self) -> Result<()>;
}

#[derive(Debug)]
enum TrackMedia {
    Video(VideoFormat),
    Audio { format: AudioFormat, config: [u8; 2] },
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    offset: u64,
    size: u32,
    time: u64,
    key_frame: bool,
}

#[derive(Debug)]
struct Track {
    media: TrackMedia,
    timescale: u32,
    samples: Vec<Sample>,
}

impl Track {
    fn is_video(&self) -> bool {
        matches!(self.media, TrackMedia::Video(_))
    }

    /// Per-sample durations; the last sample repeats the previous delta.
    fn durations(&self) -> Vec<u32> {
        let default = match &self.media {
            TrackMedia::Video(_) => self.timescale / 30,
            TrackMedia::Audio { .. } => AAC_FRAME_SAMPLES,
        };
        let mut out: Vec<u32> = self
            .samples
            .windows(2)
            .map(|w| w[1].time.saturating_sub(w[0].time) as u32)
            .collect();
        if !self.samples.is_empty() {
            out.push(out.last().copied().unwrap_or(default));
        }
        out
    }

    fn duration(&self) -> u64 {
        self.durations().iter().map(|&d| d as u64).sum()
    }
}

/// [`ContainerWriter`] producing an `.mp4` file.
#[derive(Debug)]
pub struct Mp4FileWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    tracks: Vec<Track>,
    mdat_start: u64,
    position: u64,
    finished: bool,
}

impl Mp4FileWriter {
    /// Create (truncate) the output file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        tracing::debug!(path = %path.display(), "MP4 output created");
        Ok(Self {
            path,
            file: Some(BufWriter::new(file)),
            tracks: Vec::new(),
            mdat_start: 0,
            position: 0,
            finished: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> Result<&mut BufWriter<File>> {
        self.file
            .as_mut()
            .ok_or(StreamError::InvalidState("MP4 writer not writable"))
    }

    fn add_track(&mut self, media: TrackMedia, timescale: u32) -> Result<usize> {
        if self.position != 0 {
            return Err(StreamError::InvalidState("track added after start"));
        }
        self.tracks.push(Track {
            media,
            timescale,
            samples: Vec::new(),
        });
        Ok(self.tracks.len() - 1)
    }

    fn moov(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let movie_duration = self
            .tracks
            .iter()
            .map(|t| t.duration() * MOVIE_TIMESCALE as u64 / t.timescale as u64)
            .max()
            .unwrap_or(0);

        mp4_box(&mut out, b"moov", |b| {
            full_box(b, b"mvhd", 0, 0, |b| {
                b.put_u32(0); // creation_time
                b.put_u32(0); // modification_time
                b.put_u32(MOVIE_TIMESCALE);
                b.put_u32(movie_duration as u32);
                b.put_u32(0x0001_0000); // rate 1.0
                b.put_u16(0x0100); // volume 1.0
                b.put_bytes(0, 10);
                put_matrix(b);
                b.put_bytes(0, 24); // pre_defined
                b.put_u32(self.tracks.len() as u32 + 1);
            });
            for (index, track) in self.tracks.iter().enumerate() {
                write_trak(b, index as u32 + 1, track);
            }
        });
        out
    }
}

impl ContainerWriter for Mp4FileWriter {
    fn add_video_track(&mut self, format: &VideoFormat) -> Result<usize> {
        self.add_track(TrackMedia::Video(format.clone()), VIDEO_TIMESCALE)
    }

    fn add_audio_track(&mut self, format: &AudioFormat) -> Result<usize> {
        let config = adts::audio_specific_config(format)?;
        self.add_track(
            TrackMedia::Audio {
                format: *format,
                config,
            },
            format.sample_rate,
        )
    }

    fn start(&mut self) -> Result<()> {
        if self.position != 0 {
            return Ok(());
        }
        let mut head = Vec::with_capacity(48);
        mp4_box(&mut head, b"ftyp", |b| {
            b.put_slice(b"isom");
            b.put_u32(0x200);
            for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
                b.put_slice(brand);
            }
        });
        let mdat_start = head.len() as u64;
        head.put_u32(1); // size lives in the 64-bit field
        head.put_slice(b"mdat");
        head.put_u64(0);

        self.file()?.write_all(&head)?;
        self.mdat_start = mdat_start;
        self.position = head.len() as u64;
        tracing::debug!(tracks = self.tracks.len(), "MP4 writer started");
        Ok(())
    }

    fn write_sample(&mut self, track: usize, data: &[u8], pts_us: u64, key_frame: bool) -> Result<()> {
        if self.position == 0 || self.finished {
            return Err(StreamError::InvalidState("MP4 writer not started"));
        }
        let timescale = self
            .tracks
            .get(track)
            .map(|t| t.timescale)
            .ok_or(StreamError::TrackNotConfigured)?;

        let offset = self.position;
        self.file()?.write_all(data)?;
        self.position += data.len() as u64;

        let time = super::rtp::pts_to_clock(pts_us, timescale);
        if let Some(t) = self.tracks.get_mut(track) {
            t.samples.push(Sample {
                offset,
                size: data.len() as u32,
                time,
                key_frame,
            });
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if self.position == 0 {
            // Never started: leave an empty file behind.
            self.file = None;
            return Ok(());
        }

        let mdat_size = self.position - self.mdat_start;
        let moov = self.moov();
        let mdat_start = self.mdat_start;
        let mut file = self
            .file
            .take()
            .ok_or(StreamError::InvalidState("MP4 writer not writable"))?;

        file.write_all(&moov)?;
        file.seek(SeekFrom::Start(mdat_start + 8))?;
        file.write_u64::<BigEndian>(mdat_size)?;
        file.flush()?;

        tracing::info!(
            path = %self.path.display(),
            mdat_bytes = mdat_size,
            samples = self.tracks.iter().map(|t| t.samples.len()).sum::<usize>(),
            "MP4 finalized"
        );
        Ok(())
    }
}

fn mp4_box(out: &mut Vec<u8>, kind: &[u8; 4], body: impl FnOnce(&mut Vec<u8>)) {
    let start = out.len();
    out.put_u32(0);
    out.put_slice(kind);
    body(out);
    let size = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn full_box(out: &mut Vec<u8>, kind: &[u8; 4], version: u8, flags: u32, body: impl FnOnce(&mut Vec<u8>)) {
    mp4_box(out, kind, |b| {
        b.put_u8(version);
        b.put_uint(flags as u64, 3);
        body(b);
    });
}

fn put_matrix(b: &mut Vec<u8>) {
    for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        b.put_u32(v);
    }
}

fn write_trak(out: &mut Vec<u8>, track_id: u32, track: &Track) {
    let duration = track.duration();
    let movie_duration = duration * MOVIE_TIMESCALE as u64 / track.timescale as u64;
    let (width, height) = match &track.media {
        TrackMedia::Video(f) => (f.width, f.height),
        TrackMedia::Audio { .. } => (0, 0),
    };

    mp4_box(out, b"trak", |b| {
        full_box(b, b"tkhd", 0, 0x3, |b| {
            b.put_u32(0);
            b.put_u32(0);
            b.put_u32(track_id);
            b.put_u32(0);
            b.put_u32(movie_duration as u32);
            b.put_bytes(0, 8);
            b.put_u16(0); // layer
            b.put_u16(0); // alternate_group
            b.put_u16(if track.is_video() { 0 } else { 0x0100 });
            b.put_u16(0);
            put_matrix(b);
            b.put_u32(width << 16);
            b.put_u32(height << 16);
        });
        mp4_box(b, b"mdia", |b| {
            full_box(b, b"mdhd", 0, 0, |b| {
                b.put_u32(0);
                b.put_u32(0);
                b.put_u32(track.timescale);
                b.put_u32(duration as u32);
                b.put_u16(0x55c4); // 'und'
                b.put_u16(0);
            });
            full_box(b, b"hdlr", 0, 0, |b| {
                b.put_u32(0);
                b.put_slice(if track.is_video() { b"vide" } else { b"soun" });
                b.put_bytes(0, 12);
                b.put_slice(if track.is_video() { b"VideoHandler\0" } else { b"SoundHandler\0" });
            });
            mp4_box(b, b"minf", |b| {
                if track.is_video() {
                    full_box(b, b"vmhd", 0, 1, |b| b.put_bytes(0, 8));
                } else {
                    full_box(b, b"smhd", 0, 0, |b| b.put_u32(0));
                }
                mp4_box(b, b"dinf", |b| {
                    full_box(b, b"dref", 0, 0, |b| {
                        b.put_u32(1);
                        full_box(b, b"url ", 0, 1, |_| {});
                    });
                });
                write_stbl(b, track);
            });
        });
    });
}

fn write_stbl(out: &mut Vec<u8>, track: &Track) {
    mp4_box(out, b"stbl", |b| {
        full_box(b, b"stsd", 0, 0, |b| {
            b.put_u32(1);
            match &track.media {
                TrackMedia::Video(format) => write_avc1(b, format),
                TrackMedia::Audio { format, config } => write_mp4a(b, format, config),
            }
        });

        // Run-length encoded sample durations.
        full_box(b, b"stts", 0, 0, |b| {
            let mut runs: Vec<(u32, u32)> = Vec::new();
            for d in track.durations() {
                match runs.last_mut() {
                    Some((count, delta)) if *delta == d => *count += 1,
                    _ => runs.push((1, d)),
                }
            }
            b.put_u32(runs.len() as u32);
            for (count, delta) in runs {
                b.put_u32(count);
                b.put_u32(delta);
            }
        });

        if track.is_video() {
            full_box(b, b"stss", 0, 0, |b| {
                let sync: Vec<u32> = track
                    .samples
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.key_frame)
                    .map(|(i, _)| i as u32 + 1)
                    .collect();
                b.put_u32(sync.len() as u32);
                for n in sync {
                    b.put_u32(n);
                }
            });
        }

        full_box(b, b"stsz", 0, 0, |b| {
            b.put_u32(0);
            b.put_u32(track.samples.len() as u32);
            for s in &track.samples {
                b.put_u32(s.size);
            }
        });

        full_box(b, b"stsc", 0, 0, |b| {
            if track.samples.is_empty() {
                b.put_u32(0);
            } else {
                b.put_u32(1);
                b.put_u32(1); // first_chunk
                b.put_u32(1); // samples_per_chunk
                b.put_u32(1); // sample_description_index
            }
        });

        full_box(b, b"co64", 0, 0, |b| {
            b.put_u32(track.samples.len() as u32);
            for s in &track.samples {
                b.put_u64(s.offset);
            }
        });
    });
}

fn write_avc1(out: &mut Vec<u8>, format: &VideoFormat) {
    mp4_box(out, b"avc1", |b| {
        b.put_bytes(0, 6);
        b.put_u16(1); // data_reference_index
        b.put_bytes(0, 16);
        b.put_u16(format.width as u16);
        b.put_u16(format.height as u16);
        b.put_u32(0x0048_0000);
        b.put_u32(0x0048_0000);
        b.put_u32(0);
        b.put_u16(1); // frame_count
        b.put_bytes(0, 32); // compressorname
        b.put_u16(0x0018);
        b.put_i16(-1);
        mp4_box(b, b"avcC", |b| {
            b.put_slice(&h264::avc_decoder_configuration_record(&format.sps, &format.pps));
        });
    });
}

fn write_mp4a(out: &mut Vec<u8>, format: &AudioFormat, config: &[u8; 2]) {
    mp4_box(out, b"mp4a", |b| {
        b.put_bytes(0, 6);
        b.put_u16(1);
        b.put_bytes(0, 8);
        b.put_u16(format.channel_count as u16);
        b.put_u16(16);
        b.put_u32(0);
        b.put_u32(format.sample_rate << 16);
        full_box(b, b"esds", 0, 0, |b| {
            // ES_Descriptor
            b.put_u8(0x03);
            b.put_u8(25);
            b.put_u16(0); // ES_ID
            b.put_u8(0);
            // DecoderConfigDescriptor
            b.put_u8(0x04);
            b.put_u8(17);
            b.put_u8(0x40); // MPEG-4 audio
            b.put_u8(0x15); // AudioStream, upStream 0, reserved 1
            b.put_uint(0, 3); // bufferSizeDB
            b.put_u32(0); // maxBitrate
            b.put_u32(0); // avgBitrate
            // DecoderSpecificInfo
            b.put_u8(0x05);
            b.put_u8(2);
            b.put_slice(config);
            // SLConfigDescriptor
            b.put_u8(0x06);
            b.put_u8(1);
            b.put_u8(0x02);
        });
    });
}
