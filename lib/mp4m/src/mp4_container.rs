use crate::{
    Result,
    container::{AudioFormat, Container, SampleInfo, TrackFormat, TrackIndex, VideoFormat},
    error::MuxError,
};
use derive_builder::Builder;
use mp4::{
    AacConfig, AvcConfig, BoxHeader, BoxType, ChannelConfig, FourCC,
    MediaConfig, Mp4Config, Mp4Reader, Mp4Sample, Mp4Writer, SampleFreqIndex, TrackConfig,
    TrackType, WriteBox,
};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Seek, SeekFrom},
    path::PathBuf,
};

pub const VIDEO_TIMESCALE: u32 = 90000;

#[derive(Builder, Debug, Clone)]
pub struct MuxerConfig {
    pub output_path: PathBuf,

    #[builder(default = "VIDEO_TIMESCALE")]
    pub video_timescale: u32,
}

struct PendingSample {
    start_time: u64,
    is_sync: bool,
    bytes: Vec<u8>,
}

struct Track {
    config: TrackConfig,
    timescale: u32,
    first_pts_us: Option<u64>,
    pending: Option<PendingSample>,
    last_duration: u32,
    samples: u64,
}

impl Track {
    /// Media time of `pts_us` in track units, counted from the track's first sample.
    fn media_time(&self, pts_us: u64) -> u64 {
        let base = self.first_pts_us.unwrap_or(pts_us);
        pts_us.saturating_sub(base) * self.timescale as u64 / 1_000_000
    }
}

/// Writes H.264 and AAC tracks into an MP4 file.
///
/// A sample is held back until the next one of the same track arrives, so
/// its duration is the gap between the two presentation times. The last
/// sample of a track reuses the previous duration.
///
/// All tracks share one timeline whose origin is the earliest first
/// presentation time of any track. A track that starts later gets an edit
/// list with a leading empty edit, so audio and video stay in sync.
pub struct Mp4Container {
    config: MuxerConfig,
    tracks: Vec<Track>,
    writer: Option<Mp4Writer<BufWriter<File>>>,
    file_created: bool,
}

impl Mp4Container {
    pub fn new(config: MuxerConfig) -> Self {
        Self {
            config,
            tracks: vec![],
            writer: None,
            file_created: false,
        }
    }

    pub fn output_path(&self) -> &PathBuf {
        &self.config.output_path
    }

    fn video_track(&self, format: &VideoFormat) -> Result<TrackConfig> {
        let dimension = |value: u32| {
            u16::try_from(value).map_err(|_| {
                MuxError::InvalidState(format!(
                    "video size {}x{} does not fit an avc1 sample entry",
                    format.width, format.height
                ))
            })
        };

        Ok(TrackConfig {
            track_type: TrackType::Video,
            timescale: self.config.video_timescale,
            language: "und".to_string(),
            media_conf: MediaConfig::AvcConfig(AvcConfig {
                width: dimension(format.width)?,
                height: dimension(format.height)?,
                seq_param_set: format.sps.clone(),
                pic_param_set: format.pps.clone(),
            }),
        })
    }

    fn audio_track(format: &AudioFormat) -> TrackConfig {
        let chan_conf = match format.channels {
            1 => ChannelConfig::Mono,
            _ => ChannelConfig::Stereo,
        };

        TrackConfig {
            track_type: TrackType::Audio,
            timescale: format.sample_rate,
            language: "und".to_string(),
            media_conf: MediaConfig::AacConfig(AacConfig {
                bitrate: format.bitrate,
                profile: mp4::AudioObjectType::AacLowComplexity,
                freq_index: sample_freq_index(format.sample_rate),
                chan_conf,
            }),
        }
    }

    /// Start of every track on the shared timeline, in movie timescale units.
    fn start_offsets(&self) -> Vec<u64> {
        let origin = self.tracks.iter().filter_map(|t| t.first_pts_us).min();
        self.tracks
            .iter()
            .map(|track| match (origin, track.first_pts_us) {
                (Some(origin), Some(first)) => {
                    (first - origin) * self.config.video_timescale as u64 / 1_000_000
                }
                _ => 0,
            })
            .collect()
    }

    fn flush_pending(
        writer: &mut Mp4Writer<BufWriter<File>>,
        track_id: u32,
        track: &mut Track,
        next_start: Option<u64>,
    ) -> Result<()> {
        let Some(pending) = track.pending.take() else {
            return Ok(());
        };

        let duration = match next_start {
            Some(next) if next > pending.start_time => u32::try_from(next - pending.start_time)
                .map_err(|_| {
                    MuxError::InvalidState(format!(
                        "track {track_id}: gap of {} ticks between samples",
                        next - pending.start_time
                    ))
                })?,
            _ => track.last_duration,
        };
        track.last_duration = duration;

        let sample = Mp4Sample {
            start_time: pending.start_time,
            duration,
            rendering_offset: 0,
            is_sync: pending.is_sync,
            bytes: pending.bytes.into(),
        };

        writer.write_sample(track_id, &sample)?;
        track.samples += 1;
        Ok(())
    }
}

impl Container for Mp4Container {
    fn add_track(&mut self, format: &TrackFormat) -> Result<TrackIndex> {
        if self.writer.is_some() {
            return Err(MuxError::AlreadyStarted);
        }

        let (config, timescale, default_duration) = match format {
            TrackFormat::Video(v) => (
                self.video_track(v)?,
                self.config.video_timescale,
                self.config.video_timescale / 30,
            ),
            // AAC frames carry 1024 samples per channel
            TrackFormat::Audio(a) => (Self::audio_track(a), a.sample_rate, 1024),
        };

        self.tracks.push(Track {
            config,
            timescale,
            first_pts_us: None,
            pending: None,
            last_duration: default_duration,
            samples: 0,
        });

        Ok(TrackIndex(self.tracks.len() as u32 - 1))
    }

    fn start(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Err(MuxError::AlreadyStarted);
        }

        let file = File::create(&self.config.output_path).map_err(|e| {
            MuxError::Io(std::io::Error::other(format!(
                "create `{}` failed. error: {e}",
                self.config.output_path.display()
            )))
        })?;
        self.file_created = true;

        let mp4_config = Mp4Config {
            major_brand: "isom".parse::<FourCC>()?,
            minor_version: 512,
            compatible_brands: vec![
                "isom".parse::<FourCC>()?,
                "iso2".parse::<FourCC>()?,
                "avc1".parse::<FourCC>()?,
                "mp41".parse::<FourCC>()?,
            ],
            timescale: self.config.video_timescale,
        };

        let mut writer = Mp4Writer::write_start(BufWriter::new(file), &mp4_config)?;
        for track in &self.tracks {
            writer.add_track(&track.config)?;
        }

        log::info!(
            "mp4 container started with {} track(s): {}",
            self.tracks.len(),
            self.config.output_path.display()
        );
        self.writer = Some(writer);
        Ok(())
    }

    fn write_sample(&mut self, track: TrackIndex, data: &[u8], info: &SampleInfo) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| MuxError::InvalidState("container not started".to_string()))?;
        let entry = self
            .tracks
            .get_mut(track.0 as usize)
            .ok_or(MuxError::UnknownTrack(track.0))?;

        if entry.first_pts_us.is_none() {
            entry.first_pts_us = Some(info.pts_us);
        }
        let start_time = entry.media_time(info.pts_us);

        Self::flush_pending(writer, track.0 + 1, entry, Some(start_time))?;
        entry.pending = Some(PendingSample {
            start_time,
            is_sync: info.is_sync,
            bytes: data.to_vec(),
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };

        for (index, track) in self.tracks.iter_mut().enumerate() {
            Self::flush_pending(&mut writer, index as u32 + 1, track, None)?;
            log::debug!("track {} wrote {} samples", index + 1, track.samples);
        }

        writer.write_end()?;

        let mut file = writer
            .into_writer()
            .into_inner()
            .map_err(|e| MuxError::Io(e.into_error()))?;

        let offsets = self.start_offsets();
        if offsets.iter().any(|offset| *offset > 0) {
            write_edit_lists(&mut file, &offsets)?;
        }

        log::info!(
            "mp4 container finalized: {}",
            self.config.output_path.display()
        );
        Ok(())
    }

    fn discard(&mut self) {
        self.writer = None;
        if self.file_created
            && let Err(e) = fs::remove_file(&self.config.output_path)
        {
            log::warn!(
                "remove `{}` failed: {e}",
                self.config.output_path.display()
            );
        }
        self.file_created = false;
    }
}

/// Rewrites the trailing `moov` box of a finalized file so tracks starting
/// after the shared origin begin with an empty edit of `offsets[i]`.
fn write_edit_lists(file: &mut File, offsets: &[u64]) -> Result<()> {
    let size = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;
    let mut moov = Mp4Reader::read_header(BufReader::new(&mut *file), size)?.moov;

    let moov_pos = match last_box(file, size)? {
        Some((pos, BoxType::MoovBox)) => pos,
        _ => {
            return Err(MuxError::InvalidState(
                "moov is not the last box of the file".to_string(),
            ));
        }
    };

    let mut movie_duration = moov.mvhd.duration;
    for (trak, offset) in moov.traks.iter_mut().zip(offsets) {
        if *offset == 0 {
            continue;
        }

        let media_duration = trak.tkhd.duration;
        // An empty edit of `offset` followed by the whole media. The edts/elst
        // types are not exported by `mp4`, so the boxes are filled in place.
        let wide = *offset > u32::MAX as u64 || media_duration > u32::MAX as u64;
        let (version, empty_media_time) = if wide {
            (1, u64::MAX)
        } else {
            (0, u32::MAX as u64)
        };
        trak.edts = Some(Default::default());
        let edts = trak.edts.as_mut().unwrap();
        edts.elst = Some(Default::default());
        let elst = edts.elst.as_mut().unwrap();
        elst.version = version;
        elst.flags = 0;
        elst.entries = vec![Default::default(), Default::default()];
        elst.entries[0].segment_duration = *offset;
        elst.entries[0].media_time = empty_media_time;
        elst.entries[0].media_rate = 1;
        elst.entries[0].media_rate_fraction = 0;
        elst.entries[1].segment_duration = media_duration;
        elst.entries[1].media_time = 0;
        elst.entries[1].media_rate = 1;
        elst.entries[1].media_rate_fraction = 0;
        trak.tkhd.duration = media_duration + offset;
        if trak.tkhd.duration > u32::MAX as u64 {
            trak.tkhd.version = 1;
        }
        movie_duration = movie_duration.max(trak.tkhd.duration);
    }

    moov.mvhd.duration = movie_duration;
    if movie_duration > u32::MAX as u64 {
        moov.mvhd.version = 1;
    }

    file.seek(SeekFrom::Start(moov_pos))?;
    let written = moov.write_box(&mut *file)?;
    file.set_len(moov_pos + written)?;
    log::debug!("edit lists written for start offsets {offsets:?}");
    Ok(())
}

/// Position and type of the last top-level box.
fn last_box(file: &mut File, size: u64) -> Result<Option<(u64, BoxType)>> {
    let mut pos = 0;
    let mut last = None;
    while pos < size {
        file.seek(SeekFrom::Start(pos))?;
        let header = BoxHeader::read(file)?;
        if header.size == 0 {
            break;
        }

        // a 64-bit largesize header reports its size without the extra 8 bytes
        let header_len = file.stream_position()? - pos;
        last = Some((pos, header.name));
        pos += if header_len > 8 {
            header.size + 8
        } else {
            header.size
        };
    }
    Ok(last)
}

pub fn sample_freq_index(sample_rate: u32) -> SampleFreqIndex {
    match sample_rate {
        96000 => SampleFreqIndex::Freq96000,
        88200 => SampleFreqIndex::Freq88200,
        64000 => SampleFreqIndex::Freq64000,
        48000 => SampleFreqIndex::Freq48000,
        44100 => SampleFreqIndex::Freq44100,
        32000 => SampleFreqIndex::Freq32000,
        24000 => SampleFreqIndex::Freq24000,
        22050 => SampleFreqIndex::Freq22050,
        16000 => SampleFreqIndex::Freq16000,
        12000 => SampleFreqIndex::Freq12000,
        11025 => SampleFreqIndex::Freq11025,
        8000 => SampleFreqIndex::Freq8000,
        7350 => SampleFreqIndex::Freq7350,
        _ => SampleFreqIndex::Freq44100,
    }
}
