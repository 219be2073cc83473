use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

/// Index of a track inside one container. Stable for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackIndex(pub(crate) u32);

impl TrackIndex {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
}

/// Format descriptor an encoder reports once its output format is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
}

impl TrackFormat {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackFormat::Video(_) => TrackKind::Video,
            TrackFormat::Audio(_) => TrackKind::Audio,
        }
    }
}

/// Metadata of one encoded access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleInfo {
    pub pts_us: u64,
    pub is_sync: bool,
}

impl SampleInfo {
    pub fn new(pts_us: u64, is_sync: bool) -> Self {
        Self { pts_us, is_sync }
    }
}

/// A file format writer. Tracks are added before `start`, samples are
/// written between `start` and `stop`.
pub trait Container: Send {
    fn add_track(&mut self, format: &TrackFormat) -> Result<TrackIndex>;

    fn start(&mut self) -> Result<()>;

    fn write_sample(&mut self, track: TrackIndex, data: &[u8], info: &SampleInfo) -> Result<()>;

    /// Finalizes the output.
    fn stop(&mut self) -> Result<()>;

    /// Throws away whatever was produced. Called instead of `stop` when the
    /// container never started.
    fn discard(&mut self) {}
}
