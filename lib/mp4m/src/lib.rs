pub mod container;
pub mod error;
pub mod mp4_container;
pub mod multiplexer;

pub use container::{
    AudioFormat, Container, SampleInfo, TrackFormat, TrackIndex, TrackKind, VideoFormat,
};
pub use error::{MuxError, Result};
pub use mp4_container::{
    Mp4Container, MuxerConfig, MuxerConfigBuilder, VIDEO_TIMESCALE, sample_freq_index,
};
pub use multiplexer::{EncoderTrack, Multiplexer, StateListener};
