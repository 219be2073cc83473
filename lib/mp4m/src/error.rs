use crate::TrackKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("{0:?} track already attached")]
    DuplicateTrack(TrackKind),

    #[error("Container already started")]
    AlreadyStarted,

    #[error("No {0:?} encoder attached")]
    NotAttached(TrackKind),

    #[error("Unknown track index: {0}")]
    UnknownTrack(u32),

    #[error("Container state error: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MP4 muxing error: {0}")]
    Mp4(#[from] mp4::Error),

    #[error("Muxer config error: {0}")]
    Config(#[from] crate::mp4_container::MuxerConfigBuilderError),
}

pub type Result<T> = std::result::Result<T, MuxError>;
