use crate::{RecorderError, Result};
use chrono::Local;
use derivative::Derivative;
use derive_setters::Setters;
use std::path::{Path, PathBuf};

/// Bits per pixel used to derive a video bitrate when none is set.
const BITS_PER_PIXEL: f32 = 0.25;

#[derive(Debug, Clone, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_")]
#[non_exhaustive]
pub struct RecorderConfig {
    #[derivative(Default(value = "PathBuf::from(\"recording.mp4\")"))]
    pub output_path: PathBuf,

    /// Size of the encoder input surface.
    #[derivative(Default(value = "800"))]
    pub frame_width: u32,

    #[derivative(Default(value = "600"))]
    pub frame_height: u32,

    #[derivative(Default(value = "25"))]
    pub fps: u32,

    /// Seconds between two key frames.
    #[derivative(Default(value = "1"))]
    pub key_frame_interval: u32,

    #[setters(strip_option)]
    pub bitrate: Option<u32>,

    #[derivative(Default(value = "true"))]
    pub enable_audio: bool,

    #[derivative(Default(value = "44100"))]
    pub audio_sample_rate: u32,

    #[derivative(Default(value = "1"))]
    pub audio_channels: u16,

    #[derivative(Default(value = "64000"))]
    pub audio_bitrate: u32,

    /// Only every nth display draw is forwarded to the video encoder.
    #[derivative(Default(value = "2"))]
    pub encode_every_nth_draw: u32,

    /// Remove the output file once the container is closed when `false`.
    #[derivative(Default(value = "true"))]
    pub keep_output: bool,
}

impl RecorderConfig {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self::default().with_output_path(output_path.into())
    }

    /// Builds `dir/YYYY-MM-DD-HH-MM-SS.mp4` from the local time.
    pub fn output_file_name(dir: impl AsRef<Path>) -> PathBuf {
        let mut filename = Local::now().format("%Y-%m-%d-%H-%M-%S").to_string();
        filename.push_str(".mp4");
        dir.as_ref().join(filename)
    }

    /// Number of display draws per encoder frame, never zero.
    pub fn encode_interval(&self) -> u32 {
        self.encode_every_nth_draw.max(1)
    }

    pub fn video_bitrate(&self) -> u32 {
        self.bitrate.unwrap_or_else(|| {
            (BITS_PER_PIXEL * self.fps as f32 * self.frame_width as f32 * self.frame_height as f32)
                as u32
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(RecorderError::InvalidConfig(format!(
                "frame size {}x{}",
                self.frame_width, self.frame_height
            )));
        }

        // 4:2:0 chroma needs even dimensions
        if self.frame_width % 2 != 0 || self.frame_height % 2 != 0 {
            return Err(RecorderError::InvalidConfig(format!(
                "frame size {}x{} is not even",
                self.frame_width, self.frame_height
            )));
        }

        if self.fps == 0 {
            return Err(RecorderError::InvalidConfig("fps is 0".to_string()));
        }

        if self.enable_audio && !(1..=2).contains(&self.audio_channels) {
            return Err(RecorderError::InvalidConfig(format!(
                "audio channels {}",
                self.audio_channels
            )));
        }

        match self.output_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => {
                Err(RecorderError::InvalidConfig(format!(
                    "No found saved directory: {}",
                    dir.display()
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RecorderConfig::default();
        assert_eq!(config.encode_every_nth_draw, 2);
        assert_eq!(config.encode_interval(), 2);
        assert_eq!(config.video_bitrate(), 3_000_000);
        assert!(config.keep_output);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_forwards_every_draw() {
        let config = RecorderConfig::default().with_encode_every_nth_draw(0);
        assert_eq!(config.encode_interval(), 1);
    }

    #[test]
    fn test_output_file_name() {
        let path = RecorderConfig::output_file_name("/tmp/movies");
        assert_eq!(path.parent(), Some(Path::new("/tmp/movies")));

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with(".mp4"));
        // YYYY-MM-DD-HH-MM-SS
        let stem = name.trim_end_matches(".mp4");
        assert_eq!(stem.len(), 19);
        assert_eq!(stem.split('-').count(), 6);
    }

    #[test]
    fn test_validate() {
        assert!(
            RecorderConfig::default()
                .with_frame_width(801)
                .validate()
                .is_err()
        );
        assert!(RecorderConfig::default().with_fps(0).validate().is_err());
        assert!(
            RecorderConfig::default()
                .with_audio_channels(3)
                .validate()
                .is_err()
        );
        assert!(
            RecorderConfig::new("/no/such/dir/out.mp4")
                .validate()
                .is_err()
        );
    }
}
