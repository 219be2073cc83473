//! The narrow interface the encoder drivers use to talk to a codec.
//!
//! A codec behaves like a hardware encoder: it is configured, started, fed
//! (through an input window for video, through PCM buffers for audio) and
//! drained for output until it reports end of stream.

use crate::{RecorderConfig, Result};
use crossbeam::channel::{Receiver, Sender, TrySendError, bounded};
use gpu_surface::{NativeWindow, RgbaImage};
use mp4m::{SampleInfo, TrackFormat};
use once_cell::sync::Lazy;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

#[cfg(all(feature = "x264-video-encoder", target_os = "linux"))]
pub mod codec_x264;

#[cfg(feature = "fdk-aac-audio-encoder")]
pub mod codec_fdk_aac;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic presentation time shared by every encoder of the process.
pub fn presentation_time_us() -> u64 {
    EPOCH.elapsed().as_micros() as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecOutput {
    /// The output format is known; always the first output.
    FormatChanged(TrackFormat),
    Sample { data: Vec<u8>, info: SampleInfo },
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoCodecConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u32,
    /// Seconds between key frames.
    pub key_frame_interval: u32,
}

impl From<&RecorderConfig> for VideoCodecConfig {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            width: config.frame_width,
            height: config.frame_height,
            fps: config.fps,
            bitrate: config.video_bitrate(),
            key_frame_interval: config.key_frame_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCodecConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
}

impl From<&RecorderConfig> for AudioCodecConfig {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            sample_rate: config.audio_sample_rate,
            channels: config.audio_channels,
            bitrate: config.audio_bitrate,
        }
    }
}

pub trait Codec: Send {
    fn start(&mut self) -> Result<()>;

    /// No more input follows; the codec flushes and ends with
    /// [`CodecOutput::EndOfStream`].
    fn signal_end_of_input(&mut self) -> Result<()>;

    /// Waits up to `timeout` for the next output.
    fn dequeue_output(&mut self, timeout: Duration) -> Result<Option<CodecOutput>>;

    fn release(&mut self) {}
}

pub trait VideoCodec: Codec {
    /// Returns the window the codec reads its input frames from.
    fn configure(&mut self, config: &VideoCodecConfig) -> Result<Arc<dyn NativeWindow>>;
}

pub trait AudioCodec: Codec {
    fn configure(&mut self, config: &AudioCodecConfig) -> Result<()>;

    /// Interleaved samples in `[-1.0, 1.0]`.
    fn queue_input(&mut self, pcm: &[f32], pts_us: u64) -> Result<()>;
}

/// A frame handed to a video codec by its input window.
#[derive(Debug, Clone)]
pub struct InputFrame {
    pub image: RgbaImage,
    pub pts_us: u64,
}

/// The input side of a video codec. Every swap on a surface bound to it
/// queues one [`InputFrame`]; frames are dropped while the queue is full.
pub struct InputSurface {
    size: (u32, u32),
    frames: Sender<InputFrame>,
    valid: AtomicBool,
}

impl InputSurface {
    pub fn new(width: u32, height: u32, capacity: usize) -> (Arc<Self>, Receiver<InputFrame>) {
        let (frames, receiver) = bounded(capacity.max(1));
        let surface = Arc::new(Self {
            size: (width, height),
            frames,
            valid: AtomicBool::new(true),
        });
        (surface, receiver)
    }

    /// Stops accepting frames. Surfaces bound to this window become invalid.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

impl NativeWindow for InputSurface {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn present(&self, frame: &RgbaImage) {
        if !self.is_valid() {
            return;
        }

        let frame = InputFrame {
            image: frame.clone(),
            pts_us: presentation_time_us(),
        };

        match self.frames.try_send(frame) {
            Ok(_) => (),
            Err(TrySendError::Full(_)) => log::trace!("codec input full, drop frame"),
            Err(TrySendError::Disconnected(_)) => self.invalidate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_surface::Rgba;

    #[test]
    fn test_presentation_time_is_monotonic() {
        let a = presentation_time_us();
        std::thread::sleep(Duration::from_millis(2));
        let b = presentation_time_us();
        assert!(b > a);
    }

    #[test]
    fn test_input_surface_drops_when_full() {
        let (surface, frames) = InputSurface::new(2, 2, 2);
        let image = RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 255]));

        for _ in 0..5 {
            surface.present(&image);
        }
        assert_eq!(frames.len(), 2);

        let first = frames.recv().unwrap();
        let second = frames.recv().unwrap();
        assert!(second.pts_us >= first.pts_us);
        assert_eq!(first.image.dimensions(), (2, 2));
    }

    #[test]
    fn test_input_surface_invalidates_on_disconnect() {
        let (surface, frames) = InputSurface::new(2, 2, 1);
        drop(frames);
        assert!(surface.is_valid());

        surface.present(&RgbaImage::new(2, 2));
        assert!(!surface.is_valid());
    }

    #[test]
    fn test_codec_configs_from_recorder_config() {
        let config = RecorderConfig::default();
        let video = VideoCodecConfig::from(&config);
        assert_eq!((video.width, video.height, video.fps), (800, 600, 25));
        assert_eq!(video.bitrate, 3_000_000);

        let audio = AudioCodecConfig::from(&config);
        assert_eq!(audio.sample_rate, 44100);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.bitrate, 64000);
    }
}
