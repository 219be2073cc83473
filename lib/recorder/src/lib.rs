//! # Camera Recorder Library
//!
//! Shows a live camera preview and records it, together with an audio track,
//! into an MP4 file.
//!
//! ## Features
//!
//! - **Camera Preview**: Camera frames land in a shared texture and are drawn
//!   aspect-filled on the display surface whenever a new frame arrives
//! - **Video Encoding**: Every nth display frame is redrawn onto the video
//!   codec's input surface by a thread of its own
//! - **Audio Encoding**: PCM from any source is encoded next to the video
//! - **MP4 Output**: Both tracks are interleaved by a multiplexer that opens
//!   the file once every encoder is ready and closes it once all have finished
//!
//! ## Quick Start
//!
//! ```no_run
//! use camera::{CaptureConfig, TestPatternBackend};
//! use gpu_surface::{MemoryWindow, Platform};
//! use recorder::{CameraView, RecorderConfig, RecordingSession};
//! use std::{sync::Arc, time::Duration};
//!
//! # fn codec() -> Box<dyn recorder::VideoCodec> { unimplemented!() }
//! let view = CameraView::new(
//!     Platform::default(),
//!     Box::new(TestPatternBackend::default()),
//!     CaptureConfig::default(),
//!     2,
//! );
//! view.on_surface_created(Arc::new(MemoryWindow::new(1280, 720))).unwrap();
//! view.on_surface_changed(1280, 720).unwrap();
//!
//! let config = RecorderConfig::new("recording.mp4").with_enable_audio(false);
//! let mut session = RecordingSession::with_mp4(config).unwrap();
//! session.set_encoder_listener(view.encoder_listener());
//!
//! let size = view.video_size().unwrap();
//! session
//!     .add_video_encoder((size.width, size.height), view.is_front_facing(), codec())
//!     .unwrap();
//! session.prepare().unwrap();
//! session.start_recording().unwrap();
//!
//! std::thread::sleep(Duration::from_secs(5));
//! session.stop_recording();
//! session.wait_finished(Duration::from_secs(10));
//! ```
//!
//! ## Architecture
//!
//! 1. **Camera Worker**: opens the device and pushes frames into the texture
//! 2. **Display Render Thread**: draws the texture on screen, forwards every
//!    nth frame to the attached encoder
//! 3. **Encoder Relay Thread**: owns a second context sharing the texture,
//!    draws it onto the codec input surface
//! 4. **Drain Threads**: one per encoder, move codec output into the
//!    multiplexer
//!
//! ## Modules
//!
//! - [`compositor`]: Display drawing, aspect-fill transform, consumer hand-off
//! - [`render_thread`]: The display render loop
//! - [`encoder_relay`]: Render-to-encoder thread
//! - [`codec`]: Codec interface and the optional software codecs
//! - [`media_encoder`]: Encoder contract and the shared drain loop
//! - [`recorder`]: Recording session lifecycle
//! - [`camera_view`]: Glue between the platform surface, camera and encoders

mod audio_encoder;
mod recorder_config;
mod recorder_error;
mod video_encoder;

pub mod camera_view;
pub mod codec;
pub mod compositor;
pub mod encoder_relay;
pub mod media_encoder;
pub mod recorder;
pub mod render_thread;

pub use audio_encoder::AudioEncoder;
pub use camera_view::CameraView;
pub use codec::{
    AudioCodec, AudioCodecConfig, Codec, CodecOutput, InputFrame, InputSurface, VideoCodec,
    VideoCodecConfig, presentation_time_us,
};
pub use compositor::{FrameCompositor, FrameConsumer, aspect_fit_matrix, aspect_fit_scale};
pub use encoder_relay::{EncoderFrameRelay, RelayState};
pub use media_encoder::{EncoderListener, EncoderRef, EncoderState, MediaEncoder};
pub use recorder::RecordingSession;
pub use recorder_config::RecorderConfig;
pub use recorder_error::{RecorderError, Result};
pub use render_thread::DisplayRenderer;
pub use video_encoder::VideoEncoder;

#[cfg(all(feature = "x264-video-encoder", target_os = "linux"))]
pub use codec::codec_x264::X264Codec;

#[cfg(feature = "fdk-aac-audio-encoder")]
pub use codec::codec_fdk_aac::FdkAacCodec;
