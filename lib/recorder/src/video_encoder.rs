use crate::{
    RecorderError, Result,
    codec::{VideoCodec, VideoCodecConfig},
    compositor::FrameConsumer,
    encoder_relay::EncoderFrameRelay,
    media_encoder::{EncoderCore, EncoderListener, EncoderRef, EncoderState, MediaEncoder},
};
use gpu_surface::{Mat4, NativeWindow, SharedContext, TextureId};
use mp4m::{Multiplexer, TrackKind};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

struct VideoInner {
    core: EncoderCore,
    config: VideoCodecConfig,
    video_size: (u32, u32),
    front_facing: bool,
    codec: Mutex<Option<Box<dyn VideoCodec>>>,
    window: Mutex<Option<Arc<dyn NativeWindow>>>,
    relay: Mutex<Option<Arc<EncoderFrameRelay>>>,
    texture: Mutex<Option<TextureId>>,
}

/// Drives a video codec whose input is fed by an [`EncoderFrameRelay`].
///
/// Cheap to clone; all clones share the same encoder.
#[derive(Clone)]
pub struct VideoEncoder {
    inner: Arc<VideoInner>,
}

impl VideoEncoder {
    /// `video_size` is the upright camera size; `front_facing` mirrors the
    /// encoded picture the same way the preview is mirrored.
    pub fn new(
        muxer: Arc<Multiplexer>,
        listener: Option<Arc<dyn EncoderListener>>,
        config: VideoCodecConfig,
        video_size: (u32, u32),
        front_facing: bool,
        codec: Box<dyn VideoCodec>,
    ) -> Result<Self> {
        let core = EncoderCore::new("video-encoder", TrackKind::Video, muxer, listener)?;

        Ok(Self {
            inner: Arc::new(VideoInner {
                core,
                config,
                video_size,
                front_facing,
                codec: Mutex::new(Some(codec)),
                window: Mutex::new(None),
                relay: Mutex::new(None),
                texture: Mutex::new(None),
            }),
        })
    }

    pub fn state(&self) -> EncoderState {
        self.inner.core.state()
    }

    pub fn config(&self) -> &VideoCodecConfig {
        &self.inner.config
    }

    pub fn samples_written(&self) -> u64 {
        self.inner.core.samples_written()
    }

    /// Frames the relay drew onto the codec input so far.
    pub fn frames_drawn(&self) -> u64 {
        self.relay().map(|r| r.frames_drawn()).unwrap_or_default()
    }

    fn relay(&self) -> Option<Arc<EncoderFrameRelay>> {
        self.inner
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hands the latest camera frame to the codec input. Returns `false`
    /// when the encoder is not capturing.
    pub fn frame_available(&self, tex_matrix: &Mat4) -> bool {
        if !self.inner.core.is_capturing() {
            return false;
        }

        let texture = *self
            .inner
            .texture
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match (texture, self.relay()) {
            (Some(texture), Some(relay)) => relay.draw(texture, tex_matrix),
            _ => false,
        }
    }

    /// Whether the codec input surface still takes frames.
    pub fn is_surface_valid(&self) -> bool {
        self.relay().is_some_and(|r| r.is_valid())
    }

    fn finish(&self) {
        self.inner.core.notify_stopped(EncoderRef::Video(self.clone()));

        let relay = self
            .inner
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(relay) = relay {
            relay.release();
        }

        self.inner
            .texture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mut codec) = self
            .inner
            .codec
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            codec.release();
        }
    }
}

impl MediaEncoder for VideoEncoder {
    fn kind(&self) -> TrackKind {
        TrackKind::Video
    }

    fn prepare(&self) -> Result<()> {
        let core = &self.inner.core;
        core.check_prepare()?;

        let window = {
            let mut codec = self
                .inner
                .codec
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let codec = codec
                .as_mut()
                .ok_or_else(|| RecorderError::InvalidState("video codec released".to_string()))?;
            codec.configure(&self.inner.config)?
        };

        let relay = EncoderFrameRelay::new(
            &core.name,
            self.inner.video_size,
            self.inner.front_facing,
        )?;

        log::info!(
            "video encoder prepared: {}x{}@{} {} bps",
            self.inner.config.width,
            self.inner.config.height,
            self.inner.config.fps,
            self.inner.config.bitrate
        );

        *self
            .inner
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(window);
        *self
            .inner
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(relay));
        core.set_state(EncoderState::Prepared);

        core.notify_prepared(EncoderRef::Video(self.clone()));
        Ok(())
    }

    fn start_recording(&self) -> Result<()> {
        let core = &self.inner.core;
        core.begin_capture()?;

        let codec = self
            .inner
            .codec
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut codec) = codec else {
            core.set_state(EncoderState::Prepared);
            return Err(RecorderError::InvalidState("video codec released".to_string()));
        };

        if let Err(e) = codec.start() {
            *self
                .inner
                .codec
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(codec);
            core.set_state(EncoderState::Prepared);
            return Err(e);
        }

        let this = self.clone();
        core.spawn_drain(move || {
            this.inner.core.drain(codec.as_mut(), |_| Ok(()));
            this.finish();
        })
    }

    fn stop_recording(&self) {
        let was = self.inner.core.state();
        if !self.inner.core.request_stop() && was == EncoderState::Prepared {
            // never started: no drain thread will clean up
            self.finish();
        }
    }

    fn is_capturing(&self) -> bool {
        self.inner.core.is_capturing()
    }

    fn state(&self) -> EncoderState {
        self.inner.core.state()
    }

    fn wait_settled(&self, deadline: Instant) -> bool {
        self.inner.core.wait_settled(deadline)
    }

    fn join(&self) {
        self.inner.core.join_drain();
    }
}

impl FrameConsumer for VideoEncoder {
    fn bind(&self, share: &SharedContext, texture: TextureId) -> Result<()> {
        let window = self
            .inner
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let (Some(relay), Some(window)) = (self.relay(), window) else {
            return Err(RecorderError::InvalidState(
                "video encoder is not prepared".to_string(),
            ));
        };

        relay.set_context(share, texture, window, true)?;
        *self
            .inner
            .texture
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(texture);
        Ok(())
    }

    fn frame_available(&self, _texture: TextureId, tex_matrix: &Mat4) {
        VideoEncoder::frame_available(self, tex_matrix);
    }
}
