use crate::{
    RecorderError, Result,
    codec::{AudioCodec, AudioCodecConfig, presentation_time_us},
    media_encoder::{EncoderCore, EncoderListener, EncoderRef, EncoderState, MediaEncoder},
};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use mp4m::{Multiplexer, TrackKind};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

const FEED_TIMEOUT: Duration = Duration::from_millis(10);

struct AudioInner {
    core: EncoderCore,
    config: AudioCodecConfig,
    codec: Mutex<Option<Box<dyn AudioCodec>>>,
    pcm: Mutex<Option<Receiver<Vec<f32>>>>,
}

/// Drives an audio codec fed with interleaved PCM from `pcm`. The capture
/// side stays outside the crate; closing the channel ends the stream.
#[derive(Clone)]
pub struct AudioEncoder {
    inner: Arc<AudioInner>,
}

impl AudioEncoder {
    pub fn new(
        muxer: Arc<Multiplexer>,
        listener: Option<Arc<dyn EncoderListener>>,
        config: AudioCodecConfig,
        codec: Box<dyn AudioCodec>,
        pcm: Receiver<Vec<f32>>,
    ) -> Result<Self> {
        let core = EncoderCore::new("audio-encoder", TrackKind::Audio, muxer, listener)?;

        Ok(Self {
            inner: Arc::new(AudioInner {
                core,
                config,
                codec: Mutex::new(Some(codec)),
                pcm: Mutex::new(Some(pcm)),
            }),
        })
    }

    pub fn state(&self) -> EncoderState {
        self.inner.core.state()
    }

    pub fn samples_written(&self) -> u64 {
        self.inner.core.samples_written()
    }

    fn finish(&self) {
        self.inner.core.notify_stopped(EncoderRef::Audio(self.clone()));

        self.inner
            .pcm
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

impl MediaEncoder for AudioEncoder {
    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn prepare(&self) -> Result<()> {
        let core = &self.inner.core;
        core.check_prepare()?;

        {
            let mut codec = self
                .inner
                .codec
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            codec
                .as_mut()
                .ok_or_else(|| RecorderError::InvalidState("audio codec released".to_string()))?
                .configure(&self.inner.config)?;
        }

        log::info!(
            "audio encoder prepared: {} Hz, {} channel(s), {} bps",
            self.inner.config.sample_rate,
            self.inner.config.channels,
            self.inner.config.bitrate
        );

        core.set_state(EncoderState::Prepared);
        core.notify_prepared(EncoderRef::Audio(self.clone()));
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
        let pcm = self
            .inner
            .pcm
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let (Some(mut codec), Some(pcm)) = (codec, pcm) else {
            core.set_state(EncoderState::Prepared);
            return Err(RecorderError::InvalidState("audio codec released".to_string()));
        };

        if let Err(e) = codec.start() {
            *self
                .inner
                .codec
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(codec);
            *self.inner.pcm.lock().unwrap_or_else(PoisonError::into_inner) = Some(pcm);
            core.set_state(EncoderState::Prepared);
            return Err(e);
        }

        let this = self.clone();
        core.spawn_drain(move || {
            this.inner.core.drain(codec.as_mut(), |codec| {
                match pcm.recv_timeout(FEED_TIMEOUT) {
                    Ok(buffer) => codec.queue_input(&buffer, presentation_time_us()),
                    Err(RecvTimeoutError::Timeout) => Ok(()),
                    Err(RecvTimeoutError::Disconnected) => Err(RecorderError::InvalidState(
                        "audio source closed".to_string(),
                    )),
                }
            });
            this.finish();
        })
    }

    fn stop_recording(&self) {
        let was = self.inner.core.state();
        if !self.inner.core.request_stop() && was == EncoderState::Prepared {
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
