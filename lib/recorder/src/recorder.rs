use crate::{
    AudioEncoder, RecorderConfig, RecorderError, Result, VideoEncoder,
    codec::{AudioCodec, AudioCodecConfig, VideoCodec, VideoCodecConfig},
    media_encoder::{EncoderListener, MediaEncoder},
};
use crossbeam::channel::Receiver;
use mp4m::{Container, Mp4Container, Multiplexer, MuxError, MuxerConfigBuilder};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

type StateCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// One recording: a multiplexer plus at most one video and one audio
/// encoder, driven through `prepare`, `start_recording`, `stop_recording`.
///
/// # Examples
/// ```no_run
/// use crossbeam::channel::Receiver;
/// use recorder::{AudioCodec, CameraView, RecorderConfig, RecordingSession, VideoCodec};
/// use std::time::Duration;
///
/// fn record(
///     view: &CameraView,
///     video: Box<dyn VideoCodec>,
///     audio: Box<dyn AudioCodec>,
///     pcm: Receiver<Vec<f32>>,
/// ) -> recorder::Result<()> {
///     let mut session = RecordingSession::with_mp4(RecorderConfig::new("clip.mp4"))?;
///     session.set_encoder_listener(view.encoder_listener());
///
///     let size = view.video_size().expect("camera is open");
///     session.add_video_encoder((size.width, size.height), view.is_front_facing(), video)?;
///     session.add_audio_encoder(audio, pcm)?;
///
///     session.prepare()?;
///     session.start_recording()?;
///     std::thread::sleep(Duration::from_secs(3));
///
///     session.stop_recording();
///     session.wait_finished(Duration::from_secs(5));
///     Ok(())
/// }
/// ```
pub struct RecordingSession {
    config: RecorderConfig,
    muxer: Arc<Multiplexer>,
    listener: Option<Arc<dyn EncoderListener>>,
    video_encoder: Option<VideoEncoder>,
    audio_encoder: Option<AudioEncoder>,
    state_callback: Arc<Mutex<Option<StateCallback>>>,
    recording: AtomicBool,
}

impl RecordingSession {
    pub fn new(config: RecorderConfig, container: Box<dyn Container>) -> Result<Self> {
        config.validate()?;

        let muxer = Arc::new(Multiplexer::new(container));
        let state_callback: Arc<Mutex<Option<StateCallback>>> = Arc::new(Mutex::new(None));

        let callback = state_callback.clone();
        let output_path = config.output_path.clone();
        let keep_output = config.keep_output;
        muxer.set_state_listener(move |started| {
            log::info!("record state: {}", if started { "started" } else { "stopped" });

            let user = callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(user) = user {
                user(started);
            }

            if !started && !keep_output {
                discard_output(&output_path);
            }
        });

        Ok(Self {
            config,
            muxer,
            listener: None,
            video_encoder: None,
            audio_encoder: None,
            state_callback,
            recording: AtomicBool::new(false),
        })
    }

    /// A session writing an MP4 file to `config.output_path`.
    pub fn with_mp4(config: RecorderConfig) -> Result<Self> {
        let muxer_config = MuxerConfigBuilder::default()
            .output_path(config.output_path.clone())
            .build()
            .map_err(MuxError::from)?;

        Self::new(config, Box::new(Mp4Container::new(muxer_config)))
    }

    /// Called with `true` once the container starts and `false` once it is
    /// finalized.
    pub fn set_state_listener(&self, listener: impl Fn(bool) + Send + Sync + 'static) {
        *self
            .state_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    /// Applies to encoders added afterwards.
    pub fn set_encoder_listener(&mut self, listener: Arc<dyn EncoderListener>) {
        self.listener = Some(listener);
    }

    pub fn add_video_encoder(
        &mut self,
        video_size: (u32, u32),
        front_facing: bool,
        codec: Box<dyn VideoCodec>,
    ) -> Result<VideoEncoder> {
        let encoder = VideoEncoder::new(
            self.muxer.clone(),
            self.listener.clone(),
            VideoCodecConfig::from(&self.config),
            video_size,
            front_facing,
            codec,
        )?;

        self.video_encoder = Some(encoder.clone());
        Ok(encoder)
    }

    pub fn add_audio_encoder(
        &mut self,
        codec: Box<dyn AudioCodec>,
        pcm: Receiver<Vec<f32>>,
    ) -> Result<AudioEncoder> {
        if !self.config.enable_audio {
            return Err(RecorderError::InvalidConfig("audio is disabled".to_string()));
        }

        let encoder = AudioEncoder::new(
            self.muxer.clone(),
            self.listener.clone(),
            AudioCodecConfig::from(&self.config),
            codec,
            pcm,
        )?;

        self.audio_encoder = Some(encoder.clone());
        Ok(encoder)
    }

    fn encoders(&self) -> Vec<&dyn MediaEncoder> {
        let mut encoders: Vec<&dyn MediaEncoder> = vec![];
        if let Some(encoder) = self.video_encoder.as_ref() {
            encoders.push(encoder);
        }
        if let Some(encoder) = self.audio_encoder.as_ref() {
            encoders.push(encoder);
        }
        encoders
    }

    /// Prepares every encoder. When one fails, the ones already prepared
    /// are released and the error is returned.
    pub fn prepare(&self) -> Result<()> {
        if self.is_recording() {
            return Err(RecorderError::AlreadyRecording);
        }

        let encoders = self.encoders();
        if encoders.is_empty() {
            return Err(RecorderError::InvalidState("no encoder added".to_string()));
        }

        for (index, encoder) in encoders.iter().enumerate() {
            if let Err(e) = encoder.prepare() {
                log::warn!("prepare {:?} encoder failed: {e}", encoder.kind());
                for prepared in &encoders[..index] {
                    prepared.stop_recording();
                }
                return Err(e);
            }
        }

        log::info!("recording prepared: {}", self.config.output_path.display());
        Ok(())
    }

    /// Starts every prepared encoder. On failure the ones already started
    /// are stopped again, so the session is never half recording.
    pub fn start_recording(&self) -> Result<()> {
        if self
            .recording
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RecorderError::AlreadyRecording);
        }

        let encoders = self.encoders();
        for (index, encoder) in encoders.iter().enumerate() {
            if let Err(e) = encoder.start_recording() {
                log::warn!("start {:?} encoder failed: {e}", encoder.kind());
                for other in &encoders {
                    other.stop_recording();
                }
                for started in &encoders[..index] {
                    started.join();
                }
                self.recording.store(false, Ordering::Release);
                return Err(e);
            }
        }

        log::info!("recording started");
        Ok(())
    }

    /// Asks every encoder to finish. Safe to call from any thread and more
    /// than once; use [`Self::wait_finished`] to wait for the file.
    pub fn stop_recording(&self) {
        if self.recording.swap(false, Ordering::AcqRel) {
            log::info!("stop recording");
        }

        for encoder in self.encoders() {
            encoder.stop_recording();
        }
    }

    /// Waits until every encoder has drained and the container is closed.
    /// Returns `false` when `timeout` passes first.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let encoders = self.encoders();
        if !encoders.iter().all(|e| e.wait_settled(deadline)) {
            return false;
        }

        for encoder in encoders {
            encoder.join();
        }
        true
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn muxer(&self) -> &Arc<Multiplexer> {
        &self.muxer
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn output_path(&self) -> &PathBuf {
        &self.config.output_path
    }

    pub fn video_encoder(&self) -> Option<&VideoEncoder> {
        self.video_encoder.as_ref()
    }

    pub fn audio_encoder(&self) -> Option<&AudioEncoder> {
        self.audio_encoder.as_ref()
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.stop_recording();
        for encoder in self.encoders() {
            encoder.join();
        }
    }
}

fn discard_output(path: &Path) {
    match fs::remove_file(path) {
        Ok(_) => log::info!("discard {}", path.display()),
        Err(e) => log::warn!("remove `{}` failed: {e}", path.display()),
    }
}
