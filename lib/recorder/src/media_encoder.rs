use crate::{
    AudioEncoder, RecorderError, Result, VideoEncoder,
    codec::{Codec, CodecOutput},
};
use mp4m::{Multiplexer, SampleInfo, TrackIndex, TrackKind};
use std::{
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);
const MUXER_WAIT_SLICE: Duration = Duration::from_millis(100);
const END_OF_STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// The contract every encoder driver offers to a recording session.
pub trait MediaEncoder: Send + Sync {
    fn kind(&self) -> TrackKind;

    /// Configures the codec. Fails with [`RecorderError::EncoderInitError`]
    /// when the codec rejects the format.
    fn prepare(&self) -> Result<()>;

    fn start_recording(&self) -> Result<()>;

    /// Asks the encoder to finish. Returns at once; the drain loop flushes
    /// the codec and stops its multiplexer track in the background.
    fn stop_recording(&self);

    fn is_capturing(&self) -> bool;

    fn state(&self) -> EncoderState;

    /// Blocks until the encoder is no longer capturing or stopping, or
    /// `deadline` passes. Returns whether it settled in time.
    fn wait_settled(&self, deadline: Instant) -> bool;

    /// Blocks until the drain loop has exited.
    fn join(&self);
}

#[derive(Clone)]
pub enum EncoderRef {
    Video(VideoEncoder),
    Audio(AudioEncoder),
}

impl EncoderRef {
    pub fn kind(&self) -> TrackKind {
        match self {
            EncoderRef::Video(_) => TrackKind::Video,
            EncoderRef::Audio(_) => TrackKind::Audio,
        }
    }
}

/// Observes the encoder lifecycle. Used to attach the video encoder to the
/// display pipeline once it is prepared and to detach it when it stops.
pub trait EncoderListener: Send + Sync {
    fn on_prepared(&self, encoder: EncoderRef);

    fn on_stopped(&self, encoder: EncoderRef);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Idle,
    Prepared,
    Capturing,
    Stopping,
    Stopped,
}

/// State shared by an encoder handle and its drain thread.
pub(crate) struct EncoderCore {
    pub name: String,
    pub kind: TrackKind,
    pub muxer: Arc<Multiplexer>,
    pub listener: Option<Arc<dyn EncoderListener>>,
    state: Mutex<EncoderState>,
    state_changed: Condvar,
    stop_requested: AtomicBool,
    samples: AtomicU64,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl EncoderCore {
    /// Attaches `kind` to the multiplexer.
    pub fn new(
        name: impl Into<String>,
        kind: TrackKind,
        muxer: Arc<Multiplexer>,
        listener: Option<Arc<dyn EncoderListener>>,
    ) -> Result<Self> {
        muxer.attach(kind)?;

        Ok(Self {
            name: name.into(),
            kind,
            muxer,
            listener,
            state: Mutex::new(EncoderState::Idle),
            state_changed: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            samples: AtomicU64::new(0),
            drain: Mutex::new(None),
        })
    }

    pub fn state(&self) -> EncoderState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, state: EncoderState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.state_changed.notify_all();
    }

    /// Blocks until the encoder is neither capturing nor stopping, or
    /// `deadline` passes. Returns whether it settled in time.
    pub fn wait_settled(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while matches!(*state, EncoderState::Capturing | EncoderState::Stopping) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            state = self
                .state_changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    pub fn is_capturing(&self) -> bool {
        self.state() == EncoderState::Capturing
    }

    pub fn samples_written(&self) -> u64 {
        self.samples.load(Ordering::Acquire)
    }

    pub fn check_prepare(&self) -> Result<()> {
        match self.state() {
            EncoderState::Idle => Ok(()),
            state => Err(RecorderError::InvalidState(format!(
                "{} encoder cannot prepare in {state:?}",
                self.name
            ))),
        }
    }

    /// Moves Prepared to Capturing.
    pub fn begin_capture(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            EncoderState::Prepared => {
                *state = EncoderState::Capturing;
                self.stop_requested.store(false, Ordering::Release);
                Ok(())
            }
            EncoderState::Capturing => Err(RecorderError::AlreadyRecording),
            other => Err(RecorderError::InvalidState(format!(
                "{} encoder cannot start in {other:?}",
                self.name
            ))),
        }
    }

    /// Returns `true` when a running drain loop has to wind down.
    pub fn request_stop(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            EncoderState::Capturing => {
                *state = EncoderState::Stopping;
                self.stop_requested.store(true, Ordering::Release);
                true
            }
            EncoderState::Idle | EncoderState::Prepared => {
                *state = EncoderState::Stopped;
                self.state_changed.notify_all();
                false
            }
            EncoderState::Stopping | EncoderState::Stopped => false,
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn spawn_drain(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new()
            .name(format!("{}-drain", self.name))
            .spawn(f)?;
        *self.drain.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    pub fn join_drain(&self) {
        let handle = self
            .drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }

            if handle.join().is_err() {
                log::warn!("{} drain thread panicked", self.name);
            }
        }
    }

    pub fn notify_prepared(&self, encoder: EncoderRef) {
        if let Some(listener) = self.listener.as_ref() {
            listener.on_prepared(encoder);
        }
    }

    pub fn notify_stopped(&self, encoder: EncoderRef) {
        if let Some(listener) = self.listener.as_ref() {
            listener.on_stopped(encoder);
        }
    }

    /// Pulls output from `codec` into the multiplexer until end of stream.
    ///
    /// `feed` runs before every dequeue while the encoder is capturing. On
    /// the first format the track is added and the multiplexer started; no
    /// sample is written before the container runs.
    pub fn drain<C: Codec + ?Sized>(
        &self,
        codec: &mut C,
        mut feed: impl FnMut(&mut C) -> Result<()>,
    ) {
        let mut track: Option<TrackIndex> = None;
        let mut started_muxer = false;
        let mut last_pts_us = 0;
        let mut eos_deadline: Option<Instant> = None;

        log::debug!("{} drain loop start ({:?} track)", self.name, self.kind);

        loop {
            if eos_deadline.is_none() && self.stop_requested() {
                if let Err(e) = codec.signal_end_of_input() {
                    log::warn!("{} signal end of input failed: {e}", self.name);
                }
                eos_deadline = Some(Instant::now() + END_OF_STREAM_TIMEOUT);
            }

            if let Some(deadline) = eos_deadline
                && Instant::now() >= deadline
            {
                log::warn!("{} codec never reached end of stream", self.name);
                break;
            }

            if eos_deadline.is_none()
                && let Err(e) = feed(codec)
            {
                log::warn!("{} feed codec failed: {e}", self.name);
                self.stop_requested.store(true, Ordering::Release);
                continue;
            }

            let output = match codec.dequeue_output(DRAIN_TIMEOUT) {
                Ok(Some(output)) => output,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("{} dequeue output failed: {e}", self.name);
                    break;
                }
            };

            match output {
                CodecOutput::FormatChanged(format) => {
                    if track.is_some() {
                        log::warn!("{} format changed twice", self.name);
                        continue;
                    }

                    match self.muxer.add_track(format) {
                        Ok(index) => track = Some(index),
                        Err(e) => {
                            log::error!("{} add track failed: {e}", self.name);
                            self.stop_requested.store(true, Ordering::Release);
                            continue;
                        }
                    }

                    match self.muxer.start() {
                        Ok(_) => started_muxer = true,
                        Err(e) => {
                            log::error!("{} start multiplexer failed: {e}", self.name);
                            self.stop_requested.store(true, Ordering::Release);
                            continue;
                        }
                    }

                    while !self.muxer.wait_started(MUXER_WAIT_SLICE) {
                        if self.stop_requested() || self.muxer.is_finished() {
                            break;
                        }
                    }
                }
                CodecOutput::Sample { data, info } => {
                    let Some(index) = track else {
                        log::warn!("{} sample before output format, drop it", self.name);
                        continue;
                    };

                    if data.is_empty() {
                        continue;
                    }

                    last_pts_us = info.pts_us.max(last_pts_us);
                    let info = SampleInfo::new(last_pts_us, info.is_sync);
                    if self.muxer.write_sample(index, &data, &info) {
                        self.samples.fetch_add(1, Ordering::AcqRel);
                    }
                }
                CodecOutput::EndOfStream => {
                    log::debug!("{} end of stream", self.name);
                    break;
                }
            }
        }

        if started_muxer {
            self.muxer.stop();
        }

        codec.release();
        self.set_state(EncoderState::Stopped);
        log::info!(
            "{} drain loop exit, {} samples written",
            self.name,
            self.samples_written()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mp4m::{Container, TrackFormat};

    struct NullContainer;

    impl Container for NullContainer {
        fn add_track(&mut self, _format: &TrackFormat) -> mp4m::Result<TrackIndex> {
            Ok(TrackIndex::new(1))
        }

        fn start(&mut self) -> mp4m::Result<()> {
            Ok(())
        }

        fn write_sample(
            &mut self,
            _track: TrackIndex,
            _data: &[u8],
            _info: &SampleInfo,
        ) -> mp4m::Result<()> {
            Ok(())
        }

        fn stop(&mut self) -> mp4m::Result<()> {
            Ok(())
        }
    }

    fn core() -> Arc<EncoderCore> {
        let muxer = Arc::new(Multiplexer::new(Box::new(NullContainer)));
        Arc::new(EncoderCore::new("test", TrackKind::Audio, muxer, None).unwrap())
    }

    #[test]
    fn test_idle_encoder_is_settled() {
        let core = core();
        assert!(core.wait_settled(Instant::now()));

        core.set_state(EncoderState::Prepared);
        assert!(!core.request_stop());
        assert_eq!(core.state(), EncoderState::Stopped);
        assert!(core.wait_settled(Instant::now()));
    }

    #[test]
    fn test_wait_settled_times_out_while_capturing() {
        let core = core();
        core.set_state(EncoderState::Prepared);
        core.begin_capture().unwrap();

        let start = Instant::now();
        assert!(!core.wait_settled(start + Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_settled_wakes_on_stop() {
        let _ = env_logger::builder().is_test(true).try_init();

        let core = core();
        core.set_state(EncoderState::Prepared);
        core.begin_capture().unwrap();
        assert!(core.request_stop());

        let drain = core.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drain.set_state(EncoderState::Stopped);
        });

        let start = Instant::now();
        assert!(core.wait_settled(start + Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(core.state(), EncoderState::Stopped);
        handle.join().unwrap();
    }
}
