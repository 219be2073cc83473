use crate::{
    Result,
    container::{Container, SampleInfo, TrackFormat, TrackIndex, TrackKind},
    error::MuxError,
};
use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

const START_WAIT_SLICE: Duration = Duration::from_millis(100);

pub type StateListener = Arc<dyn Fn(bool) + Send + Sync>;

/// One attached encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderTrack {
    pub kind: TrackKind,
    pub index: Option<TrackIndex>,
    pub format: Option<TrackFormat>,
    pub started: bool,
}

struct MuxSession {
    container: Option<Box<dyn Container>>,
    tracks: Vec<EncoderTrack>,
    started_count: usize,
    is_started: bool,
    finished: bool,
}

impl MuxSession {
    fn track_mut(&mut self, kind: TrackKind) -> Option<&mut EncoderTrack> {
        self.tracks.iter_mut().find(|t| t.kind == kind)
    }
}

/// Interleaves the output of up to one video and one audio encoder into a
/// single container.
///
/// The container opens on the `start` call that brings the started count up
/// to the number of attached encoders, and closes on the `stop` call that
/// brings it back to zero. Every counter update and every container call
/// happens under one lock.
///
/// An encoder goes through the multiplexer in this order:
///
/// 1. [`attach`](Self::attach) its track kind when the encoder is created
/// 2. [`add_track`](Self::add_track) once the codec reports its output format
/// 3. [`start`](Self::start), then [`wait_started`](Self::wait_started) until
///    every other attached encoder has started too
/// 4. [`write_sample`](Self::write_sample) for each encoded sample
/// 5. [`stop`](Self::stop) after its codec reached end of stream
///
/// Samples written before the container opens or after it closes are
/// dropped. When the last encoder stops before the container ever opened,
/// the container is discarded and no output is produced.
///
/// # Examples
/// ```no_run
/// use mp4m::{
///     AudioFormat, Mp4Container, Multiplexer, MuxerConfigBuilder, SampleInfo, TrackFormat,
///     TrackKind,
/// };
/// use std::time::Duration;
///
/// fn main() -> mp4m::Result<()> {
///     let config = MuxerConfigBuilder::default()
///         .output_path("voice.mp4".into())
///         .build()?;
///     let muxer = Multiplexer::new(Box::new(Mp4Container::new(config)));
///     muxer.set_state_listener(|started| println!("container started: {started}"));
///
///     muxer.attach(TrackKind::Audio)?;
///     let track = muxer.add_track(TrackFormat::Audio(AudioFormat {
///         sample_rate: 44100,
///         channels: 1,
///         bitrate: 64000,
///     }))?;
///
///     muxer.start()?;
///     assert!(muxer.wait_started(Duration::from_secs(1)));
///
///     for i in 0..10 {
///         let info = SampleInfo::new(i * 23_219, true);
///         muxer.write_sample(track, &[0x21; 8], &info);
///     }
///
///     muxer.stop();
///     assert!(muxer.is_finished());
///     Ok(())
/// }
/// ```
pub struct Multiplexer {
    session: Mutex<MuxSession>,
    started_cond: Condvar,
    listener: Mutex<Option<StateListener>>,
}

impl Multiplexer {
    pub fn new(container: Box<dyn Container>) -> Self {
        Self {
            session: Mutex::new(MuxSession {
                container: Some(container),
                tracks: vec![],
                started_count: 0,
                is_started: false,
                finished: false,
            }),
            started_cond: Condvar::new(),
            listener: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MuxSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called with `true` when the container opens and `false` when it closes.
    pub fn set_state_listener(&self, listener: impl Fn(bool) + Send + Sync + 'static) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(listener));
    }

    fn notify(&self, started: bool) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Some(listener) = listener {
            listener(started);
        }
    }

    pub fn attach(&self, kind: TrackKind) -> Result<()> {
        let mut session = self.lock();
        if session.tracks.iter().any(|t| t.kind == kind) {
            return Err(MuxError::DuplicateTrack(kind));
        }

        session.tracks.push(EncoderTrack {
            kind,
            index: None,
            format: None,
            started: false,
        });
        log::debug!("attach {kind:?} encoder ({} attached)", session.tracks.len());
        Ok(())
    }

    pub fn add_track(&self, format: TrackFormat) -> Result<TrackIndex> {
        let mut session = self.lock();
        if session.is_started || session.finished {
            return Err(MuxError::AlreadyStarted);
        }

        let kind = format.kind();
        match session.track_mut(kind) {
            None => return Err(MuxError::NotAttached(kind)),
            Some(track) if track.index.is_some() => return Err(MuxError::DuplicateTrack(kind)),
            Some(_) => (),
        }

        let index = session
            .container
            .as_mut()
            .ok_or_else(|| MuxError::InvalidState("container released".to_string()))?
            .add_track(&format)?;

        if let Some(track) = session.track_mut(kind) {
            track.index = Some(index);
            track.format = Some(format);
        }

        log::info!("add {kind:?} track {}", index.raw());
        Ok(index)
    }

    /// Counts one more started encoder. Returns whether the container is
    /// running after this call.
    pub fn start(&self) -> Result<bool> {
        let transitioned = {
            let mut session = self.lock();
            if session.finished {
                return Ok(false);
            }

            session.started_count += 1;
            let attached = session.tracks.len();
            log::debug!("start request {}/{attached}", session.started_count);

            if attached > 0 && session.started_count == attached && !session.is_started {
                let missing = session
                    .tracks
                    .iter()
                    .find(|t| t.index.is_none())
                    .map(|t| t.kind);

                let opened = match missing {
                    Some(kind) => Err(MuxError::InvalidState(format!(
                        "{kind:?} track has no format"
                    ))),
                    None => match session.container.as_mut() {
                        Some(container) => container.start(),
                        None => Err(MuxError::InvalidState("container released".to_string())),
                    },
                };

                // a failed open does not count as started
                if let Err(e) = opened {
                    session.started_count -= 1;
                    return Err(e);
                }

                session.is_started = true;
                session.tracks.iter_mut().for_each(|t| t.started = true);
                true
            } else {
                false
            }
        };

        if transitioned {
            log::info!("container started");
            self.started_cond.notify_all();
            self.notify(true);
        }

        Ok(self.is_started())
    }

    /// Counts one stopped encoder. Extra calls are no-ops.
    pub fn stop(&self) {
        let transitioned = {
            let mut session = self.lock();
            if session.started_count == 0 {
                return;
            }

            session.started_count -= 1;
            if session.started_count > 0 || session.tracks.is_empty() {
                return;
            }

            session.finished = true;
            let Some(mut container) = session.container.take() else {
                return;
            };

            if session.is_started {
                session.is_started = false;
                if let Err(e) = container.stop() {
                    log::error!("finalize container failed: {e}");
                }
                true
            } else {
                log::warn!("container never started, discard it");
                container.discard();
                false
            }
        };

        self.started_cond.notify_all();
        if transitioned {
            log::info!("container stopped");
            self.notify(false);
        }
    }

    /// Forwards a sample while the container runs. Writes outside that
    /// window are dropped and `false` is returned.
    pub fn write_sample(&self, track: TrackIndex, data: &[u8], info: &SampleInfo) -> bool {
        let mut session = self.lock();
        if session.started_count == 0 || !session.is_started {
            log::trace!("drop sample for track {} outside of running window", track.raw());
            return false;
        }

        let Some(container) = session.container.as_mut() else {
            return false;
        };

        match container.write_sample(track, data, info) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("write sample to track {} failed: {e}", track.raw());
                false
            }
        }
    }

    /// Blocks until the container starts, it is finished, or `timeout` passes.
    pub fn wait_started(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut session = self.lock();

        while !session.is_started && !session.finished {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let slice = START_WAIT_SLICE.min(deadline - now);
            session = self
                .started_cond
                .wait_timeout(session, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        session.is_started
    }

    pub fn is_started(&self) -> bool {
        self.lock().is_started
    }

    /// Both halves of the session ran: started and stopped again, or discarded.
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn attached_count(&self) -> usize {
        self.lock().tracks.len()
    }

    pub fn started_count(&self) -> usize {
        self.lock().started_count
    }

    pub fn tracks(&self) -> Vec<EncoderTrack> {
        self.lock().tracks.clone()
    }
}
