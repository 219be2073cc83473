use camera::{
    CameraCaptureSource, CameraError, CaptureConfig, CaptureSession, Facing, PatternDevice,
    PreviewSize, PreviewTarget, TestPatternBackend, TestPatternConfig,
};
use gpu_surface::{FrameProducer, ImageStream};
use std::{
    sync::{Arc, Mutex, Weak},
    thread,
    time::{Duration, Instant},
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct TestTarget {
    producer: FrameProducer,
    configured: Mutex<Vec<CaptureSession>>,
    stopped: Mutex<usize>,
}

impl PreviewTarget for TestTarget {
    fn frame_producer(&self) -> Option<FrameProducer> {
        Some(self.producer.clone())
    }

    fn on_preview_configured(&self, session: &CaptureSession) {
        self.configured.lock().unwrap().push(session.clone());
    }

    fn on_preview_stopped(&self) {
        *self.stopped.lock().unwrap() += 1;
    }
}

struct Fixture {
    stream: ImageStream,
    target: Arc<TestTarget>,
}

fn fixture() -> Fixture {
    let stream = ImageStream::new();
    let target = Arc::new(TestTarget {
        producer: stream.producer(),
        configured: Mutex::new(vec![]),
        stopped: Mutex::new(0),
    });

    Fixture { stream, target }
}

fn source(
    backend: &TestPatternBackend,
    target: &Arc<TestTarget>,
    config: CaptureConfig,
) -> CameraCaptureSource {
    let target: Arc<dyn PreviewTarget> = target.clone();
    let weak: Weak<dyn PreviewTarget> = Arc::downgrade(&target);
    CameraCaptureSource::new(Box::new(backend.clone()), weak, config)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_start_preview_negotiates() {
    init_logger();
    let fx = fixture();
    let backend = TestPatternBackend::new(
        TestPatternConfig::default().with_frame_interval(Duration::from_millis(5)),
    );
    let source = source(&backend, &fx.target, CaptureConfig::default());

    source.start_preview(720, 1280).unwrap();

    let session = source.session().unwrap();
    assert_eq!(session.facing, Facing::Front);
    assert_eq!(session.preview_size, PreviewSize::new(320, 180));
    assert_eq!(session.orientation, 90);
    assert_eq!(session.video_size(), PreviewSize::new(180, 320));
    assert_eq!(source.video_size(), Some(PreviewSize::new(180, 320)));
    assert_eq!(fx.target.configured.lock().unwrap().len(), 1);

    assert!(wait_until(Duration::from_secs(2), || fx.stream.queued_frames() > 0));

    source.stop_preview();
    assert_eq!(backend.open_devices(), 0);
    assert!(!source.is_previewing());
}

#[test]
fn test_max_height_caps_preview() {
    init_logger();
    let fx = fixture();
    let backend = TestPatternBackend::default();
    let source = source(
        &backend,
        &fx.target,
        CaptureConfig::default()
            .with_max_preview_height(100)
            .with_facing(Facing::Back),
    );

    source.start_preview(100, 100).unwrap();
    let session = source.session().unwrap();
    assert_eq!(session.preview_size, PreviewSize::new(128, 72));
    assert_eq!(session.facing, Facing::Back);
    assert_eq!(session.orientation, 90);
}

#[test]
fn test_stop_is_idempotent() {
    init_logger();
    let fx = fixture();
    let backend = TestPatternBackend::default();
    let source = source(&backend, &fx.target, CaptureConfig::default());

    source.stop_preview();
    source.start_preview(10, 10).unwrap();
    assert_eq!(backend.open_devices(), 1);

    source.stop_preview();
    source.stop_preview();
    source.stop_preview_async();
    assert_eq!(backend.open_devices(), 0);
    assert_eq!(*fx.target.stopped.lock().unwrap(), 1);

    source.shutdown();
    source.stop_preview();
    assert!(matches!(
        source.start_preview(10, 10),
        Err(CameraError::WorkerGone)
    ));
}

#[test]
fn test_switch_facing_releases_previous_device() {
    init_logger();
    let fx = fixture();
    let backend = TestPatternBackend::default();
    let source = source(&backend, &fx.target, CaptureConfig::default());

    source.start_preview(10, 10).unwrap();
    assert_eq!(source.session().unwrap().camera_id, "1");

    source.switch_facing().unwrap();
    assert_eq!(source.facing(), Facing::Back);
    assert_eq!(source.session().unwrap().camera_id, "0");
    assert_eq!(backend.opened_total(), 2);
    assert_eq!(backend.max_open_devices(), 1);
    assert_eq!(backend.open_devices(), 1);

    source.switch_facing().unwrap();
    assert!(source.is_front_facing());
    assert_eq!(backend.max_open_devices(), 1);
}

#[test]
fn test_switch_facing_needs_front_and_another_camera() {
    init_logger();
    let fx = fixture();
    let backend = TestPatternBackend::new(
        TestPatternConfig::default().with_devices(vec![PatternDevice::new("0", Facing::Back, 90)]),
    );
    let source = source(&backend, &fx.target, CaptureConfig::default());

    source.start_preview(10, 10).unwrap();
    assert_eq!(source.session().unwrap().facing, Facing::Back);

    source.switch_facing().unwrap();
    assert_eq!(source.facing(), Facing::Front);
    assert_eq!(backend.opened_total(), 1);
}

#[test]
fn test_configuration_error_releases_device() {
    init_logger();
    let fx = fixture();
    let backend = TestPatternBackend::new(TestPatternConfig::default().with_reject_configuration(true));
    let source = source(&backend, &fx.target, CaptureConfig::default());

    assert!(matches!(
        source.start_preview(10, 10),
        Err(CameraError::ConfigurationError(_))
    ));
    assert_eq!(backend.opened_total(), 1);
    assert_eq!(backend.open_devices(), 0);
    assert!(!source.is_previewing());
}

#[test]
fn test_no_camera() {
    init_logger();
    let fx = fixture();
    let backend = TestPatternBackend::new(TestPatternConfig::default().with_devices(vec![]));
    let source = source(&backend, &fx.target, CaptureConfig::default());

    assert!(matches!(
        source.start_preview(10, 10),
        Err(CameraError::DeviceUnavailable(_))
    ));
}

#[test]
fn test_dropped_target_is_noop() {
    init_logger();
    let fx = fixture();
    let backend = TestPatternBackend::default();
    let target = fx.target.clone();
    let source = source(&backend, &target, CaptureConfig::default());
    drop(target);
    drop(fx);

    source.start_preview(10, 10).unwrap();
    assert_eq!(backend.opened_total(), 0);
    assert!(!source.is_previewing());
}
