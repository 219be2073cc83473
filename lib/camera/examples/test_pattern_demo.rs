use camera::{
    CameraCaptureSource, CameraResult, CaptureConfig, CaptureSession, PreviewTarget,
    TestPatternBackend,
};
use gpu_surface::{FrameProducer, ImageStream};
use std::{
    sync::{Arc, Weak},
    thread,
    time::Duration,
};

struct LogTarget {
    producer: FrameProducer,
}

impl PreviewTarget for LogTarget {
    fn frame_producer(&self) -> Option<FrameProducer> {
        Some(self.producer.clone())
    }

    fn on_preview_configured(&self, session: &CaptureSession) {
        log::info!("preview configured: {session:?}");
    }
}

fn main() -> CameraResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let stream = ImageStream::new();
    stream.set_on_frame_available(|| log::trace!("frame available"));

    let target: Arc<dyn PreviewTarget> = Arc::new(LogTarget {
        producer: stream.producer(),
    });
    let weak: Weak<dyn PreviewTarget> = Arc::downgrade(&target);

    let backend = TestPatternBackend::default();
    let source = CameraCaptureSource::new(Box::new(backend.clone()), weak, CaptureConfig::default());

    source.start_preview(320, 180)?;
    thread::sleep(Duration::from_secs(1));
    source.switch_facing()?;
    thread::sleep(Duration::from_secs(1));
    source.stop_preview();

    log::info!(
        "frames: {}, queued into stream: {}",
        backend.frames_produced(),
        stream.queued_frames()
    );

    Ok(())
}
