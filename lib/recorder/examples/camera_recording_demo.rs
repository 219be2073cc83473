use camera::{CaptureConfig, TestPatternBackend};
use gpu_surface::{MemoryWindow, Platform};
use recorder::{CameraView, FdkAacCodec, RecorderConfig, RecordingSession, X264Codec};
use std::{f32::consts::PI, sync::Arc, thread, time::Duration};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = RecorderConfig::new(RecorderConfig::output_file_name("/tmp"))
        .with_frame_width(640)
        .with_frame_height(360);
    log::info!("Recording configuration: {config:#?}");

    let view = CameraView::new(
        Platform::default(),
        Box::new(TestPatternBackend::default()),
        CaptureConfig::default(),
        config.encode_interval(),
    );
    view.on_surface_created(Arc::new(MemoryWindow::new(1280, 720)))?;
    view.on_surface_changed(1280, 720)?;

    let Some(size) = view.video_size() else {
        panic!("camera preview did not start");
    };
    log::info!("camera video size: {}x{}", size.width, size.height);

    let mut session = RecordingSession::with_mp4(config.clone())?;
    session.set_state_listener(|started| log::info!("container started: {started}"));
    session.set_encoder_listener(view.encoder_listener());

    session.add_video_encoder(
        (size.width, size.height),
        view.is_front_facing(),
        Box::new(X264Codec::new()),
    )?;

    // a 440 Hz tone stands in for a microphone
    let (pcm_sender, pcm_receiver) = crossbeam::channel::bounded(64);
    let sample_rate = config.audio_sample_rate as f32;
    thread::spawn(move || {
        let mut phase = 0_f32;
        loop {
            let buffer: Vec<f32> = (0..1024)
                .map(|_| {
                    phase = (phase + 2.0 * PI * 440.0 / sample_rate) % (2.0 * PI);
                    phase.sin() * 0.2
                })
                .collect();

            if pcm_sender.send(buffer).is_err() {
                break;
            }
            thread::sleep(Duration::from_secs_f32(1024.0 / sample_rate));
        }
    });
    session.add_audio_encoder(Box::new(FdkAacCodec::new()), pcm_receiver)?;

    session.prepare()?;
    session.start_recording()?;

    log::info!("Recording for 5 seconds...");
    thread::sleep(Duration::from_secs(5));

    session.stop_recording();
    if !session.wait_finished(Duration::from_secs(10)) {
        log::warn!("encoders did not finish in time");
    }

    log::info!("Recording saved to {}", session.output_path().display());
    Ok(())
}
