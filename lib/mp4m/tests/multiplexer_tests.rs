use mp4m::{
    AudioFormat, Mp4Container, MuxError, Multiplexer, MuxerConfigBuilder, SampleInfo,
    TrackFormat, TrackKind, VideoFormat,
};
use std::{
    fs::File,
    io::BufReader,
    sync::{
        Arc, Barrier, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn video() -> TrackFormat {
    TrackFormat::Video(VideoFormat {
        width: 32,
        height: 16,
        sps: vec![0x67, 0x42, 0x00, 0x0a],
        pps: vec![0x68, 0xce, 0x38, 0x80],
    })
}

fn audio() -> TrackFormat {
    TrackFormat::Audio(AudioFormat {
        sample_rate: 48000,
        channels: 1,
        bitrate: 64000,
    })
}

fn mp4_muxer(dir: &tempfile::TempDir, name: &str) -> (Arc<Multiplexer>, std::path::PathBuf) {
    let path = dir.path().join(name);
    let config = MuxerConfigBuilder::default()
        .output_path(path.clone())
        .build()
        .unwrap();
    (
        Arc::new(Multiplexer::new(Box::new(Mp4Container::new(config)))),
        path,
    )
}

#[test]
fn test_concurrent_attach_same_kind() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (mux, _) = mp4_muxer(&dir, "attach.mp4");

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let mux = mux.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                mux.attach(TrackKind::Video)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(MuxError::DuplicateTrack(TrackKind::Video))))
    );
    assert_eq!(mux.attached_count(), 1);
}

#[test]
fn test_start_order_independent() {
    init_logger();

    for audio_first in [true, false] {
        let dir = tempfile::tempdir().unwrap();
        let (mux, path) = mp4_muxer(&dir, "order.mp4");
        let states = Arc::new(Mutex::new(vec![]));
        let record = states.clone();
        mux.set_state_listener(move |started| record.lock().unwrap().push(started));

        mux.attach(TrackKind::Video).unwrap();
        mux.attach(TrackKind::Audio).unwrap();

        let (first, second) = if audio_first {
            (audio(), video())
        } else {
            (video(), audio())
        };
        let first = mux.add_track(first).unwrap();
        assert!(!mux.start().unwrap());
        assert!(!mux.write_sample(first, &[1, 2, 3], &SampleInfo::new(0, true)));

        let second = mux.add_track(second).unwrap();
        assert!(mux.start().unwrap());
        assert!(mux.is_started());

        for i in 0..3 {
            assert!(mux.write_sample(first, &[1, 2, 3], &SampleInfo::new(i * 20_000, true)));
            assert!(mux.write_sample(second, &[4, 5], &SampleInfo::new(i * 20_000, true)));
        }

        mux.stop();
        mux.stop();
        assert_eq!(*states.lock().unwrap(), vec![true, false]);

        let size = std::fs::metadata(&path).unwrap().len();
        let reader =
            mp4::Mp4Reader::read_header(BufReader::new(File::open(&path).unwrap()), size).unwrap();
        assert_eq!(reader.tracks().len(), 2);
    }
}

#[test]
fn test_write_after_stop_never_reaches_container() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (mux, path) = mp4_muxer(&dir, "late.mp4");

    mux.attach(TrackKind::Video).unwrap();
    let track = mux.add_track(video()).unwrap();
    assert!(mux.start().unwrap());
    assert!(mux.write_sample(track, &[0, 0, 0, 1, 0x65], &SampleInfo::new(0, true)));
    mux.stop();

    let finalized = std::fs::metadata(&path).unwrap().len();
    for i in 1..10 {
        assert!(!mux.write_sample(track, &[9; 64], &SampleInfo::new(i * 1000, false)));
    }
    assert_eq!(std::fs::metadata(&path).unwrap().len(), finalized);
}

#[test]
fn test_wait_started_wakes_on_start() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (mux, _) = mp4_muxer(&dir, "wait.mp4");
    mux.attach(TrackKind::Video).unwrap();
    mux.attach(TrackKind::Audio).unwrap();
    mux.add_track(video()).unwrap();
    mux.add_track(audio()).unwrap();
    mux.start().unwrap();

    assert!(!mux.wait_started(Duration::from_millis(50)));

    let waiters = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let mux = mux.clone();
            let waiters = waiters.clone();
            thread::spawn(move || {
                if mux.wait_started(Duration::from_secs(5)) {
                    waiters.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    mux.start().unwrap();
    handles.into_iter().for_each(|h| h.join().unwrap());
    assert_eq!(waiters.load(Ordering::SeqCst), 2);

    mux.stop();
    mux.stop();
    assert!(!mux.wait_started(Duration::from_secs(5)));
}

#[test]
fn test_concurrent_start_stop_open_close_once() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (mux, _) = mp4_muxer(&dir, "race.mp4");
    let transitions = Arc::new(Mutex::new(vec![]));
    let record = transitions.clone();
    mux.set_state_listener(move |started| record.lock().unwrap().push(started));

    mux.attach(TrackKind::Video).unwrap();
    mux.attach(TrackKind::Audio).unwrap();
    let v = mux.add_track(video()).unwrap();
    let a = mux.add_track(audio()).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = [v, a]
        .into_iter()
        .map(|track| {
            let mux = mux.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                mux.start().unwrap();
                mux.wait_started(Duration::from_secs(5));
                for i in 0..20 {
                    mux.write_sample(track, &[1; 8], &SampleInfo::new(i * 10_000, true));
                }
                mux.stop();
            })
        })
        .collect();

    handles.into_iter().for_each(|h| h.join().unwrap());
    assert_eq!(*transitions.lock().unwrap(), vec![true, false]);
    assert!(mux.is_finished());
}
