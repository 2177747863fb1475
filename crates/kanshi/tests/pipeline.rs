//! Capture → hub → segmenter / dispatcher pipeline tests with scripted backends
//!
//! Run: `cargo test -p kanshi --test pipeline`
//!
//! Tests:
//!   1. Consecutive open failures back off with capped, non-decreasing delays
//!   2. A slow subscriber sees bounded, drop-oldest, in-order delivery
//!   3. Continuous recording cuts bounded segments matching the files on disk
//!   4. A failed catalog insert is retried and the file is kept
//!   5. Inserts that keep failing give up without deleting the file
//!   6. Detections are filtered, suppressed and drive event-based recording
//!   7. Motion produces motion events and segment motion scores
//!   8. Events detected while a continuous segment is open are linked to it
//!   9. A stream that keeps ending reconnects, and each session closes its segment

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{camera, detection, CollectingSink, FlakyCatalog, ScriptedCapture, StaticInference};
use kanshi::capture::{Backoff, StreamState, StreamSupervisor, SupervisorConfig};
use kanshi::catalog::{Catalog, EventFilter, MemoryCatalog, RecordingFilter};
use kanshi::detection::{Dispatcher, DispatcherConfig, DispatcherDeps, MotionSettings, MOTION_LABEL};
use kanshi::recording::{Segmenter, SegmenterConfig, SegmenterDeps};
use kanshi::storage::{read_header, RawSegmentBackend};
use kanshi::{Camera, EventKind, Recording};

fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        queue_capacity: 30,
        open_timeout: Duration::from_secs(1),
        backoff: Backoff::new(Duration::from_millis(50), Duration::from_millis(200)),
        stop_grace: Duration::from_secs(2),
    }
}

fn segmenter_config(root: &Path) -> SegmenterConfig {
    SegmenterConfig {
        storage_root: root.to_path_buf(),
        max_segment: Duration::from_millis(200),
        continuous: true,
        insert_retry: Backoff::new(Duration::from_millis(20), Duration::from_millis(100)),
        insert_retry_attempts: 5,
        stop_grace: Duration::from_secs(2),
    }
}

fn segmenter_deps(supervisor: &StreamSupervisor, catalog: Arc<dyn Catalog>) -> SegmenterDeps {
    SegmenterDeps {
        hub: supervisor.hub().clone(),
        stream_state: supervisor.watch_state(),
        writer: Arc::new(RawSegmentBackend),
        catalog,
    }
}

async fn with_camera(catalog: &dyn Catalog, id: &str) -> Camera {
    let camera = camera(id);
    catalog.insert_camera(&camera).await.unwrap();
    camera
}

async fn recordings(catalog: &dyn Catalog) -> Vec<Recording> {
    catalog
        .list_recordings(&RecordingFilter::default())
        .await
        .unwrap()
}

/// Poll the catalog until it holds at least `n` recordings matching `pred`
async fn wait_for_recordings(
    catalog: &dyn Catalog,
    n: usize,
    pred: impl Fn(&Recording) -> bool,
) -> Vec<Recording> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let rows: Vec<Recording> = recordings(catalog).await.into_iter().filter(|r| pred(r)).collect();
        if rows.len() >= n {
            return rows;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("Timed out waiting for {n} recordings, got {}", rows.len());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn segment_files(root: &Path) -> Vec<std::path::PathBuf> {
    walk(root)
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e == "kseg"))
        .collect()
}

fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                out.extend(walk(&path));
            } else {
                out.push(path);
            }
        }
    }
    out
}

// ========== Stream supervisor ==========

/// Test 1: four failed opens, then success.
#[tokio::test(start_paused = true)]
async fn open_failures_back_off_then_run() {
    let backend = Arc::new(ScriptedCapture::new(Duration::from_millis(100)).failing(4));
    let config = SupervisorConfig {
        backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(4)),
        ..supervisor_config()
    };
    let mut supervisor = StreamSupervisor::new(&camera("gate"), backend.clone(), config);
    let mut state = supervisor.watch_state();
    supervisor.start();

    tokio::time::timeout(Duration::from_secs(60), state.wait_for(|s| *s == StreamState::Running))
        .await
        .expect("stream never reached running")
        .unwrap();

    let opens = backend.open_times();
    assert_eq!(opens.len(), 5);
    let gaps: Vec<Duration> = opens.windows(2).map(|w| w[1] - w[0]).collect();
    let expected = [1, 2, 4, 4].map(Duration::from_secs);
    for (gap, want) in gaps.iter().zip(expected) {
        assert!(*gap >= want && *gap < want + Duration::from_millis(50), "gap {gap:?}, expected {want:?}");
    }

    let status = supervisor.status();
    assert_eq!(status.state, StreamState::Running);
    assert_eq!(status.reconnects, 4);
    assert!(status.last_error.unwrap().contains("connection refused"));

    assert!(supervisor.stop().await);
    assert_eq!(supervisor.state(), StreamState::Stopped);
    // Idempotent
    assert!(supervisor.stop().await);
}

/// Test 2: subscriber never reads while 100 frames are published.
#[tokio::test(start_paused = true)]
async fn slow_subscriber_is_bounded_and_ordered() {
    let backend = Arc::new(ScriptedCapture::new(Duration::from_millis(10)));
    let config = SupervisorConfig {
        queue_capacity: 4,
        ..supervisor_config()
    };
    let mut supervisor = StreamSupervisor::new(&camera("yard"), backend, config);
    let hub = supervisor.hub().clone();
    assert!(hub.latest().is_none());
    let mut sub = hub.subscribe();
    supervisor.start();

    common::wait_for("100 frames", Duration::from_secs(10), || {
        hub.stats().frames_published >= 100
    })
    .await;
    supervisor.stop().await;

    assert!(sub.pending() <= 4);
    assert!(sub.dropped() >= 96);
    let latest = hub.latest().unwrap().sequence;

    let mut seen = Vec::new();
    while let Some(frame) = sub.try_recv() {
        seen.push(frame.sequence);
    }
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "out of order: {seen:?}");
    assert_eq!(*seen.last().unwrap(), latest);
}

// ========== Segmenter ==========

/// Test 3: 200ms segments, each registered with its on-disk size.
#[tokio::test]
async fn continuous_recording_registers_segments() {
    let dir = tempfile::tempdir().unwrap();
    let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::new());
    let camera = with_camera(catalog.as_ref(), "porch").await;

    let backend = Arc::new(ScriptedCapture::new(Duration::from_millis(20)));
    let mut supervisor = StreamSupervisor::new(&camera, backend, supervisor_config());
    let mut segmenter = Segmenter::start(
        &camera,
        segmenter_deps(&supervisor, catalog.clone()),
        segmenter_config(dir.path()),
    );
    supervisor.start();

    wait_for_recordings(catalog.as_ref(), 2, |_| true).await;
    assert!(segmenter.stop().await);
    supervisor.stop().await;

    let rows = recordings(catalog.as_ref()).await;
    assert!(rows.len() >= 2);
    for row in &rows {
        assert!(row.end_time > row.start_time);
        assert!(!row.event_based);
        assert!(row.file_path.starts_with(dir.path().join("porch")));
        let on_disk = std::fs::metadata(&row.file_path).unwrap().len();
        assert_eq!(row.file_size_bytes, on_disk);

        let header = read_header(&row.file_path).await.unwrap();
        assert!(header.frame_count > 0);
        assert_eq!(header.resolution, common::RES);
    }
    // Every file on disk is registered
    assert_eq!(segment_files(dir.path()).len(), rows.len());
    assert_eq!(segmenter.status().segments_registered, rows.len() as u64);
}

/// Test 4: the first two inserts fail, the third succeeds.
#[tokio::test]
async fn failed_insert_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = Arc::new(FlakyCatalog::new(2));
    let catalog: Arc<dyn Catalog> = flaky.clone();
    let camera = with_camera(catalog.as_ref(), "porch").await;

    let backend = Arc::new(ScriptedCapture::new(Duration::from_millis(20)));
    let mut supervisor = StreamSupervisor::new(&camera, backend, supervisor_config());
    let config = SegmenterConfig {
        continuous: false,
        ..segmenter_config(dir.path())
    };
    let mut segmenter = Segmenter::start(&camera, segmenter_deps(&supervisor, catalog.clone()), config);
    supervisor.start();

    let handle = segmenter.handle();
    assert!(handle.start_recording(false).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.stop_recording().await);

    let rows = wait_for_recordings(catalog.as_ref(), 1, |_| true).await;
    assert_eq!(flaky.recording_attempts(), 3);
    assert!(rows[0].file_path.exists());

    segmenter.stop().await;
    supervisor.stop().await;
}

/// Test 5: every insert fails; after the last attempt the file stays.
#[tokio::test]
async fn exhausted_insert_retries_keep_file() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = Arc::new(FlakyCatalog::new(u32::MAX));
    let catalog: Arc<dyn Catalog> = flaky.clone();
    let camera = with_camera(catalog.as_ref(), "porch").await;

    let backend = Arc::new(ScriptedCapture::new(Duration::from_millis(20)));
    let mut supervisor = StreamSupervisor::new(&camera, backend, supervisor_config());
    let config = SegmenterConfig {
        continuous: false,
        insert_retry_attempts: 3,
        ..segmenter_config(dir.path())
    };
    let mut segmenter = Segmenter::start(&camera, segmenter_deps(&supervisor, catalog.clone()), config);
    supervisor.start();

    let handle = segmenter.handle();
    handle.start_recording(false).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.stop_recording().await;

    common::wait_for("three insert attempts", Duration::from_secs(5), || {
        flaky.recording_attempts() >= 3
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(flaky.recording_attempts(), 3);
    let status = handle.status();
    assert_eq!(status.pending_inserts, 0);
    assert!(status.last_error.is_some());
    assert_eq!(segment_files(dir.path()).len(), 1);

    segmenter.stop().await;
    supervisor.stop().await;
}

// ========== Dispatcher ==========

/// Test 6: person passes, low-confidence car and unlisted dog are dropped.
#[tokio::test]
async fn detections_drive_events_and_event_recording() {
    let dir = tempfile::tempdir().unwrap();
    let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::new());
    let camera = with_camera(catalog.as_ref(), "porch").await;
    let sink = Arc::new(CollectingSink::default());
    let inference = Arc::new(StaticInference::new(vec![
        detection("person", 0.9),
        detection("car", 0.3),
        detection("dog", 0.95),
    ]));

    let backend = Arc::new(ScriptedCapture::new(Duration::from_millis(20)));
    let mut supervisor = StreamSupervisor::new(&camera, backend, supervisor_config());
    let mut segmenter = Segmenter::start(
        &camera,
        segmenter_deps(&supervisor, catalog.clone()),
        SegmenterConfig {
            continuous: false,
            max_segment: Duration::from_secs(60),
            ..segmenter_config(dir.path())
        },
    );
    let seg = segmenter.handle();
    let mut dispatcher = Dispatcher::start(
        &camera,
        DispatcherDeps {
            hub: supervisor.hub().clone(),
            inference: inference.clone(),
            catalog: catalog.clone(),
            sink: sink.clone(),
            segmenter: segmenter.handle(),
        },
        DispatcherConfig {
            classes: vec!["person".into(), "car".into()],
            confidence: 0.5,
            sample_interval: Duration::from_millis(25),
            suppression_window: Duration::from_secs(30),
            event_recording: true,
            quiet_period: Duration::from_millis(200),
            motion: None,
            ..Default::default()
        },
    );
    supervisor.start();

    common::wait_for("event-based recording", Duration::from_secs(5), || {
        let s = seg.status();
        s.recording && s.event_based
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Activity stops; the quiet period closes the segment the dispatcher opened
    inference.clear();
    let rows = wait_for_recordings(catalog.as_ref(), 1, |r| r.event_based).await;
    assert!(rows[0].end_time > rows[0].start_time);
    common::wait_for("segmenter disarmed", Duration::from_secs(5), || !seg.status().armed).await;

    dispatcher.stop().await;
    segmenter.stop().await;
    supervisor.stop().await;

    // One person event: later hits fall inside the suppression window
    let events = catalog.list_events(&EventFilter::default()).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::ObjectDetection);
    assert_eq!(events[0].label, "person");
    assert_eq!(events[0].payload.area, 50.0);
    assert_eq!(sink.events(), events);

    let status = dispatcher.status();
    assert_eq!(status.model, "static");
    assert_eq!(status.events_emitted, 1);
    assert!(status.suppressed > 0);
    assert!(status.samples > 1);
    assert!(!status.event_recording_active);
    assert!(inference.calls() > 1);
}

/// Test 7: every frame differs, so motion is continuous.
#[tokio::test]
async fn motion_emits_events_and_scores_segments() {
    let dir = tempfile::tempdir().unwrap();
    let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::new());
    let camera = with_camera(catalog.as_ref(), "drive").await;
    let sink = Arc::new(CollectingSink::default());

    let backend = Arc::new(ScriptedCapture::new(Duration::from_millis(20)).animated());
    let mut supervisor = StreamSupervisor::new(&camera, backend, supervisor_config());
    let mut segmenter = Segmenter::start(
        &camera,
        segmenter_deps(&supervisor, catalog.clone()),
        segmenter_config(dir.path()),
    );
    let mut dispatcher = Dispatcher::start(
        &camera,
        DispatcherDeps {
            hub: supervisor.hub().clone(),
            inference: Arc::new(StaticInference::new(Vec::new())),
            catalog: catalog.clone(),
            sink: sink.clone(),
            segmenter: segmenter.handle(),
        },
        DispatcherConfig {
            detection_enabled: false,
            sample_interval: Duration::from_millis(25),
            suppression_window: Duration::from_secs(30),
            motion: Some(MotionSettings {
                min_area: 100,
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    supervisor.start();

    let rows = wait_for_recordings(catalog.as_ref(), 1, |r| r.motion_score.is_some()).await;
    assert!(rows[0].motion_score.unwrap() > 0.02);

    dispatcher.stop().await;
    segmenter.stop().await;
    supervisor.stop().await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Motion);
    assert_eq!(events[0].label, MOTION_LABEL);
    assert!(events[0].payload.bbox.is_none());
    assert!(dispatcher.status().last_motion_score.is_some());
}

/// Test 8: a person in every frame, 300ms continuous segments, short suppression.
#[tokio::test]
async fn events_link_to_the_segment_open_at_the_time() {
    let dir = tempfile::tempdir().unwrap();
    let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::new());
    let camera = with_camera(catalog.as_ref(), "porch").await;

    let backend = Arc::new(ScriptedCapture::new(Duration::from_millis(20)));
    let mut supervisor = StreamSupervisor::new(&camera, backend, supervisor_config());
    let mut segmenter = Segmenter::start(
        &camera,
        segmenter_deps(&supervisor, catalog.clone()),
        SegmenterConfig {
            max_segment: Duration::from_millis(300),
            ..segmenter_config(dir.path())
        },
    );
    let mut dispatcher = Dispatcher::start(
        &camera,
        DispatcherDeps {
            hub: supervisor.hub().clone(),
            inference: Arc::new(StaticInference::new(vec![detection("person", 0.9)])),
            catalog: catalog.clone(),
            sink: Arc::new(CollectingSink::default()),
            segmenter: segmenter.handle(),
        },
        DispatcherConfig {
            classes: Vec::new(),
            sample_interval: Duration::from_millis(25),
            suppression_window: Duration::from_millis(100),
            motion: None,
            ..Default::default()
        },
    );
    supervisor.start();

    wait_for_recordings(catalog.as_ref(), 3, |_| true).await;
    dispatcher.stop().await;
    // Closes and registers the segment that is still open
    segmenter.stop().await;
    supervisor.stop().await;

    let rows = recordings(catalog.as_ref()).await;
    let events = catalog
        .list_events(&EventFilter {
            limit: Some(10_000),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(events.len() >= 3, "only {} events", events.len());

    let mut linked = 0;
    for event in &events {
        let containing = rows
            .iter()
            .find(|r| r.start_time <= event.start_time && event.end_time <= r.end_time);
        match event.recording_id {
            Some(id) => {
                let row = rows.iter().find(|r| r.id == id).expect("link to a missing recording");
                assert!(row.overlaps(event.start_time, event.end_time));
                linked += 1;
            }
            None => assert!(
                containing.is_none(),
                "event {} inside recording {} is unlinked",
                event.id,
                containing.map(|r| r.id.to_string()).unwrap_or_default()
            ),
        }
    }
    assert!(linked > 0);
}

/// Test 9: every capture session ends after 10 frames.
#[tokio::test]
async fn ended_stream_reconnects_and_closes_segments() {
    let dir = tempfile::tempdir().unwrap();
    let catalog: Arc<dyn Catalog> = Arc::new(MemoryCatalog::new());
    let camera = with_camera(catalog.as_ref(), "gate").await;

    let mut capture = ScriptedCapture::new(Duration::from_millis(20));
    capture.session_frames = Some(10);
    let backend = Arc::new(capture);
    let mut supervisor = StreamSupervisor::new(&camera, backend.clone(), supervisor_config());
    let mut segmenter = Segmenter::start(
        &camera,
        segmenter_deps(&supervisor, catalog.clone()),
        SegmenterConfig {
            // Long enough that only leaving Running can close a segment
            max_segment: Duration::from_secs(60),
            ..segmenter_config(dir.path())
        },
    );
    supervisor.start();

    let rows = wait_for_recordings(catalog.as_ref(), 2, |_| true).await;
    let mut state = supervisor.watch_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == StreamState::Running))
        .await
        .expect("stream never came back")
        .unwrap();

    let status = supervisor.status();
    assert!(status.reconnects > 0);
    assert!(backend.open_times().len() >= 2);
    for row in &rows {
        assert!(row.end_time > row.start_time);
        let header = read_header(&row.file_path).await.unwrap();
        assert!(header.frame_count > 0 && header.frame_count <= 10);
    }

    segmenter.stop().await;
    supervisor.stop().await;
}
