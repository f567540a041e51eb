//! End-to-end tests for the download manager.

mod common;

use bridge_traits::network::{NetworkInfo, NetworkType};
use common::{fast_config, payload, wait_for, Failure, Harness, SERVER};
use core_download::settings::{KEY_AUTO_REMOVE_WATCHED, KEY_MAX_STORAGE_BYTES};
use core_download::store::Manifest;
use core_download::{
    AutoRemovePolicy, DownloadError, DownloadId, DownloadOptions, DownloadQuality,
    DownloadRecord, DownloadStatus, MediaItem, PauseOrigin,
};
use core_runtime::events::{CoreEvent, DownloadEvent, PlaybackEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn movie(id: &str) -> MediaItem {
    MediaItem::movie(id, format!("Movie {}", id)).unwrap()
}

fn status_is(id: DownloadId, status: DownloadStatus) -> impl Fn(&core_download::DownloadSnapshot) -> bool {
    move |snapshot| snapshot.get(&id).is_some_and(|r| r.status == status)
}

fn downloaded_at_least(id: DownloadId, bytes: u64) -> impl Fn(&core_download::DownloadSnapshot) -> bool {
    move |snapshot| {
        snapshot
            .get(&id)
            .is_some_and(|r| r.status == DownloadStatus::Downloading && r.downloaded_bytes >= bytes)
    }
}

#[tokio::test]
async fn test_download_completes_and_places_file() {
    let harness = Harness::new().await;
    let data = payload(50_000, 1);
    harness.publish("m1", data.clone(), true);
    let manager = harness.start().await;
    let mut events = harness.events.stream();

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let snapshot = wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;

    let record = snapshot.get(&id).unwrap();
    let expected_path = harness.server_dir().join("m1.mp4");
    assert_eq!(record.file_path.as_deref(), Some(expected_path.as_path()));
    assert_eq!(record.downloaded_bytes, 50_000);
    assert_eq!(record.total_bytes, Some(50_000));
    assert_eq!(std::fs::read(&expected_path).unwrap(), data);
    assert!(!harness.server_dir().join("m1.mp4.part").exists());

    assert!(manager.is_item_downloaded("m1"));
    assert_eq!(manager.get_local_path("m1"), Some(expected_path));
    assert_eq!(manager.storage_usage().await.used_bytes, 50_000);

    // Default quality asks the server for an 8 Mbit/s video ceiling.
    let requests = harness.media.requests();
    assert_eq!(requests[0].max_bitrate, Some(8_000_000));

    let mut kinds = Vec::new();
    while let Some(Ok(CoreEvent::Download(event))) = events.try_recv() {
        match event {
            DownloadEvent::Queued { .. } => kinds.push("queued"),
            DownloadEvent::Started { .. } => kinds.push("started"),
            DownloadEvent::Completed { bytes, .. } => {
                assert_eq!(bytes, 50_000);
                kinds.push("completed");
            }
            _ => {}
        }
    }
    assert_eq!(kinds, vec!["queued", "started", "completed"]);
}

#[tokio::test]
async fn test_start_download_is_idempotent() {
    let harness = Harness::new().await;
    harness.publish("m1", payload(4_000, 2), true);
    let manager = harness.start().await;

    let first = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let second = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(first, second);

    wait_for(&manager, "completion", status_is(first, DownloadStatus::Completed)).await;
    let third = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(first, third);

    assert_eq!(manager.list_downloads().len(), 1);
    assert_eq!(harness.http.requests_for("m1").len(), 1);
}

#[tokio::test]
async fn test_quality_option_overrides_setting() {
    let harness = Harness::new().await;
    harness.publish("a1", payload(2_000, 3), true);
    let manager = harness.start().await;

    let item = MediaItem::audio("a1", "Track").unwrap();
    let id = manager
        .start_download(
            item,
            SERVER,
            DownloadOptions::default()
                .with_quality(DownloadQuality::Low)
                .with_tracks(Some(1), None),
        )
        .await
        .unwrap();
    wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;

    let request = &harness.media.requests()[0];
    assert_eq!(request.max_bitrate, Some(128_000));
    assert_eq!(request.audio_track_index, Some(1));
    assert!(harness.server_dir().join("a1.mp3").exists());
}

#[tokio::test]
async fn test_pause_then_resume_produces_identical_file() {
    let harness = Harness::new().await;
    let data = payload(64 * 1024, 4);
    harness.publish("m1", data.clone(), true);
    let gate = harness.http.gate();
    let manager = harness.start().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    gate.add_permits(10);
    wait_for(&manager, "ten chunks", downloaded_at_least(id, 10 * 1024)).await;

    manager.pause_download(&id).await.unwrap();
    let record = manager.get_download(&id).unwrap();
    assert_eq!(record.status, DownloadStatus::Paused);
    assert_eq!(record.paused_by, Some(PauseOrigin::User));
    assert_eq!(record.downloaded_bytes, 10 * 1024);
    let partial = harness.server_dir().join("m1.mp4.part");
    assert_eq!(std::fs::metadata(&partial).unwrap().len(), 10 * 1024);

    // Pausing again is a no-op.
    manager.pause_download(&id).await.unwrap();

    harness.http.open_gate();
    manager.resume_download(&id).await.unwrap();
    wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;

    let bytes = std::fs::read(harness.server_dir().join("m1.mp4")).unwrap();
    assert_eq!(bytes, data);

    let requests = harness.http.requests_for("m1");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].range_from, None);
    assert_eq!(requests[1].range_from, Some(10 * 1024));
}

#[tokio::test]
async fn test_pausing_pending_record_is_rejected() {
    let harness = Harness::new().await;
    harness.publish("m1", payload(1_000, 5), true);
    let manager = harness.start().await;
    manager.pause_all_downloads().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let err = manager.pause_download(&id).await.unwrap_err();
    assert!(matches!(
        err,
        DownloadError::InvalidTransition {
            from: DownloadStatus::Pending,
            to: DownloadStatus::Paused,
            ..
        }
    ));
}

#[tokio::test]
async fn test_retry_only_applies_to_failed_records() {
    let harness = Harness::new().await;
    harness.publish("m1", payload(1_000, 6), true);
    let manager = harness.start().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;

    let err = manager.retry_download(&id).await.unwrap_err();
    assert!(matches!(
        err,
        DownloadError::InvalidTransition {
            from: DownloadStatus::Completed,
            to: DownloadStatus::Pending,
            ..
        }
    ));
    assert!(harness.server_dir().join("m1.mp4").exists());
}

#[tokio::test]
async fn test_batch_never_exceeds_two_concurrent_transfers() {
    let harness = Harness::new().await;
    harness.http.set_chunk_delay(Duration::from_millis(5));
    let items: Vec<MediaItem> = (0..10)
        .map(|i| {
            let id = format!("e{}", i);
            harness.publish(&id, payload(8 * 1024, i as u8), true);
            MediaItem::episode(&id, format!("Episode {}", i), "series-1", Some(1), Some(i + 1))
                .unwrap()
        })
        .collect();
    let manager = harness.start().await;

    let outcome = manager
        .start_batch_download(items, SERVER, DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.enqueued_count(), 10);
    assert_eq!(outcome.skipped_count(), 0);
    let group = outcome.group_id.unwrap();

    let peak = Arc::new(AtomicUsize::new(0));
    let observed = peak.clone();
    let snapshot = wait_for(&manager, "batch completion", move |snapshot| {
        observed.fetch_max(snapshot.active().len(), Ordering::SeqCst);
        snapshot.completed().len() == 10
    })
    .await;

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(harness.http.peak_concurrent_bodies() <= 2);

    // List order is creation order, which is batch order.
    let order: Vec<&str> = snapshot.records.iter().map(|r| r.item_id.as_str()).collect();
    let expected: Vec<String> = (0..10).map(|i| format!("e{}", i)).collect();
    assert_eq!(order, expected.iter().map(String::as_str).collect::<Vec<_>>());
    assert_eq!(snapshot.in_group(&group).len(), 10);
    assert_eq!(outcome.enqueued, snapshot.records.iter().map(|r| r.id).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_batch_skips_duplicates_and_invalid_items() {
    let harness = Harness::new().await;
    harness.publish("t1", payload(1_000, 6), true);
    harness.publish("t2", payload(1_000, 7), true);
    let manager = harness.start().await;

    let existing = manager
        .start_download(MediaItem::audio("t1", "One").unwrap(), SERVER, DownloadOptions::default())
        .await
        .unwrap();

    let mut invalid = MediaItem::audio("t3", "Three").unwrap();
    invalid.name = String::new();
    let items = vec![
        MediaItem::audio("t1", "One").unwrap(),
        MediaItem::audio("t2", "Two").unwrap(),
        MediaItem::audio("t2", "Two again").unwrap(),
        invalid,
    ];
    let outcome = manager
        .start_batch_download(items, SERVER, DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.enqueued_count(), 1);
    assert_eq!(outcome.skipped_count(), 3);
    assert!(matches!(
        &outcome.skipped[0],
        (item, DownloadError::AlreadyDownloaded(id)) if item == "t1" && *id == existing.to_string()
    ));
    assert!(matches!(&outcome.skipped[1], (item, DownloadError::AlreadyDownloaded(_)) if item == "t2"));
    assert!(matches!(&outcome.skipped[2], (item, DownloadError::InvalidItem(_)) if item == "t3"));
}

#[tokio::test]
async fn test_clear_all_drops_records_and_files() {
    let harness = Harness::new().await;
    harness.publish("m1", payload(3_000, 8), true);
    harness.publish("m2", payload(64 * 1024, 9), true);
    let manager = harness.start().await;

    let done = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    wait_for(&manager, "first completion", status_is(done, DownloadStatus::Completed)).await;

    let gate = harness.http.gate();
    let running = manager
        .start_download(movie("m2"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    gate.add_permits(2);
    wait_for(&manager, "second transfer", downloaded_at_least(running, 2 * 1024)).await;

    let removed = manager.clear_all_downloads().await.unwrap();
    assert_eq!(removed, 2);

    let snapshot = manager.snapshot();
    assert!(snapshot.records.is_empty());
    assert_eq!(snapshot.used_bytes, 0);
    assert_eq!(manager.storage_usage().await.used_bytes, 0);
    assert_eq!(manager.active_download_count(), 0);
    assert_eq!(std::fs::read_dir(harness.download_dir()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_resume_all_leaves_individual_pauses_alone() {
    let harness = Harness::new().await;
    for id in ["a", "b", "c"] {
        harness.publish(id, payload(16 * 1024, 10), true);
    }
    let gate = harness.http.gate();
    let manager = harness.start().await;

    let a = manager
        .start_download(movie("a"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let b = manager
        .start_download(movie("b"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let c = manager
        .start_download(movie("c"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    wait_for(&manager, "a and b running", |s| {
        status_is(a, DownloadStatus::Downloading)(s) && status_is(b, DownloadStatus::Downloading)(s)
    })
    .await;

    manager.pause_download(&a).await.unwrap();
    wait_for(&manager, "c admitted", status_is(c, DownloadStatus::Downloading)).await;

    let mut paused = manager.pause_all_downloads().await;
    paused.sort();
    let mut expected = vec![b, c];
    expected.sort();
    assert_eq!(paused, expected);
    assert!(manager.is_globally_paused());
    for id in [b, c] {
        let record = manager.get_download(&id).unwrap();
        assert_eq!(record.status, DownloadStatus::Paused);
        assert_eq!(record.paused_by, Some(PauseOrigin::Global));
    }

    let mut resumed = manager.resume_all_downloads().await;
    resumed.sort();
    assert_eq!(resumed, expected);

    harness.http.open_gate();
    wait_for(&manager, "b and c completion", |s| {
        status_is(b, DownloadStatus::Completed)(s) && status_is(c, DownloadStatus::Completed)(s)
    })
    .await;

    let a_record = manager.get_download(&a).unwrap();
    assert_eq!(a_record.status, DownloadStatus::Paused);
    assert_eq!(a_record.paused_by, Some(PauseOrigin::User));

    manager.resume_download(&a).await.unwrap();
    wait_for(&manager, "a completion", status_is(a, DownloadStatus::Completed)).await;
}

#[tokio::test]
async fn test_quota_rejects_then_admits_after_raise() {
    let harness = Harness::new().await;
    harness.set_i64(KEY_MAX_STORAGE_BYTES, 700).await;
    harness.publish("a", payload(500, 11), true);
    harness.publish("b", payload(300, 12), true);
    let manager = harness.start().await;

    let a = manager
        .start_download(movie("a").with_size_hint(500), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    wait_for(&manager, "a completion", status_is(a, DownloadStatus::Completed)).await;

    let err = manager
        .start_download(movie("b").with_size_hint(300), SERVER, DownloadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DownloadError::StorageFull {
            required: 300,
            available: 200
        }
    ));
    assert!(manager.get_download_by_item_id("b").is_none());

    manager.set_max_storage(1_000).await.unwrap();
    let b = manager
        .start_download(movie("b").with_size_hint(300), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    wait_for(&manager, "b completion", status_is(b, DownloadStatus::Completed)).await;

    let usage = manager.storage_usage().await;
    assert_eq!(usage.used_bytes, 800);
    assert_eq!(usage.max_bytes, 1_000);
    assert_eq!(usage.remaining_bytes, 200);
}

#[tokio::test]
async fn test_real_size_over_quota_fails_transfer() {
    let harness = Harness::new().await;
    harness.set_i64(KEY_MAX_STORAGE_BYTES, 1_000).await;
    harness.publish("big", payload(5_000, 13), true);
    let manager = harness.start().await;

    // The hint fits; the size the server reports does not.
    let id = manager
        .start_download(movie("big").with_size_hint(100), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let snapshot = wait_for(&manager, "failure", status_is(id, DownloadStatus::Failed)).await;

    let record = snapshot.get(&id).unwrap();
    assert!(record.last_error.as_deref().unwrap().contains("Storage full"));
    assert_eq!(record.retry_count, 0);
    assert!(harness.http.requests_for("big").is_empty());
}

#[tokio::test]
async fn test_recalculate_fails_missing_files_and_drops_orphans() {
    let harness = Harness::new().await;
    harness.publish("m1", payload(2_000, 14), true);
    harness.publish("m2", payload(3_000, 15), true);
    let manager = harness.start().await;

    let gone = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let kept = manager
        .start_download(movie("m2"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    wait_for(&manager, "both complete", |s| s.completed().len() == 2).await;
    assert_eq!(manager.storage_usage().await.used_bytes, 5_000);

    std::fs::remove_file(harness.server_dir().join("m1.mp4")).unwrap();
    let stray = harness.server_dir().join("stray.bin");
    std::fs::write(&stray, b"leftover").unwrap();

    let report = manager.recalculate_used_storage().await.unwrap();
    assert_eq!(report.missing_files, 1);
    assert_eq!(report.orphans_deleted, 1);
    assert_eq!(report.used_bytes, 3_000);
    assert!(!stray.exists());

    let record = manager.get_download(&gone).unwrap();
    assert_eq!(record.status, DownloadStatus::Failed);
    assert_eq!(record.last_error.as_deref(), Some("file missing"));
    assert_eq!(
        manager.get_download(&kept).unwrap().status,
        DownloadStatus::Completed
    );
    assert_eq!(manager.storage_usage().await.used_bytes, 3_000);
    assert!(!manager.is_item_downloaded("m1"));
}

#[tokio::test]
async fn test_wifi_only_waits_for_wifi() {
    let harness = Harness::new()
        .await
        .with_network(NetworkInfo::connected(NetworkType::Cellular));
    harness.publish("w", payload(2_000, 16), true);
    harness.publish("any", payload(2_000, 17), true);
    let manager = harness.start().await;

    let waiting = manager
        .start_download(movie("w"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let allowed = manager
        .start_download(
            movie("any"),
            SERVER,
            DownloadOptions::default().with_wifi_only(false),
        )
        .await
        .unwrap();

    wait_for(&manager, "cellular-allowed completion", status_is(allowed, DownloadStatus::Completed)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        manager.get_download(&waiting).unwrap().status,
        DownloadStatus::Pending
    );
    assert!(harness.http.requests_for("w").is_empty());

    harness
        .network
        .as_ref()
        .unwrap()
        .set(NetworkInfo::connected(NetworkType::WiFi));
    wait_for(&manager, "wifi completion", status_is(waiting, DownloadStatus::Completed)).await;
}

#[tokio::test]
async fn test_losing_wifi_pauses_and_regaining_resumes() {
    let harness = Harness::new()
        .await
        .with_network(NetworkInfo::connected(NetworkType::WiFi));
    let data = payload(32 * 1024, 18);
    harness.publish("m1", data.clone(), true);
    let gate = harness.http.gate();
    let manager = harness.start().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    gate.add_permits(4);
    wait_for(&manager, "four chunks", downloaded_at_least(id, 4 * 1024)).await;

    let network = harness.network.as_ref().unwrap();
    network.set(NetworkInfo::connected(NetworkType::Cellular));
    let snapshot = wait_for(&manager, "network pause", status_is(id, DownloadStatus::Paused)).await;
    assert_eq!(snapshot.get(&id).unwrap().paused_by, Some(PauseOrigin::Network));

    harness.http.open_gate();
    network.set(NetworkInfo::connected(NetworkType::WiFi));
    wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;

    assert_eq!(std::fs::read(harness.server_dir().join("m1.mp4")).unwrap(), data);
    assert_eq!(harness.http.requests_for("m1")[1].range_from, Some(4 * 1024));
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let harness = Harness::new().await;
    let data = payload(6_000, 19);
    harness.publish("m1", data.clone(), true);
    harness.http.fail_next("m1", Failure::Status(503));
    harness.http.fail_next("m1", Failure::Connection);
    let manager = harness.start().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let snapshot = wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;

    let record = snapshot.get(&id).unwrap();
    assert_eq!(record.retry_count, 2);
    assert_eq!(record.last_error, None);
    assert_eq!(harness.http.requests_for("m1").len(), 3);
    assert_eq!(std::fs::read(harness.server_dir().join("m1.mp4")).unwrap(), data);
}

#[tokio::test]
async fn test_broken_stream_resumes_from_partial() {
    let harness = Harness::new().await;
    let data = payload(10 * 1024, 20);
    harness.publish("m1", data.clone(), true);
    harness.http.fail_next("m1", Failure::CutAfter(3 * 1024));
    let manager = harness.start().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;

    let requests = harness.http.requests_for("m1");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].range_from, Some(3 * 1024));
    assert_eq!(std::fs::read(harness.server_dir().join("m1.mp4")).unwrap(), data);
}

#[tokio::test]
async fn test_not_found_fails_without_retry_and_can_be_retried() {
    let harness = Harness::new().await;
    harness.publish("m1", payload(2_000, 21), true);
    harness.http.fail_next("m1", Failure::Status(404));
    let manager = harness.start().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let snapshot = wait_for(&manager, "failure", status_is(id, DownloadStatus::Failed)).await;

    let record = snapshot.get(&id).unwrap();
    assert_eq!(record.retry_count, 0);
    assert!(record.last_error.as_deref().unwrap().contains("Not found"));
    assert_eq!(harness.http.requests_for("m1").len(), 1);
    assert!(!harness.server_dir().join("m1.mp4.part").exists());

    manager.retry_download(&id).await.unwrap();
    let snapshot = wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;
    assert_eq!(snapshot.get(&id).unwrap().last_error, None);
}

#[tokio::test]
async fn test_retries_exhausted_marks_failed() {
    let harness = Harness::new().await;
    harness.publish("m1", payload(2_000, 22), true);
    for _ in 0..4 {
        harness.http.fail_next("m1", Failure::Connection);
    }
    let manager = harness.start().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let snapshot = wait_for(&manager, "failure", status_is(id, DownloadStatus::Failed)).await;

    let record = snapshot.get(&id).unwrap();
    assert_eq!(record.retry_count, 3);
    assert!(record.last_error.as_deref().unwrap().contains("connection reset"));
    assert_eq!(harness.http.requests_for("m1").len(), 4);

    // Starting the same item again retries it.
    let again = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(again, id);
    wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;
}

#[tokio::test]
async fn test_unsupported_source_fails() {
    let harness = Harness::new().await;
    harness.media.add_unsupported("m1");
    let manager = harness.start().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let snapshot = wait_for(&manager, "failure", status_is(id, DownloadStatus::Failed)).await;
    assert!(snapshot
        .get(&id)
        .unwrap()
        .last_error
        .as_deref()
        .unwrap()
        .contains("Unsupported format"));
}

/// Pause after eight chunks and resume on a degraded source. Checks the
/// final file and that progress never went backwards while downloading;
/// returns the range offsets the server saw.
async fn pause_and_resume_degraded(supports_range: bool, ignore_range: bool) -> Vec<Option<u64>> {
    let harness = Harness::new().await;
    let data = payload(24 * 1024, 23);
    harness.publish("m1", data.clone(), supports_range);
    let gate = harness.http.gate();
    let manager = harness.start().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    gate.add_permits(8);
    wait_for(&manager, "eight chunks", downloaded_at_least(id, 8 * 1024)).await;
    manager.pause_download(&id).await.unwrap();

    let mut rx = manager.subscribe();
    let watcher = tokio::spawn(async move {
        let mut seen = Vec::new();
        loop {
            let (status, bytes) = {
                let snapshot = rx.borrow_and_update();
                let record = snapshot.get(&id).unwrap();
                (record.status, record.downloaded_bytes)
            };
            if status == DownloadStatus::Downloading {
                seen.push(bytes);
            }
            if status == DownloadStatus::Completed || rx.changed().await.is_err() {
                return seen;
            }
        }
    });

    harness.http.ignore_range(ignore_range);
    harness.http.set_chunk_delay(Duration::from_millis(1));
    harness.http.open_gate();
    manager.resume_download(&id).await.unwrap();
    wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;

    let seen = watcher.await.unwrap();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", seen);
    assert!(seen.iter().all(|b| *b >= 8 * 1024));
    assert_eq!(std::fs::read(harness.server_dir().join("m1.mp4")).unwrap(), data);

    harness
        .http
        .requests_for("m1")
        .iter()
        .map(|r| r.range_from)
        .collect()
}

#[tokio::test]
async fn test_resume_without_range_support_restarts_from_zero() {
    let ranges = pause_and_resume_degraded(false, false).await;
    assert_eq!(ranges, vec![None, None]);
}

#[tokio::test]
async fn test_server_ignoring_range_restarts_from_zero() {
    let ranges = pause_and_resume_degraded(true, true).await;
    assert_eq!(ranges, vec![None, Some(8 * 1024)]);
}

#[tokio::test]
async fn test_interrupted_transfer_resumes_after_restart() {
    let harness = Harness::new().await;
    let data = payload(12 * 1024, 24);
    harness.publish("m1", data.clone(), true);

    // State a crash mid-transfer leaves behind.
    let mut record = DownloadRecord::new(
        movie("m1").with_size_hint(data.len() as u64),
        SERVER,
        DownloadQuality::High,
        chrono::Utc::now(),
    );
    record.status = DownloadStatus::Downloading;
    record.downloaded_bytes = 4 * 1024;
    record.total_bytes = Some(data.len() as u64);
    let id = record.id;
    std::fs::create_dir_all(harness.server_dir()).unwrap();
    let manifest = Manifest {
        version: 1,
        records: vec![record],
    };
    std::fs::write(
        harness.server_dir().join("manifest.json"),
        serde_json::to_vec(&manifest).unwrap(),
    )
    .unwrap();
    std::fs::write(harness.server_dir().join("m1.mp4.part"), &data[..4 * 1024]).unwrap();
    std::fs::write(harness.server_dir().join("leftover.tmp"), b"junk").unwrap();

    let manager = harness.start().await;
    wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;

    assert_eq!(std::fs::read(harness.server_dir().join("m1.mp4")).unwrap(), data);
    assert_eq!(harness.http.requests_for("m1")[0].range_from, Some(4 * 1024));
    assert!(!harness.server_dir().join("leftover.tmp").exists());

    let persisted: Manifest =
        serde_json::from_slice(&std::fs::read(harness.server_dir().join("manifest.json")).unwrap())
            .unwrap();
    assert_eq!(persisted.records[0].status, DownloadStatus::Completed);
}

#[tokio::test]
async fn test_shutdown_pauses_and_next_start_resumes() {
    let harness = Harness::new().await;
    let data = payload(16 * 1024, 25);
    harness.publish("m1", data.clone(), true);
    let gate = harness.http.gate();
    let manager = harness.start().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    gate.add_permits(3);
    wait_for(&manager, "three chunks", downloaded_at_least(id, 3 * 1024)).await;

    manager.shutdown().await;
    let record = manager.get_download(&id).unwrap();
    assert_eq!(record.status, DownloadStatus::Paused);
    assert_eq!(record.paused_by, Some(PauseOrigin::Lifecycle));
    drop(manager);

    harness.http.open_gate();
    let manager = harness.start().await;
    wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;
    assert_eq!(std::fs::read(harness.server_dir().join("m1.mp4")).unwrap(), data);
}

#[tokio::test]
async fn test_suspend_holds_queue_until_restore() {
    let harness = Harness::new().await;
    harness.publish("m1", payload(8 * 1024, 26), true);
    harness.publish("m2", payload(2_000, 27), true);
    let gate = harness.http.gate();
    let manager = harness.start().await;

    let first = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    gate.add_permits(1);
    wait_for(&manager, "first chunk", downloaded_at_least(first, 1024)).await;

    assert_eq!(manager.suspend().await, vec![first]);
    let second = manager
        .start_download(movie("m2"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        manager.get_download(&second).unwrap().status,
        DownloadStatus::Pending
    );

    harness.http.open_gate();
    assert_eq!(manager.restore().await, vec![first]);
    wait_for(&manager, "both complete", |s| s.completed().len() == 2).await;
}

#[tokio::test]
async fn test_delete_in_flight_download() {
    let harness = Harness::new().await;
    harness.publish("m1", payload(16 * 1024, 28), true);
    let gate = harness.http.gate();
    let manager = harness.start().await;
    let mut events = harness.events.stream();

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    gate.add_permits(2);
    wait_for(&manager, "two chunks", downloaded_at_least(id, 2 * 1024)).await;

    manager.cancel_download(&id).await.unwrap();
    assert!(manager.get_download(&id).is_none());
    assert!(!harness.server_dir().join("m1.mp4.part").exists());
    assert_eq!(manager.active_download_count(), 0);

    let mut removed = false;
    while let Some(Ok(event)) = events.try_recv() {
        if let CoreEvent::Download(DownloadEvent::Removed { download_id, .. }) = event {
            assert_eq!(download_id, id.to_string());
            removed = true;
        }
    }
    assert!(removed);

    assert!(matches!(
        manager.delete_download(&id).await,
        Err(DownloadError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_auto_remove_deletes_watched_download() {
    let harness = Harness::new().await;
    harness.set_bool(KEY_AUTO_REMOVE_WATCHED, true).await;
    harness.publish("m1", payload(2_000, 29), true);
    let manager = harness.start().await;
    AutoRemovePolicy::new(manager.clone()).spawn();

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;

    harness
        .events
        .emit(CoreEvent::Playback(PlaybackEvent::Finished {
            item_id: "m1".to_string(),
            server_id: Some(SERVER.to_string()),
        }))
        .unwrap();
    wait_for(&manager, "removal", |s| s.records.is_empty()).await;
    assert!(!harness.server_dir().join("m1.mp4").exists());
    assert_eq!(manager.storage_usage().await.used_bytes, 0);
}

#[tokio::test]
async fn test_watched_downloads_are_flagged_then_swept() {
    let harness = Harness::new().await;
    harness.publish("m1", payload(2_000, 30), true);
    harness.publish("m2", payload(2_000, 31), true);
    let manager = harness.start().await;
    AutoRemovePolicy::new(manager.clone()).spawn();

    for item in ["m1", "m2"] {
        manager
            .start_download(movie(item), SERVER, DownloadOptions::default())
            .await
            .unwrap();
    }
    wait_for(&manager, "both complete", |s| s.completed().len() == 2).await;

    harness
        .events
        .emit(CoreEvent::Playback(PlaybackEvent::Finished {
            item_id: "m1".to_string(),
            server_id: None,
        }))
        .unwrap();
    wait_for(&manager, "played flag", |s| {
        s.find_by_item("m1").is_some_and(|r| r.item.played)
    })
    .await;
    assert_eq!(manager.list_downloads().len(), 2);

    assert_eq!(manager.remove_watched_downloads().await.unwrap(), 1);
    assert!(!manager.is_item_downloaded("m1"));
    assert!(manager.is_item_downloaded("m2"));
}

#[tokio::test]
async fn test_ids_that_sanitise_alike_keep_separate_files() {
    let harness = Harness::new().await;
    let dotted = payload(40_000, 40);
    let underscored = payload(40_000, 41);
    harness.publish("ep.1", dotted.clone(), true);
    harness.publish("ep_1", underscored.clone(), true);
    let manager = harness.start().await;

    let a = manager
        .start_download(movie("ep.1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    wait_for(&manager, "first completion", status_is(a, DownloadStatus::Completed)).await;
    let b = manager
        .start_download(movie("ep_1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    wait_for(&manager, "second completion", status_is(b, DownloadStatus::Completed)).await;

    let path_a = manager.get_download(&a).unwrap().file_path.unwrap();
    let path_b = manager.get_download(&b).unwrap().file_path.unwrap();
    assert_ne!(path_a, path_b);
    assert_eq!(std::fs::read(&path_a).unwrap(), dotted);
    assert_eq!(std::fs::read(&path_b).unwrap(), underscored);

    let report = manager.recalculate_used_storage().await.unwrap();
    assert_eq!(report.used_bytes, 80_000);
    assert_eq!(report.missing_files, 0);

    manager.delete_download(&b).await.unwrap();
    assert!(path_a.exists());
    assert!(!path_b.exists());

    let report = manager.recalculate_used_storage().await.unwrap();
    assert_eq!(report.used_bytes, 40_000);
    assert_eq!(manager.get_download(&a).unwrap().status, DownloadStatus::Completed);
}

#[tokio::test]
async fn test_failed_manifest_write_commits_nothing() {
    let harness = Harness::new().await;
    harness.publish("m1", payload(4_000, 30), true);
    harness.publish("m2", payload(4_000, 31), true);
    let manager = harness.start().await;
    manager.pause_all_downloads().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let blocker = harness.server_dir().join("manifest.json.tmp");
    std::fs::create_dir(&blocker).unwrap();

    assert!(manager
        .start_download(movie("m2"), SERVER, DownloadOptions::default())
        .await
        .is_err());
    assert!(manager.get_download_by_item_id("m2").is_none());

    // Admission cannot persist the status flip, so nothing starts.
    manager.resume_all_downloads().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.get_download(&id).unwrap().status, DownloadStatus::Pending);
    assert_eq!(manager.active_download_count(), 0);
    assert!(harness.http.requests_for("m1").is_empty());

    std::fs::remove_dir(&blocker).unwrap();
    manager.pause_all_downloads().await;
    manager.resume_all_downloads().await;
    wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;
}

#[tokio::test]
async fn test_stalled_media_source_times_out() {
    let harness =
        Harness::with_config(fast_config().with_read_timeout(Duration::from_millis(100))).await;
    harness.publish("m1", payload(2_000, 50), true);
    harness.media.stall("m1");
    let manager = harness.start().await;

    let id = manager
        .start_download(movie("m1"), SERVER, DownloadOptions::default())
        .await
        .unwrap();
    let snapshot = wait_for(&manager, "failure", status_is(id, DownloadStatus::Failed)).await;

    let record = snapshot.get(&id).unwrap();
    assert_eq!(record.retry_count, 3);
    assert!(record.last_error.as_deref().unwrap().contains("timed out"));
    assert_eq!(harness.media.requests().len(), 4);
    assert!(harness.http.requests_for("m1").is_empty());

    harness.media.unstall("m1");
    manager.retry_download(&id).await.unwrap();
    wait_for(&manager, "completion", status_is(id, DownloadStatus::Completed)).await;
}
