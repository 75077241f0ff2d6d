//! End-to-end tests against the real `medley-workerd` binary.
use std::path::PathBuf;
use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;

use medley_worker::config::WorkerConfig;
use medley_worker::error::MedleyError;
use medley_worker::protocol::{FailureKind, TaskPayload, TaskValue};
use medley_worker::service::WorkerService;

fn real_worker_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_worker_program(PathBuf::from(env!("CARGO_BIN_EXE_medley-workerd")))
        .with_spawn_timeout(Duration::from_secs(20))
}

const RSS: &[u8] = br#"<rss version="2.0"><channel>
<title>Daily Clips</title>
<item><title>Clip One</title>
<enclosure url="https://cdn.example.org/one.mp4" type="video/mp4"/></item>
<item><title>Clip Two</title><link>https://example.org/two</link></item>
</channel></rss>"#;

#[tokio::test]
async fn test_feed_parse_round_trip_through_real_worker() {
    let service = WorkerService::start(real_worker_config()).unwrap();

    let handle = service
        .submit(TaskPayload::FeedParse { html: RSS.to_vec() })
        .unwrap();
    match handle.wait().await.unwrap() {
        TaskValue::Feed(feed) => {
            assert_eq!(feed.title.as_deref(), Some("Daily Clips"));
            assert_eq!(feed.entries.len(), 2);
            assert_eq!(
                feed.entries[0].url.as_deref(),
                Some("https://cdn.example.org/one.mp4")
            );
        }
        other => panic!("expected feed value, got {:?}", other),
    }

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreadable_media_reports_handler_failure() {
    let service = WorkerService::start(real_worker_config()).unwrap();
    let covers = tempfile::tempdir().unwrap();

    let handle = service
        .submit(TaskPayload::TagExtract {
            source_path: PathBuf::from("/nonexistent/track.mp3"),
            cover_art_dir: covers.path().to_path_buf(),
        })
        .unwrap();
    match handle.wait().await {
        Err(MedleyError::Task(failure)) => {
            assert_eq!(failure.kind, FailureKind::Handler);
            assert!(failure.message.contains("cannot open media file"));
        }
        other => panic!("expected handler failure, got {:?}", other.map(|_| "value")),
    }

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_garbage_media_probe_fails_but_worker_survives() {
    let service = WorkerService::start(real_worker_config()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let garbage = dir.path().join("clip.mkv");
    std::fs::write(&garbage, b"not media at all").unwrap();

    let probe = service
        .submit(TaskPayload::MediaProbe {
            source_path: garbage,
            screenshot_dir: dir.path().to_path_buf(),
        })
        .unwrap();
    assert!(matches!(probe.wait().await, Err(MedleyError::Task(_))));

    // The worker survives the failed probe and keeps serving.
    let feed = service
        .submit(TaskPayload::FeedParse { html: RSS.to_vec() })
        .unwrap();
    assert!(feed.wait().await.is_ok());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_for_paths_is_accepted_end_to_end() {
    let service = WorkerService::start(real_worker_config()).unwrap();

    service.cancel_for_paths(["/music/gone.mp3"]).unwrap();
    // The cancel's reply is ignored; prove the channel is still healthy.
    let feed = service
        .submit(TaskPayload::FeedParse { html: RSS.to_vec() })
        .unwrap();
    assert!(feed.wait().await.is_ok());

    service.shutdown().await.unwrap();
}

#[test]
fn test_workerd_requires_a_socket_path() {
    Command::cargo_bin("medley-workerd")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("--socket-path"));
}

#[test]
fn test_workerd_help_mentions_its_role() {
    Command::cargo_bin("medley-workerd")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("worker process"));
}
