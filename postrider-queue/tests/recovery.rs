//! Startup behavior: reloading surviving triples, cleaning fragments and
//! honoring the post-init clamp.

use std::{sync::Arc, time::Duration};

use postrider_common::{BodyBuffer, Header, MsgMetadata, testing::TestTarget};
use postrider_queue::{Queue, QueueConfig};
use postrider_spool::{DiskStore, QueueMetadata};

fn recovery_config(location: &std::path::Path) -> QueueConfig {
    let mut config = QueueConfig::new(location);
    config.max_tries = 3;
    config.workers = 2;
    config.hostname = "mx.example.net".to_string();
    config.initial_retry_secs = 0;
    config.post_init_delay_secs = 0;
    config
}

/// Put a complete triple on disk the way a previous queue instance would
/// have left it.
async fn seed_message(dir: &std::path::Path, id: &str, tries_count: u32) {
    let store = DiskStore::open(dir).await.expect("store");
    let mut meta = QueueMetadata::new(MsgMetadata::new(id), "sender@example.com", false);
    meta.to = vec!["rcpt@example.org".to_string()];
    meta.tries_count = tries_count;
    meta.last_attempt = chrono::Utc::now() - chrono::Duration::hours(1);

    let mut header = Header::new();
    header.append("Subject", "left over");
    store
        .store_new_message(&meta, &header, &BodyBuffer::from(b"survivor".as_slice()))
        .await
        .expect("seed");
}

#[tokio::test]
async fn recovered_message_is_delivered() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_message(dir.path(), "survivor", 1).await;

    let target = TestTarget::new();
    let queue = Queue::new(recovery_config(dir.path()), Arc::new(target.clone()), None)
        .await
        .expect("queue");

    target
        .wait_for_count(1, Duration::from_secs(5))
        .await
        .expect("recovered delivery");
    let messages = target.messages();
    assert_eq!(messages[0].mail_from, "sender@example.com");
    assert_eq!(messages[0].rcpt_to, vec!["rcpt@example.org"]);
    assert_eq!(messages[0].body, b"survivor");
    assert_eq!(messages[0].header.get("Subject"), Some("left over"));

    queue.close().await;
    // Delivered successfully, so nothing survives on disk.
    assert!(!dir.path().join("survivor.meta").exists());
}

#[tokio::test]
async fn fragments_are_cleaned_at_startup_and_not_delivered() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed_message(dir.path(), "headless", 0).await;
    tokio::fs::remove_file(dir.path().join("headless.header"))
        .await
        .expect("remove header");

    let target = TestTarget::new();
    let queue = Queue::new(recovery_config(dir.path()), Arc::new(target.clone()), None)
        .await
        .expect("queue");

    // The two-of-three fragment is gone as soon as startup finishes.
    assert!(!dir.path().join("headless.meta").exists());
    assert!(!dir.path().join("headless.body").exists());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(target.messages().is_empty());
    queue.close().await;
}

#[tokio::test]
async fn orphans_without_metadata_are_left_alone() {
    let dir = tempfile::tempdir().expect("tempdir");
    tokio::fs::write(dir.path().join("stray.body"), b"???")
        .await
        .expect("write orphan");
    tokio::fs::write(dir.path().join("stray.header"), b"Subject: x\r\n")
        .await
        .expect("write orphan");

    let target = TestTarget::new();
    let queue = Queue::new(recovery_config(dir.path()), Arc::new(target.clone()), None)
        .await
        .expect("queue");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(target.messages().is_empty());
    assert!(dir.path().join("stray.body").exists());
    assert!(dir.path().join("stray.header").exists());
    queue.close().await;
}

#[tokio::test]
async fn post_init_delay_defers_recovered_deliveries() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Long overdue: without the clamp this would be dispatched immediately.
    seed_message(dir.path(), "clamped", 0).await;

    let mut config = recovery_config(dir.path());
    config.post_init_delay_secs = 2;

    let target = TestTarget::new();
    let queue = Queue::new(config, Arc::new(target.clone()), None)
        .await
        .expect("queue");

    assert!(
        target
            .wait_for_count(1, Duration::from_secs(1))
            .await
            .is_err(),
        "recovered message was dispatched before the post-init delay"
    );
    target
        .wait_for_count(1, Duration::from_secs(5))
        .await
        .expect("clamped delivery");

    queue.close().await;
}

#[tokio::test]
async fn recovered_schedule_follows_the_retry_formula() {
    let dir = tempfile::tempdir().expect("tempdir");
    // last_attempt is an hour old, but with a one-hour base delay and two
    // tries already done the next try is still far in the future.
    seed_message(dir.path(), "patient", 2).await;

    let mut config = recovery_config(dir.path());
    config.initial_retry_secs = 3600;

    let target = TestTarget::new();
    let queue = Queue::new(config, Arc::new(target.clone()), None)
        .await
        .expect("queue");

    assert!(
        target
            .wait_for_count(1, Duration::from_secs(2))
            .await
            .is_err(),
        "message was dispatched ahead of its computed deadline"
    );
    queue.close().await;
}
