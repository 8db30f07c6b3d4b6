//! End-to-end scenarios: real workers polling a shared store.

use std::time::Duration;

use queuectl_core::{unix_now, DlqManager, JobState, Store, Worker, WorkerPool};

/// Tighten the polling/backoff knobs so scenarios finish quickly.
async fn fast_settings(store: &Store) {
    store.config_set("poll_interval_ms", "25").await.unwrap();
    store.config_set("base_backoff_seconds", "1").await.unwrap();
}

/// Poll `pred` until it holds or the deadline passes.
async fn wait_until<F, Fut>(what: &str, mut pred: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while tokio::time::Instant::now() < deadline {
        if pred().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn marker_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("queuectl-test-{}-{}", std::process::id(), name))
}

#[tokio::test]
async fn happy_path_completes_with_one_attempt() {
    let store = Store::in_memory().await.unwrap();
    fast_settings(&store).await;
    let id = store.enqueue("echo ok", None).await.unwrap();

    let worker = Worker::new(store.clone(), 0);
    let handle = tokio::spawn(async move { worker.run().await });

    wait_until("job completion", || {
        let store = store.clone();
        async move {
            store.get_job(id).await.unwrap().unwrap().state == JobState::Completed
        }
    })
    .await;

    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert!(job.claimed_by.is_none());

    store.request_stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker should observe the stop flag")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn failing_job_retries_until_marker_appears() {
    let store = Store::in_memory().await.unwrap();
    fast_settings(&store).await;

    // Fails until the marker file exists, then succeeds.
    let marker = marker_path("retry");
    let _ = std::fs::remove_file(&marker);
    let id = store
        .enqueue(&format!("test -f {}", marker.display()), Some(5))
        .await
        .unwrap();

    let worker = Worker::new(store.clone(), 0);
    let handle = tokio::spawn(async move { worker.run().await });

    // Let the first attempt fail, then unblock the job.
    wait_until("first failed attempt", || {
        let store = store.clone();
        async move { store.get_job(id).await.unwrap().unwrap().attempts >= 1 }
    })
    .await;
    assert_eq!(
        store.get_job(id).await.unwrap().unwrap().state,
        JobState::Pending
    );
    std::fs::write(&marker, b"").unwrap();

    wait_until("job completion after retry", || {
        let store = store.clone();
        async move {
            store.get_job(id).await.unwrap().unwrap().state == JobState::Completed
        }
    })
    .await;

    let job = store.get_job(id).await.unwrap().unwrap();
    assert!(job.attempts >= 2);
    let _ = std::fs::remove_file(&marker);

    store.request_stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn exhausted_retries_land_in_dlq() {
    let store = Store::in_memory().await.unwrap();
    fast_settings(&store).await;
    let id = store.enqueue("exit 1", Some(1)).await.unwrap();

    let worker = Worker::new(store.clone(), 0);
    let handle = tokio::spawn(async move { worker.run().await });

    wait_until("dead-letter transition", || {
        let store = store.clone();
        async move { store.get_job(id).await.unwrap().unwrap().state == JobState::Dlq }
    })
    .await;

    let job = store.get_job(id).await.unwrap().unwrap();
    // max_retries = 1 allows the initial run plus one retry.
    assert_eq!(job.attempts, 2);
    assert!(job.last_error.as_deref().unwrap().contains("rc=1"));

    store.request_stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn single_job_runs_exactly_once_across_pool() {
    let store = Store::in_memory().await.unwrap();
    fast_settings(&store).await;
    let id = store.enqueue("echo contended", None).await.unwrap();

    let pool = WorkerPool::new(store.clone(), 4);
    let handle = tokio::spawn(async move {
        pool.run_until(std::future::pending::<()>()).await.unwrap();
    });

    wait_until("job completion", || {
        let store = store.clone();
        async move {
            store.get_job(id).await.unwrap().unwrap().state == JobState::Completed
        }
    })
    .await;

    // Exactly one worker won the claim and executed it.
    assert_eq!(store.get_job(id).await.unwrap().unwrap().attempts, 1);

    store.request_stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("pool should drain after stop")
        .unwrap();
}

#[tokio::test]
async fn expired_lease_is_recovered_by_another_worker() {
    let store = Store::in_memory().await.unwrap();
    fast_settings(&store).await;
    let id = store.enqueue("echo recovered", None).await.unwrap();

    // A doomed claimer takes the job and never settles.
    let now = unix_now();
    store
        .claim_one("crashed-worker", now, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    let worker = Worker::new(store.clone(), 0);
    let handle = tokio::spawn(async move { worker.run().await });

    wait_until("recovery after lease expiry", || {
        let store = store.clone();
        async move {
            store.get_job(id).await.unwrap().unwrap().state == JobState::Completed
        }
    })
    .await;

    // The crashed attempt was never settled, so only the recovery counts.
    let job = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);

    // The dead claimer's settle is rejected outright.
    assert!(store.settle_success(id, "crashed-worker").await.is_err());

    store.request_stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn graceful_stop_finishes_in_flight_jobs() {
    let store = Store::in_memory().await.unwrap();
    fast_settings(&store).await;
    let a = store.enqueue("sleep 2", None).await.unwrap();
    let b = store.enqueue("sleep 2", None).await.unwrap();

    let pool = WorkerPool::new(store.clone(), 2);
    let handle = tokio::spawn(async move { pool.run_until(std::future::pending::<()>()).await });

    wait_until("both jobs claimed", || {
        let store = store.clone();
        async move {
            store.counts_by_state().await.unwrap().get("running").copied() == Some(2)
        }
    })
    .await;

    // Stop mid-execution: both jobs must still run to completion.
    store.request_stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("pool should drain after stop")
        .unwrap()
        .unwrap();

    for id in [a, b] {
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().state,
            JobState::Completed
        );
    }
    // Workers unregistered on the way out.
    assert_eq!(store.workers_count().await.unwrap(), 0);
}

#[tokio::test]
async fn dlq_retry_runs_the_job_again() {
    let store = Store::in_memory().await.unwrap();
    fast_settings(&store).await;

    // Dead on the first failure, succeeds once the marker exists.
    let marker = marker_path("dlq-retry");
    let _ = std::fs::remove_file(&marker);
    let id = store
        .enqueue(&format!("test -f {}", marker.display()), Some(0))
        .await
        .unwrap();

    let worker = Worker::new(store.clone(), 0);
    let handle = tokio::spawn(async move { worker.run().await });

    wait_until("dead-letter transition", || {
        let store = store.clone();
        async move { store.get_job(id).await.unwrap().unwrap().state == JobState::Dlq }
    })
    .await;

    std::fs::write(&marker, b"").unwrap();
    let dlq = DlqManager::new(store.clone());
    dlq.retry(id).await.unwrap();
    assert_eq!(
        store.get_job(id).await.unwrap().unwrap().attempts,
        0,
        "retry resets the attempt counter"
    );

    wait_until("completion after dlq retry", || {
        let store = store.clone();
        async move {
            store.get_job(id).await.unwrap().unwrap().state == JobState::Completed
        }
    })
    .await;
    assert_eq!(store.get_job(id).await.unwrap().unwrap().attempts, 1);
    let _ = std::fs::remove_file(&marker);

    store.request_stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
