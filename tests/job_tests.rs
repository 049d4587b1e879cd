//! Controller state machine tests against the call-recording mock store.


use std::sync::Arc;
use std::time::{Duration, Instant};

use cronlock::config::JobConfig;
use cronlock::executor::Executor;
use cronlock::lock::MockLeaseStore;
use cronlock::schedule::Schedule;
use cronlock::scheduler::Job;

use test_harness::job;

fn test_job(config: JobConfig, store: Arc<MockLeaseStore>) -> Arc<Job> {
    test_job_with_grace(config, store, Duration::ZERO)
}

fn test_job_with_grace(
    config: JobConfig,
    store: Arc<MockLeaseStore>,
    grace_period: Duration,
) -> Arc<Job> {
    let schedule = Schedule::parse(&config.schedule).expect("test schedule must parse");
    Arc::new(Job::new(
        config,
        schedule,
        store,
        Executor::new(),
        grace_period,
    ))
}

#[tokio::test]
async fn test_run_acquires_and_releases_lease() {
    let store = Arc::new(MockLeaseStore::new());
    let job = test_job(job("test-job", "* * * * *", "echo hello"), store.clone());

    job.run().await;

    let acquires = store.acquire_calls();
    assert_eq!(acquires.len(), 1);
    assert_eq!(acquires[0].0, "test-job");
    assert_eq!(store.release_calls(), vec!["test-job".to_string()]);
}

#[tokio::test]
async fn test_lease_ttl_policy() {
    // (timeout, lock_ttl, expected lease TTL)
    let cases = [
        (Some(30), Some(120), Duration::from_secs(120)),
        (Some(30), None, Duration::from_secs(90)),
        (None, None, Duration::from_secs(300)),
    ];

    for (timeout, lock_ttl, expected) in cases {
        let store = Arc::new(MockLeaseStore::new());
        let mut config = job("test-job", "* * * * *", "echo hello");
        config.timeout = timeout.map(Duration::from_secs);
        config.lock_ttl = lock_ttl.map(Duration::from_secs);

        test_job(config, store.clone()).run().await;

        let acquires = store.acquire_calls();
        assert_eq!(acquires.len(), 1);
        assert_eq!(
            acquires[0].1, expected,
            "timeout={timeout:?} lock_ttl={lock_ttl:?}"
        );
    }
}

#[tokio::test]
async fn test_run_skips_when_lease_held_elsewhere() {
    let store = Arc::new(MockLeaseStore::new());
    store.set_lease_held("test-job", true);

    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("executed");
    let job = test_job(
        job("test-job", "* * * * *", &format!("touch {}", marker.display())),
        store.clone(),
    );

    job.run().await;

    assert_eq!(store.acquire_calls().len(), 1);
    assert!(store.release_calls().is_empty(), "must not release a lease it does not hold");
    assert!(!marker.exists(), "must not execute without the lease");
}

#[tokio::test]
async fn test_run_skips_on_acquire_error() {
    let store = Arc::new(MockLeaseStore::new());
    store.fail_acquire();

    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("executed");
    let job = test_job(
        job("test-job", "* * * * *", &format!("touch {}", marker.display())),
        store.clone(),
    );

    job.clone().run().await;

    assert!(!marker.exists(), "must not execute when acquire fails");
    assert!(store.release_calls().is_empty());
    assert!(!job.is_running(), "running flag must clear after a failed acquire");
}

#[tokio::test]
async fn test_run_executes_command() {
    let store = Arc::new(MockLeaseStore::new());
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("executed");
    let job = test_job(
        job("test-job", "* * * * *", &format!("touch {}", marker.display())),
        store,
    );

    job.run().await;

    assert!(marker.exists(), "command was not executed");
}

#[tokio::test]
async fn test_second_run_skips_while_first_in_flight() {
    let store = Arc::new(MockLeaseStore::new());
    let job = test_job(job("long-job", "* * * * *", "sleep 0.5"), store.clone());

    let first = tokio::spawn(Arc::clone(&job).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The local re-entry guard returns before touching the store.
    Arc::clone(&job).run().await;
    first.await.unwrap();

    assert_eq!(
        store.acquire_calls().len(),
        1,
        "second run must perform zero store operations"
    );
}

#[tokio::test]
async fn test_is_running_lifecycle() {
    let store = Arc::new(MockLeaseStore::new());
    let job = test_job(job("test-job", "* * * * *", "sleep 0.3"), store);

    assert!(!job.is_running());

    let handle = tokio::spawn(Arc::clone(&job).run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(job.is_running());

    handle.await.unwrap();
    assert!(!job.is_running());
}

#[tokio::test]
async fn test_cancel_interrupts_workload() {
    let store = Arc::new(MockLeaseStore::new());
    let job = test_job(job("long-job", "* * * * *", "sleep 10"), store.clone());

    let start = Instant::now();
    let handle = tokio::spawn(Arc::clone(&job).run());
    tokio::time::sleep(Duration::from_millis(100)).await;

    job.cancel();
    handle.await.unwrap();

    assert!(
        start.elapsed() < Duration::from_secs(2),
        "canceled job took {:?}",
        start.elapsed()
    );
    assert_eq!(store.release_calls().len(), 1, "lease must still be released");
}

#[tokio::test]
async fn test_cancel_when_idle_is_noop() {
    let store = Arc::new(MockLeaseStore::new());
    let job = test_job(job("test-job", "* * * * *", "echo hello"), store.clone());

    job.cancel();
    Arc::clone(&job).run().await;

    assert_eq!(store.acquire_calls().len(), 1, "job must still run normally");
}

#[tokio::test]
async fn test_timeout_kills_workload() {
    let store = Arc::new(MockLeaseStore::new());
    let mut config = job("timeout-job", "* * * * *", "sleep 10");
    config.timeout = Some(Duration::from_millis(100));
    let job = test_job(config, store.clone());

    let start = Instant::now();
    job.run().await;

    assert!(
        start.elapsed() < Duration::from_secs(2),
        "timed-out job took {:?}",
        start.elapsed()
    );
    assert_eq!(store.release_calls().len(), 1);
}

#[tokio::test]
async fn test_failed_command_still_releases_lease() {
    let store = Arc::new(MockLeaseStore::new());
    let job = test_job(job("failing-job", "* * * * *", "exit 1"), store.clone());

    job.run().await;

    assert_eq!(store.release_calls().len(), 1);
}

#[tokio::test]
async fn test_release_error_is_swallowed() {
    let store = Arc::new(MockLeaseStore::new());
    store.fail_release();
    let job = test_job(job("test-job", "* * * * *", "echo hello"), store.clone());

    job.clone().run().await;

    assert!(!job.is_running(), "running flag must clear despite release failure");
}

#[tokio::test]
async fn test_work_dir_applies() {
    let store = Arc::new(MockLeaseStore::new());
    let dir = tempfile::tempdir().unwrap();
    let mut config = job("test-job", "* * * * *", "touch test-marker");
    config.work_dir = Some(dir.path().display().to_string());
    let job = test_job(config, store);

    job.run().await;

    assert!(dir.path().join("test-marker").exists());
}

#[tokio::test]
async fn test_env_overrides_apply() {
    let store = Arc::new(MockLeaseStore::new());
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("output");
    let mut config = job(
        "test-job",
        "* * * * *",
        &format!("echo $MY_VAR > {}", output.display()),
    );
    config.env.insert("MY_VAR".to_string(), "test-value".to_string());
    let job = test_job(config, store);

    job.run().await;

    let content = std::fs::read_to_string(&output).unwrap();
    assert_eq!(content, "test-value\n");
}

#[tokio::test]
async fn test_success_hook_runs_on_success() {
    let store = Arc::new(MockLeaseStore::new());
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("hook-success");
    let mut config = job("hook-job", "* * * * *", "echo success");
    config.on_success = Some(format!("touch {}", marker.display()));
    let job = test_job(config, store);

    job.run().await;

    assert!(marker.exists(), "on_success hook was not executed");
}

#[tokio::test]
async fn test_failure_hook_runs_on_failure() {
    let store = Arc::new(MockLeaseStore::new());
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("hook-failure");
    let mut config = job("hook-job", "* * * * *", "exit 1");
    config.on_failure = Some(format!("touch {}", marker.display()));
    let job = test_job(config, store);

    job.run().await;

    assert!(marker.exists(), "on_failure hook was not executed");
}

#[tokio::test]
async fn test_hooks_do_not_cross() {
    let store = Arc::new(MockLeaseStore::new());
    let dir = tempfile::tempdir().unwrap();
    let success_marker = dir.path().join("hook-success");
    let failure_marker = dir.path().join("hook-failure");

    let mut config = job("failing-job", "* * * * *", "exit 1");
    config.on_success = Some(format!("touch {}", success_marker.display()));
    test_job(config, store.clone()).run().await;
    assert!(!success_marker.exists(), "on_success must not run on failure");

    let mut config = job("success-job", "* * * * *", "echo ok");
    config.on_failure = Some(format!("touch {}", failure_marker.display()));
    test_job(config, store).run().await;
    assert!(!failure_marker.exists(), "on_failure must not run on success");
}

#[tokio::test]
async fn test_hook_failure_does_not_block_release() {
    let store = Arc::new(MockLeaseStore::new());
    let mut config = job("hook-job", "* * * * *", "echo ok");
    config.on_success = Some("exit 7".to_string());
    let job = test_job(config, store.clone());

    job.clone().run().await;

    assert_eq!(store.release_calls().len(), 1);
    assert!(!job.is_running());
}

#[tokio::test]
async fn test_grace_period_delays_release() {
    let store = Arc::new(MockLeaseStore::new());
    let job = test_job_with_grace(
        job("test-job", "* * * * *", "echo hello"),
        store,
        Duration::from_millis(100),
    );

    let start = Instant::now();
    job.run().await;

    assert!(
        start.elapsed() >= Duration::from_millis(100),
        "run returned before the grace period elapsed"
    );
}

#[tokio::test]
async fn test_renewer_extends_lease_during_long_run() {
    let store = Arc::new(MockLeaseStore::new());
    let mut config = job("long-job", "* * * * *", "sleep 2.5");
    // TTL 3s renews every max(3s/3, 1s) = 1s: at least two extensions
    // during a 2.5s workload.
    config.lock_ttl = Some(Duration::from_secs(3));
    let job = test_job(config, store.clone());

    job.run().await;

    let extends = store.extend_calls();
    assert!(
        extends.len() >= 2,
        "expected at least 2 extensions, got {}",
        extends.len()
    );
    assert!(extends.iter().all(|(name, ttl)| name == "long-job" && *ttl == Duration::from_secs(3)));
}

#[tokio::test]
async fn test_lost_lease_does_not_cancel_workload() {
    let store = Arc::new(MockLeaseStore::new());
    store.lose_lease_on_extend();

    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("completed");
    let mut config = job(
        "long-job",
        "* * * * *",
        &format!("sleep 1.3 && touch {}", marker.display()),
    );
    config.lock_ttl = Some(Duration::from_secs(3));
    let job = test_job(config, store.clone());

    job.run().await;

    assert!(
        !store.extend_calls().is_empty(),
        "renewer should have attempted an extension"
    );
    assert!(marker.exists(), "workload must run to completion after a lost lease");
}

#[tokio::test]
async fn test_extend_error_does_not_cancel_workload() {
    let store = Arc::new(MockLeaseStore::new());
    store.fail_extend();

    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("completed");
    let mut config = job(
        "long-job",
        "* * * * *",
        &format!("sleep 1.3 && touch {}", marker.display()),
    );
    config.lock_ttl = Some(Duration::from_secs(3));
    let job = test_job(config, store);

    job.run().await;

    assert!(marker.exists(), "workload must survive store errors in the renewer");
}
