use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::JobConfig;
use crate::executor::{ExecOptions, Executor};
use crate::lock::LeaseStore;
use crate::schedule::Schedule;

/// Lease TTL when neither `lock_ttl` nor `timeout` is configured. Long
/// enough to survive a renewer that misses one tick.
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5 * 60);
/// Headroom added to the timeout when deriving the lease TTL from it.
const TIMEOUT_TTL_MARGIN: Duration = Duration::from_secs(60);
/// Floor for the renewal interval.
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

/// A scheduled job with distributed locking. At most one firing is in
/// flight per process; cluster-wide exclusion comes from the lease.
pub struct Job {
    config: JobConfig,
    schedule: Schedule,
    store: Arc<dyn LeaseStore>,
    executor: Executor,
    grace_period: Duration,
    state: Mutex<RunState>,
}

/// Mutable per-firing state. The mutex is held only across field updates,
/// never across store calls, workload execution or sleeps.
#[derive(Default)]
struct RunState {
    running: bool,
    cancel: Option<CancellationToken>,
}

impl Job {
    pub fn new(
        config: JobConfig,
        schedule: Schedule,
        store: Arc<dyn LeaseStore>,
        executor: Executor,
        grace_period: Duration,
    ) -> Self {
        Self {
            config,
            schedule,
            store,
            executor,
            grace_period,
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    /// Whether a firing is currently in progress on this node.
    pub fn is_running(&self) -> bool {
        self.state.lock().expect("job state poisoned").running
    }

    /// Signal the running workload to abort. No-op when idle; never touches
    /// the store, the grace period or the release.
    pub fn cancel(&self) {
        let state = self.state.lock().expect("job state poisoned");
        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
    }

    fn lease_ttl(&self) -> Duration {
        self.config.lock_ttl.unwrap_or_else(|| match self.config.timeout {
            Some(timeout) => timeout + TIMEOUT_TTL_MARGIN,
            None => DEFAULT_LEASE_TTL,
        })
    }

    /// Execute one firing: acquire the lease, renew it while the workload
    /// runs, run the appropriate hook, wait out the grace period, release.
    /// All failures are handled here; nothing propagates to the tick source.
    pub async fn run(self: Arc<Self>) {
        {
            let mut state = self.state.lock().expect("job state poisoned");
            if state.running {
                tracing::warn!(job = %self.config.name, "job is already running, skipping");
                return;
            }
            state.running = true;
        }

        let ttl = self.lease_ttl();

        match self.store.acquire(&self.config.name, ttl).await {
            Err(e) => {
                tracing::error!(job = %self.config.name, error = %e, "failed to acquire lease");
                self.finish();
                return;
            }
            Ok(false) => {
                tracing::debug!(job = %self.config.name, "lease not acquired, another node is executing");
                self.finish();
                return;
            }
            Ok(true) => {}
        }

        tracing::info!(job = %self.config.name, "acquired lease, starting execution");

        let cancel = CancellationToken::new();
        self.state.lock().expect("job state poisoned").cancel = Some(cancel.clone());

        let renew_stop = CancellationToken::new();
        let renewer = {
            let job = Arc::clone(&self);
            let stop = renew_stop.clone();
            tokio::spawn(async move { job.renew_lease(ttl, stop).await })
        };

        let result = self
            .executor
            .execute(ExecOptions {
                command: self.config.command.clone(),
                work_dir: self.config.work_dir.clone(),
                env: self.config.env.clone(),
                timeout: self.config.timeout,
                cancel: Some(cancel),
            })
            .await;

        renew_stop.cancel();
        let _ = renewer.await;

        if result.success() {
            tracing::info!(
                job = %self.config.name,
                duration = %format_secs(result.duration),
                exit_code = result.exit_code,
                "job completed successfully"
            );
            if let Some(hook) = &self.config.on_success {
                self.run_hook(hook, "success").await;
            }
        } else {
            tracing::error!(
                job = %self.config.name,
                duration = %format_secs(result.duration),
                exit_code = result.exit_code,
                error = ?result.error,
                stderr = %result.stderr,
                "job failed"
            );
            if let Some(hook) = &self.config.on_failure {
                self.run_hook(hook, "failure").await;
            }
        }

        if !self.grace_period.is_zero() {
            tracing::debug!(
                job = %self.config.name,
                duration = %format_secs(self.grace_period),
                "waiting grace period before releasing lease"
            );
            tokio::time::sleep(self.grace_period).await;
        }

        match self.store.release(&self.config.name).await {
            Ok(()) => tracing::debug!(job = %self.config.name, "released lease"),
            Err(e) => {
                tracing::error!(job = %self.config.name, error = %e, "failed to release lease");
            }
        }

        self.finish();
    }

    /// Periodically extend the lease while the workload runs. A failed or
    /// lost extension never cancels the workload: transient store blips are
    /// common, and a bounded duplicate beats losing the run.
    async fn renew_lease(&self, ttl: Duration, stop: CancellationToken) {
        let interval = std::cmp::max(ttl / 3, MIN_RENEW_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    match self.store.extend(&self.config.name, ttl).await {
                        Err(e) => {
                            tracing::error!(job = %self.config.name, error = %e, "failed to extend lease");
                        }
                        Ok(false) => {
                            tracing::warn!(job = %self.config.name, "lease extension failed, lease may have been lost");
                        }
                        Ok(true) => {
                            tracing::debug!(job = %self.config.name, ttl = ?ttl, "extended lease");
                        }
                    }
                }
            }
        }
    }

    /// Run an `on_success`/`on_failure` hook with the job's working
    /// directory and environment. Hook failures are logged and do not
    /// change the job's outcome.
    async fn run_hook(&self, command: &str, kind: &str) {
        tracing::debug!(job = %self.config.name, hook = kind, command, "running hook");

        let result = self
            .executor
            .execute(ExecOptions {
                command: command.to_string(),
                work_dir: self.config.work_dir.clone(),
                env: self.config.env.clone(),
                timeout: None,
                cancel: None,
            })
            .await;

        if !result.success() {
            tracing::warn!(
                job = %self.config.name,
                hook = kind,
                exit_code = result.exit_code,
                error = ?result.error,
                "hook failed"
            );
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock().expect("job state poisoned");
        state.running = false;
        state.cancel = None;
    }
}

/// Seconds with two decimals, e.g. `"3.52s"`.
fn format_secs(d: Duration) -> String {
    format!("{:.2}s", d.as_secs_f64())
}
