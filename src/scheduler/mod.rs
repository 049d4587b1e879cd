//! Job scheduling: one timer task per job drives its controller; graceful
//! shutdown waits for in-flight firings under per-job budgets.

pub mod job;

pub use job::Job;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{JobConfig, NodeConfig};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::lock::LeaseStore;
use crate::schedule::Schedule;

/// Shutdown wait budget for jobs without a configured timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Holds the set of job controllers and their tick sources.
pub struct Scheduler {
    store: Arc<dyn LeaseStore>,
    executor: Executor,
    grace_period: Duration,
    ticks: CancellationToken,
    inner: Mutex<Inner>,
}

struct Inner {
    jobs: HashMap<String, Arc<Job>>,
    tick_tasks: Vec<JoinHandle<()>>,
    started: bool,
}

impl Scheduler {
    pub fn new(store: Arc<dyn LeaseStore>, node: &NodeConfig) -> Self {
        Self {
            store,
            executor: Executor::new(),
            grace_period: node.grace_period,
            ticks: CancellationToken::new(),
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                tick_tasks: Vec::new(),
                started: false,
            }),
        }
    }

    /// Register a job. Disabled jobs are accepted and skipped; duplicate
    /// names and unparsable schedules are rejected.
    pub fn add_job(&self, config: JobConfig) -> Result<()> {
        if !config.is_enabled() {
            tracing::info!(job = %config.name, "job is disabled, skipping");
            return Ok(());
        }

        let schedule = Schedule::parse(&config.schedule)?;
        let name = config.name.clone();

        let mut inner = self.inner.lock().expect("scheduler state poisoned");
        if inner.jobs.contains_key(&name) {
            return Err(Error::Config(format!("duplicate job name: {name:?}")));
        }

        let job = Arc::new(Job::new(
            config,
            schedule,
            Arc::clone(&self.store),
            self.executor.clone(),
            self.grace_period,
        ));
        inner.jobs.insert(name.clone(), Arc::clone(&job));

        tracing::info!(job = %name, schedule = %job.schedule(), "added job");

        if inner.started {
            let task = self.spawn_tick_source(job);
            inner.tick_tasks.push(task);
        }
        Ok(())
    }

    /// Arm the tick sources for every registered job.
    pub fn start(&self) {
        let mut inner = self.inner.lock().expect("scheduler state poisoned");
        if inner.started {
            return;
        }
        inner.started = true;
        tracing::info!(job_count = inner.jobs.len(), "starting scheduler");

        let jobs: Vec<Arc<Job>> = inner.jobs.values().cloned().collect();
        for job in jobs {
            let task = self.spawn_tick_source(job);
            inner.tick_tasks.push(task);
        }
    }

    /// One timer per job: sleep until the next firing instant, dispatch the
    /// controller on its own task, rearm. Firings that would have landed
    /// while the timer was not armed are not backfilled.
    fn spawn_tick_source(&self, job: Arc<Job>) -> JoinHandle<()> {
        let ticks = self.ticks.clone();
        tokio::spawn(async move {
            loop {
                let now = Local::now();
                let Some(next) = job.schedule().next_after(now) else {
                    tracing::warn!(job = %job.name(), "schedule has no future firings");
                    return;
                };
                let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = ticks.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {
                        tokio::spawn(Arc::clone(&job).run());
                    }
                }
            }
        })
    }

    /// Graceful shutdown: disarm all tick sources, then wait for running
    /// jobs in parallel, each up to its own timeout (30s when none is set),
    /// canceling whatever exceeds its budget. Finally close the store.
    pub async fn stop(&self) {
        tracing::info!("stopping scheduler");
        self.ticks.cancel();

        let (running, tick_tasks) = {
            let mut inner = self.inner.lock().expect("scheduler state poisoned");
            let running: Vec<Arc<Job>> =
                inner.jobs.values().filter(|j| j.is_running()).cloned().collect();
            (running, std::mem::take(&mut inner.tick_tasks))
        };

        for task in tick_tasks {
            let _ = task.await;
        }

        if running.is_empty() {
            tracing::info!("no running jobs, scheduler stopped");
        } else {
            tracing::info!(count = running.len(), "waiting for running jobs to complete");

            let waits: Vec<JoinHandle<()>> = running
                .into_iter()
                .map(|job| tokio::spawn(wait_for_job(job)))
                .collect();
            for wait in waits {
                let _ = wait.await;
            }

            tracing::info!("scheduler stopped");
        }

        if let Err(e) = self.store.close().await {
            tracing::error!(error = %e, "failed to close lease store");
        }
    }

    /// Snapshot of a single controller.
    pub fn get_job(&self, name: &str) -> Option<Arc<Job>> {
        self.inner
            .lock()
            .expect("scheduler state poisoned")
            .jobs
            .get(name)
            .cloned()
    }

    /// Snapshot of all registered controllers.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.inner
            .lock()
            .expect("scheduler state poisoned")
            .jobs
            .values()
            .cloned()
            .collect()
    }
}

/// Poll a job to completion within its shutdown budget, canceling on expiry.
async fn wait_for_job(job: Arc<Job>) {
    let budget = job.timeout().unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
    let deadline = tokio::time::Instant::now() + budget;

    loop {
        if !job.is_running() {
            tracing::info!(job = %job.name(), "job completed during shutdown");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(
                job = %job.name(),
                timeout = ?budget,
                "job exceeded shutdown timeout, canceling"
            );
            job.cancel();
            return;
        }
        tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
    }
}
