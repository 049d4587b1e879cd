use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::lock::LeaseStore;

/// Call-recording lease store for controller tests. Acquire and extend
/// succeed by default; failures and contention are opt-in.
#[derive(Debug, Default)]
pub struct MockLeaseStore {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    acquire_ok: bool,
    extend_ok: bool,
    fail_acquire: bool,
    fail_release: bool,
    fail_extend: bool,
    held_elsewhere: HashSet<String>,
    acquire_calls: Vec<(String, Duration)>,
    release_calls: Vec<String>,
    extend_calls: Vec<(String, Duration)>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            acquire_ok: true,
            extend_ok: true,
            fail_acquire: false,
            fail_release: false,
            fail_extend: false,
            held_elsewhere: HashSet::new(),
            acquire_calls: Vec::new(),
            release_calls: Vec::new(),
            extend_calls: Vec::new(),
        }
    }
}

impl MockLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate another node holding (or releasing) the lease for `job`.
    pub fn set_lease_held(&self, job: &str, held: bool) {
        let mut state = self.state.lock().expect("mock state poisoned");
        if held {
            state.held_elsewhere.insert(job.to_string());
        } else {
            state.held_elsewhere.remove(job);
        }
    }

    pub fn fail_acquire(&self) {
        self.state.lock().expect("mock state poisoned").fail_acquire = true;
    }

    pub fn fail_release(&self) {
        self.state.lock().expect("mock state poisoned").fail_release = true;
    }

    pub fn fail_extend(&self) {
        self.state.lock().expect("mock state poisoned").fail_extend = true;
    }

    /// Make extend report the lease as lost without erroring.
    pub fn lose_lease_on_extend(&self) {
        self.state.lock().expect("mock state poisoned").extend_ok = false;
    }

    pub fn acquire_calls(&self) -> Vec<(String, Duration)> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .acquire_calls
            .clone()
    }

    pub fn release_calls(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .release_calls
            .clone()
    }

    pub fn extend_calls(&self) -> Vec<(String, Duration)> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .extend_calls
            .clone()
    }
}

#[async_trait]
impl LeaseStore for MockLeaseStore {
    async fn acquire(&self, job: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.acquire_calls.push((job.to_string(), ttl));
        if state.fail_acquire {
            return Err(Error::Internal("injected acquire failure".to_string()));
        }
        if state.held_elsewhere.contains(job) {
            return Ok(false);
        }
        Ok(state.acquire_ok)
    }

    async fn release(&self, job: &str) -> Result<()> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.release_calls.push(job.to_string());
        if state.fail_release {
            return Err(Error::Internal("injected release failure".to_string()));
        }
        Ok(())
    }

    async fn extend(&self, job: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.extend_calls.push((job.to_string(), ttl));
        if state.fail_extend {
            return Err(Error::Internal("injected extend failure".to_string()));
        }
        Ok(state.extend_ok)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
