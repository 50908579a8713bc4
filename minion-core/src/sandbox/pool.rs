// Pre-provisioned sandbox pool with a background refiller.
//
// All bookkeeping lives in one mutex that is never held across an await.
// Waiters park on `ready`; the refiller parks on `refill`.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SandboxSection;
use crate::error::SandboxError;

use super::{InstanceHandle, SandboxBackend, SandboxInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Ready plus provisioning instances the refiller aims for.
    pub target: usize,
    /// Ceiling on live instances: ready, provisioning and leased.
    pub max: usize,
    pub acquire_timeout: Duration,
    /// Tries per instance before a provisioning failure is surfaced.
    pub provision_retries: u32,
    /// First retry delay; doubled on each further try.
    pub provision_backoff: Duration,
    /// Pause after a surfaced failure before the refiller tries again.
    pub failure_cooldown: Duration,
}

impl From<&SandboxSection> for PoolSettings {
    fn from(section: &SandboxSection) -> Self {
        Self {
            target: section.pool_target,
            max: section.pool_max,
            acquire_timeout: section.acquire_timeout(),
            provision_retries: section.provision_retries,
            provision_backoff: section.provision_backoff(),
            failure_cooldown: section.provision_backoff() * 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub ready: usize,
    pub in_flight: usize,
    pub leased: usize,
    pub provisioned: u64,
    pub destroyed: u64,
    pub provision_failures: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    ready: VecDeque<InstanceHandle>,
    in_flight: usize,
    leased: HashSet<String>,
    provisioned: u64,
    destroyed: u64,
    /// Bumped on every surfaced provisioning failure.
    failure_epoch: u64,
    last_failure: Option<String>,
    shutdown: bool,
}

impl PoolState {
    fn live(&self) -> usize {
        self.ready.len() + self.in_flight + self.leased.len()
    }
}

#[derive(Debug)]
pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    ready: Notify,
    refill: Notify,
    cancel: CancellationToken,
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget_lease(&self, id: &str) {
        let mut state = self.state();
        state.leased.remove(id);
        state.destroyed += 1;
        drop(state);
        self.refill.notify_one();
    }
}

/// Shared pool of single-use sandbox instances.
#[derive(Debug)]
pub struct SandboxPool {
    backend: Arc<dyn SandboxBackend>,
    settings: PoolSettings,
    shared: Arc<PoolShared>,
    refiller: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxPool {
    /// Create the pool and start its refiller. Must be called inside a tokio
    /// runtime.
    pub fn start(
        backend: Arc<dyn SandboxBackend>,
        settings: PoolSettings,
    ) -> Result<Arc<Self>, SandboxError> {
        if settings.target == 0 || settings.target > settings.max {
            return Err(SandboxError::Provision(format!(
                "invalid pool size: target {} with maximum {}",
                settings.target, settings.max
            )));
        }

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            ready: Notify::new(),
            refill: Notify::new(),
            cancel: CancellationToken::new(),
        });
        let task = tokio::spawn(refill_loop(
            Arc::clone(&backend),
            settings,
            Arc::clone(&shared),
        ));
        info!(
            backend = backend.name(),
            target = settings.target,
            max = settings.max,
            "Sandbox pool started"
        );
        Ok(Arc::new(Self {
            backend,
            settings,
            shared,
            refiller: Mutex::new(Some(task)),
        }))
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Take a ready instance, waiting up to `timeout` for one.
    ///
    /// Fails early with `Unavailable` when provisioning failed (after its
    /// retries) while this caller was waiting.
    pub async fn acquire(&self, timeout: Duration) -> Result<SandboxInstance, SandboxError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let start_epoch = self.shared.state().failure_epoch;

        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state();
                if state.shutdown {
                    return Err(SandboxError::Unavailable("pool is shut down".to_string()));
                }
                if let Some(handle) = state.ready.pop_front() {
                    state.leased.insert(handle.id.clone());
                    drop(state);
                    self.shared.refill.notify_one();
                    debug!(instance = %handle.id, "Sandbox acquired");
                    return Ok(SandboxInstance::new(
                        handle,
                        Arc::clone(&self.backend),
                        Arc::clone(&self.shared),
                    ));
                }
                if state.failure_epoch != start_epoch {
                    let reason = state
                        .last_failure
                        .clone()
                        .unwrap_or_else(|| "provisioning failed".to_string());
                    return Err(SandboxError::Unavailable(reason));
                }
            }
            self.shared.refill.notify_one();

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    return Err(SandboxError::Unavailable(format!(
                        "no sandbox ready within {}s",
                        timeout.as_secs()
                    )));
                }
                () = self.shared.cancel.cancelled() => {
                    return Err(SandboxError::Unavailable("pool is shut down".to_string()));
                }
            }
        }
    }

    /// Destroy `instance`. Releasing twice is a no-op.
    pub async fn release(&self, instance: &SandboxInstance) {
        if !instance.mark_released() {
            debug!(instance = instance.id(), "Sandbox already released");
            return;
        }
        let handle = instance.handle();
        if let Err(e) = self.backend.destroy(handle).await {
            warn!(instance = %handle.id, error = %e, "Failed to destroy sandbox");
        }
        self.shared.forget_lease(&handle.id);
        debug!(instance = %handle.id, "Sandbox released");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state();
        PoolStats {
            ready: state.ready.len(),
            in_flight: state.in_flight,
            leased: state.leased.len(),
            provisioned: state.provisioned,
            destroyed: state.destroyed,
            provision_failures: state.failure_epoch,
        }
    }

    /// Stop the refiller and destroy every ready instance. Leased instances
    /// are destroyed when released.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let task = self
            .refiller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let drained: Vec<InstanceHandle> = {
            let mut state = self.shared.state();
            state.shutdown = true;
            state.ready.drain(..).collect()
        };
        for handle in &drained {
            if let Err(e) = self.backend.destroy(handle).await {
                warn!(instance = %handle.id, error = %e, "Failed to destroy sandbox");
            }
        }
        self.shared.state().destroyed += drained.len() as u64;
        self.shared.ready.notify_waiters();
        info!(destroyed = drained.len(), "Sandbox pool shut down");
    }
}

impl Drop for SandboxPool {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Destroy an instance dropped without `release`, off the caller's task.
pub(crate) fn destroy_detached(
    shared: &Arc<PoolShared>,
    backend: &Arc<dyn SandboxBackend>,
    handle: InstanceHandle,
) {
    let shared = Arc::clone(shared);
    let backend = Arc::clone(backend);
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = backend.destroy(&handle).await {
                warn!(instance = %handle.id, error = %e, "Failed to destroy dropped sandbox");
            }
            shared.forget_lease(&handle.id);
        });
    } else {
        warn!(instance = %handle.id, "Sandbox dropped outside a runtime; not destroyed");
        shared.forget_lease(&handle.id);
    }
}

// ── Refiller ───────────────────────────────────────────────────────

async fn refill_loop(
    backend: Arc<dyn SandboxBackend>,
    settings: PoolSettings,
    shared: Arc<PoolShared>,
) {
    loop {
        let wanted = {
            let mut state = shared.state();
            if state.shutdown {
                break;
            }
            let short = settings
                .target
                .saturating_sub(state.ready.len() + state.in_flight);
            let room = settings.max.saturating_sub(state.live());
            let n = short.min(room);
            state.in_flight += n;
            n
        };

        if wanted == 0 {
            tokio::select! {
                () = shared.refill.notified() => continue,
                () = shared.cancel.cancelled() => break,
            }
        }

        debug!(count = wanted, "Provisioning sandboxes");
        let mut jobs = JoinSet::new();
        for _ in 0..wanted {
            let backend = Arc::clone(&backend);
            jobs.spawn(async move { provision_with_retry(backend.as_ref(), &settings).await });
        }

        let mut failed = false;
        while let Some(joined) = jobs.join_next().await {
            let result = joined
                .map_err(|e| SandboxError::Provision(format!("provisioning task failed: {e}")))
                .and_then(|r| r);
            let orphan = {
                let mut state = shared.state();
                state.in_flight -= 1;
                match result {
                    Ok(handle) if state.shutdown => Some(handle),
                    Ok(handle) => {
                        debug!(instance = %handle.id, "Sandbox ready");
                        state.provisioned += 1;
                        state.ready.push_back(handle);
                        None
                    }
                    Err(e) => {
                        warn!(error = %e, "Sandbox provisioning failed");
                        state.failure_epoch += 1;
                        state.last_failure = Some(e.to_string());
                        failed = true;
                        None
                    }
                }
            };
            shared.ready.notify_waiters();
            if let Some(handle) = orphan {
                let _ = backend.destroy(&handle).await;
            }
        }

        if failed {
            tokio::select! {
                () = tokio::time::sleep(settings.failure_cooldown) => {}
                () = shared.cancel.cancelled() => break,
            }
        }
    }
    debug!("Sandbox refiller stopped");
}

async fn provision_with_retry(
    backend: &dyn SandboxBackend,
    settings: &PoolSettings,
) -> Result<InstanceHandle, SandboxError> {
    let tries = settings.provision_retries.max(1);
    let mut delay = settings.provision_backoff;
    let mut last = None;
    for attempt in 1..=tries {
        match backend.provision().await {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                debug!(attempt, error = %e, "Provisioning attempt failed");
                last = Some(e);
                if attempt < tries {
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| SandboxError::Provision("no provisioning attempt".to_string())))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use minion_graphs::FileId;

    use super::*;
    use crate::sandbox::ExecOutput;

    #[derive(Debug, Default)]
    struct CountingBackend {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl SandboxBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        async fn provision(&self) -> Result<InstanceHandle, SandboxError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SandboxError::Provision("daemon down".into()));
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(InstanceHandle {
                id: format!("sbx-{n}"),
                location: String::new(),
            })
        }

        async fn exec(
            &self,
            _handle: &InstanceHandle,
            _command: &str,
            _timeout: Duration,
        ) -> Result<ExecOutput, SandboxError> {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
                elapsed_ms: 0,
            })
        }

        async fn write_file(
            &self,
            _handle: &InstanceHandle,
            _path: &FileId,
            _content: &str,
        ) -> Result<(), SandboxError> {
            Ok(())
        }

        async fn read_file(
            &self,
            _handle: &InstanceHandle,
            _path: &FileId,
        ) -> Result<Option<String>, SandboxError> {
            Ok(None)
        }

        async fn destroy(&self, _handle: &InstanceHandle) -> Result<(), SandboxError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings(target: usize, max: usize) -> PoolSettings {
        PoolSettings {
            target,
            max,
            acquire_timeout: Duration::from_secs(5),
            provision_retries: 3,
            provision_backoff: Duration::from_millis(10),
            failure_cooldown: Duration::from_millis(100),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refills_to_target_and_never_reuses() {
        let backend = Arc::new(CountingBackend::default());
        let pool = SandboxPool::start(backend.clone(), settings(2, 4)).unwrap();
        settle().await;
        assert_eq!(pool.stats().ready, 2);

        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.acquired_count(), 1);

        pool.release(&a).await;
        pool.release(&a).await;
        assert!(a.is_released());
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);

        settle().await;
        let stats = pool.stats();
        assert!(stats.ready + stats.in_flight <= 2);
        assert!(stats.ready + stats.in_flight + stats.leased <= 4);

        let c = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_ne!(c.id(), a.id());
        assert_ne!(c.id(), b.id());
        pool.release(&b).await;
        pool.release(&c).await;
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn released_instance_refuses_work() {
        let pool = SandboxPool::start(Arc::new(CountingBackend::default()), settings(1, 1)).unwrap();
        let sbx = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(&sbx).await;
        let err = sbx.exec("true", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SandboxError::Released(_)));
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_capacity_is_leased() {
        let pool = SandboxPool::start(Arc::new(CountingBackend::default()), settings(1, 1)).unwrap();
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let err = pool.acquire(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable(_)));

        pool.release(&held).await;
        let next = pool.acquire(Duration::from_secs(2)).await.unwrap();
        pool.release(&next).await;
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_failure_surfaces_then_recovers() {
        let backend = Arc::new(CountingBackend::default());
        backend.fail.store(true, Ordering::SeqCst);
        let pool = SandboxPool::start(backend.clone(), settings(1, 2)).unwrap();

        let err = pool.acquire(Duration::from_secs(30)).await.unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable(ref m) if m.contains("daemon down")));
        assert!(pool.stats().provision_failures >= 1);

        backend.fail.store(false, Ordering::SeqCst);
        let sbx = pool.acquire(Duration::from_secs(30)).await.unwrap();
        pool.release(&sbx).await;
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_instance_is_destroyed() {
        let backend = Arc::new(CountingBackend::default());
        let pool = SandboxPool::start(backend.clone(), settings(1, 1)).unwrap();
        let sbx = pool.acquire(Duration::from_secs(1)).await.unwrap();
        drop(sbx);
        settle().await;
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().leased, 0);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_destroys_ready_instances() {
        let backend = Arc::new(CountingBackend::default());
        let pool = SandboxPool::start(backend.clone(), settings(3, 3)).unwrap();
        settle().await;
        pool.shutdown().await;
        assert_eq!(backend.destroyed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().ready, 0);
        assert!(pool.acquire(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn invalid_sizes_are_rejected() {
        let backend: Arc<dyn SandboxBackend> = Arc::new(CountingBackend::default());
        assert!(SandboxPool::start(backend.clone(), settings(0, 1)).is_err());
        assert!(SandboxPool::start(backend, settings(3, 2)).is_err());
    }
}
