//! Shared handles threaded through the orchestration core.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinSet;

use crate::config::Settings;
use crate::db::DbPool;
use crate::error::Result;
use crate::instance::{self, InstanceProvider, InstanceType};
use crate::models::{BuildSetId, RepositoryId};
use crate::notifications::Exchanges;
use crate::signals::SignalHub;

/// Advisory cap on concurrent worker stream sessions per process.
pub const MAX_PROCESS_TASKS: usize = 10;

/// Keeps handles to fire-and-forget tasks until they complete, so they
/// are never reclaimed mid-flight. Finished tasks are reaped on the next
/// spawn.
#[derive(Clone, Default)]
pub struct TaskSet {
    inner: Arc<Mutex<JoinSet<()>>>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut set = self.inner.lock().unwrap();
        while set.try_join_next().is_some() {}
        set.spawn(fut);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Factory producing cloud instance handles for on-demand slaves. The
/// server wires the real provider; tests plug in mocks.
pub type InstanceFactory =
    Arc<dyn Fn(InstanceType, &Value) -> Result<Box<dyn InstanceProvider>> + Send + Sync>;

/// Shared state of the master process: store, settings, dispatch hubs and
/// the per-repository scheduling bookkeeping.
#[derive(Clone)]
pub struct Context {
    pub pool: DbPool,
    pub settings: Arc<Settings>,
    pub signals: SignalHub,
    pub exchanges: Exchanges,
    pub tasks: TaskSet,
    pub instances: InstanceFactory,
    /// Per-repository FIFO of buildsets waiting for the consumer loop.
    build_queues: Arc<DashMap<RepositoryId, VecDeque<BuildSetId>>>,
    /// Per-repository flag marking an active consumer loop.
    is_building: Arc<DashMap<RepositoryId, bool>>,
    /// Builds currently running in this process, across repositories.
    running_builds: Arc<AtomicUsize>,
}

impl Context {
    pub fn new(pool: DbPool, settings: Settings) -> Self {
        let exchanges = Exchanges::http(&settings);
        Self::with_exchanges(pool, settings, exchanges)
    }

    pub fn with_exchanges(pool: DbPool, settings: Settings, exchanges: Exchanges) -> Self {
        Self {
            pool,
            settings: Arc::new(settings),
            signals: SignalHub::new(),
            exchanges,
            tasks: TaskSet::new(),
            instances: Arc::new(|instance_type, confs| {
                instance::create_instance(instance_type, confs)
            }),
            build_queues: Arc::default(),
            is_building: Arc::default(),
            running_builds: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replaces the instance factory. Used by tests and by deployments
    /// with a different cloud backend.
    pub fn set_instance_factory(&mut self, factory: InstanceFactory) {
        self.instances = factory;
    }

    // Process-wide running-build accounting, checked against
    // MAX_PROCESS_TASKS by the admission loop.

    pub fn add_running_build(&self) {
        self.running_builds.fetch_add(1, Ordering::SeqCst);
    }

    pub fn remove_running_build(&self) {
        self.running_builds.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn running_builds(&self) -> usize {
        self.running_builds.load(Ordering::SeqCst)
    }

    // Per-repository queue of buildsets. Only the owning process schedules
    // its own consumer loop; these maps are process-local by design.

    pub fn queue_push(&self, repository_id: &RepositoryId, buildset_id: BuildSetId) {
        self.build_queues
            .entry(repository_id.clone())
            .or_default()
            .push_back(buildset_id);
    }

    pub fn queue_pop(&self, repository_id: &RepositoryId) -> Option<BuildSetId> {
        self.build_queues
            .get_mut(repository_id)
            .and_then(|mut q| q.pop_front())
    }

    pub fn queue_contains(&self, repository_id: &RepositoryId, buildset_id: &BuildSetId) -> bool {
        self.build_queues
            .get(repository_id)
            .map(|q| q.contains(buildset_id))
            .unwrap_or(false)
    }

    pub fn queue_len(&self, repository_id: &RepositoryId) -> usize {
        self.build_queues
            .get(repository_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn is_building(&self, repository_id: &RepositoryId) -> bool {
        self.is_building
            .get(repository_id)
            .map(|v| *v)
            .unwrap_or(false)
    }

    pub fn set_is_building(&self, repository_id: &RepositoryId, building: bool) {
        self.is_building.insert(repository_id.clone(), building);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_set_retains_until_done() {
        let tasks = TaskSet::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tasks.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(tasks.len(), 1);
        tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_queue_is_fifo_per_repository() {
        let (ctx, _, _) = crate::test_support::test_context().await;
        let repo_id = RepositoryId::new();
        let first = BuildSetId::new();
        let second = BuildSetId::new();

        ctx.queue_push(&repo_id, first.clone());
        ctx.queue_push(&repo_id, second.clone());
        assert_eq!(ctx.queue_len(&repo_id), 2);
        assert!(ctx.queue_contains(&repo_id, &second));

        assert_eq!(ctx.queue_pop(&repo_id), Some(first));
        assert_eq!(ctx.queue_pop(&repo_id), Some(second));
        assert_eq!(ctx.queue_pop(&repo_id), None);
    }

    #[tokio::test]
    async fn test_is_building_flag() {
        let (ctx, _, _) = crate::test_support::test_context().await;
        let repo_id = RepositoryId::new();

        assert!(!ctx.is_building(&repo_id));
        ctx.set_is_building(&repo_id, true);
        assert!(ctx.is_building(&repo_id));
        ctx.set_is_building(&repo_id, false);
        assert!(!ctx.is_building(&repo_id));
    }

    #[tokio::test]
    async fn test_running_build_accounting() {
        let (ctx, _, _) = crate::test_support::test_context().await;
        assert_eq!(ctx.running_builds(), 0);
        ctx.add_running_build();
        ctx.add_running_build();
        assert_eq!(ctx.running_builds(), 2);
        ctx.remove_running_build();
        assert_eq!(ctx.running_builds(), 1);
    }
}
