//! Slave: a remote worker daemon and its master-side state.
//!
//! The slave executes builds; the master tracks its queue accounting,
//! manages the cloud instance behind on-demand workers and ingests the
//! streamed build session, turning each frame into a durable state
//! transition. All slave mutations run under a named write-lock so every
//! master process agrees on queue_count and running_count.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use ulid::Ulid;
use uuid::Uuid;

use crate::client::SlaveClient;
use crate::config::Settings;
use crate::context::Context;
use crate::db::{
    buildset::{BuildRepo, BuildStepRepo},
    slave::SlaveRepo,
    DbPool,
};
use crate::error::{BellowsError, Result};
use crate::instance::InstanceType;
use crate::lock::Lock;
use crate::models::{
    Build, Builder, BuildStatus, BuildStep, Repository, RepositoryId, Revision, StepStatus,
    DEFAULT_POSITION,
};
use crate::signals::EventKind;

/// Sentinel host for on-demand slaves whose IP is unknown at rest. A
/// lifecycle marker, not an address.
pub const DYNAMIC_HOST: &str = "dynamic";

/// Healthcheck polling budget while waiting an instance's service.
const WAIT_SERVICE_ATTEMPTS: u32 = 30;
const WAIT_SERVICE_INTERVAL: Duration = Duration::from_millis(500);

/// How long to wait for a step to be materialised by its step frame
/// before giving up on an output fragment.
const STEP_WAIT_ATTEMPTS: u32 = 5;
const STEP_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Default bound on the build request write and each stream read.
const UNRESPONSIVE_TIMEOUT: Duration = Duration::from_secs(600);

/// Unique identifier for a slave.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlaveId(pub Ulid);

impl SlaveId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn from_string(s: &str) -> std::result::Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for SlaveId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SlaveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote worker daemon.
#[derive(Debug)]
pub struct Slave {
    pub id: SlaveId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub token: String,
    pub use_ssl: bool,
    pub validate_cert: bool,
    /// On-demand slaves are backed by a cloud instance started before use
    /// and stopped when idle.
    pub on_demand: bool,
    pub instance_type: Option<InstanceType>,
    pub instance_confs: Value,
    pub queue_count: i64,
    pub running_count: i64,
    pub enqueued_builds: Vec<Uuid>,
    pub running_repos: Vec<String>,
    /// Next accepted output-fragment sequence per step. In-memory only:
    /// fragment ordering matters within one stream session.
    step_output_seq: DashMap<Uuid, u64>,
}

impl Slave {
    pub fn new(name: &str, host: &str, port: u16, token: &str) -> Self {
        Self {
            id: SlaveId::new(),
            name: name.to_string(),
            host: host.to_string(),
            port,
            token: token.to_string(),
            use_ssl: false,
            validate_cert: false,
            on_demand: false,
            instance_type: None,
            instance_confs: json!({}),
            queue_count: 0,
            running_count: 0,
            enqueued_builds: Vec::new(),
            running_repos: Vec::new(),
            step_output_seq: DashMap::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_stored(
        id: SlaveId,
        name: String,
        host: String,
        port: u16,
        token: String,
        use_ssl: bool,
        validate_cert: bool,
        on_demand: bool,
        instance_type: Option<InstanceType>,
        instance_confs: Value,
        queue_count: i64,
        running_count: i64,
        enqueued_builds: Vec<Uuid>,
        running_repos: Vec<String>,
    ) -> Self {
        Self {
            id,
            name,
            host,
            port,
            token,
            use_ssl,
            validate_cert,
            on_demand,
            instance_type,
            instance_confs,
            queue_count,
            running_count,
            enqueued_builds,
            running_repos,
            step_output_seq: DashMap::new(),
        }
    }

    pub async fn get(pool: &DbPool, id: &SlaveId) -> Result<Self> {
        SlaveRepo::get_by_id(pool, id).await
    }

    /// Re-reads the stored state, keeping the in-memory output sequence
    /// cache.
    pub async fn reload(&mut self, pool: &DbPool) -> Result<()> {
        let stored = SlaveRepo::get_by_id(pool, &self.id).await?;
        self.name = stored.name;
        self.host = stored.host;
        self.port = stored.port;
        self.token = stored.token;
        self.use_ssl = stored.use_ssl;
        self.validate_cert = stored.validate_cert;
        self.on_demand = stored.on_demand;
        self.instance_type = stored.instance_type;
        self.instance_confs = stored.instance_confs;
        self.queue_count = stored.queue_count;
        self.running_count = stored.running_count;
        self.enqueued_builds = stored.enqueued_builds;
        self.running_repos = stored.running_repos;
        Ok(())
    }

    fn write_lock(&self, pool: &DbPool) -> Lock {
        Lock::new(pool, format!("slave-{}", self.id))
    }

    pub async fn get_client(&self, settings: &Settings) -> Result<SlaveClient> {
        SlaveClient::connect(&self.host, self.port, &self.token, settings).await
    }

    /// One healthcheck round-trip. Connection errors propagate so callers
    /// can tell a refused connection from a protocol problem.
    pub async fn healthcheck(&self, settings: &Settings) -> Result<bool> {
        let mut client = self.get_client(settings).await?;
        client.healthcheck().await
    }

    /// Polls the healthcheck until the slave service answers. Connection
    /// refused is retried within the budget; any other client error
    /// propagates immediately.
    pub async fn wait_service_start(&self, settings: &Settings) -> Result<bool> {
        for _ in 0..WAIT_SERVICE_ATTEMPTS {
            match self.healthcheck(settings).await {
                Ok(_) => return Ok(true),
                Err(BellowsError::Io(e))
                    if e.kind() == std::io::ErrorKind::ConnectionRefused =>
                {
                    tokio::time::sleep(WAIT_SERVICE_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(BellowsError::Timeout(
            "slave service did not start in time".to_string(),
        ))
    }

    /// Asks the slave which builders apply to `revision`, mapping the
    /// names to builder entities of the repository.
    pub async fn list_builders(
        &self,
        ctx: &Context,
        repo: &Repository,
        revision: &Revision,
    ) -> Result<Vec<Builder>> {
        let mut client = self.get_client(&ctx.settings).await?;
        let names = client
            .list_builders(&repo.url, &repo.vcs_type, &revision.branch, &revision.commit)
            .await?;

        let mut builders = Vec::with_capacity(names.len());
        for name in names {
            builders
                .push(Builder::get_or_create(&ctx.pool, &repo.id, &name, DEFAULT_POSITION).await?);
        }
        Ok(builders)
    }

    // Queue accounting. Every mutation runs under the slave write-lock
    // and recomputes the counters from the collections, so
    // queue_count == len(enqueued_builds) and
    // running_count == len(running_repos) hold at all times.

    /// Puts `build` on this slave's queue. Idempotent: returns false when
    /// the build is already enqueued.
    pub async fn enqueue_build(&mut self, ctx: &Context, build: &Build) -> Result<bool> {
        let guard = self.write_lock(&ctx.pool).acquire_write().await?;
        self.reload(&ctx.pool).await?;

        if self.enqueued_builds.contains(&build.uuid) {
            guard.release().await?;
            return Ok(false);
        }

        self.enqueued_builds.push(build.uuid);
        self.queue_count = self.enqueued_builds.len() as i64;
        SlaveRepo::set_queue(&ctx.pool, &self.id, &self.enqueued_builds, self.queue_count)
            .await?;
        guard.release().await?;
        Ok(true)
    }

    /// Removes `build` from this slave's queue. Returns false when it was
    /// not enqueued.
    pub async fn dequeue_build(&mut self, ctx: &Context, build: &Build) -> Result<bool> {
        let guard = self.write_lock(&ctx.pool).acquire_write().await?;
        self.reload(&ctx.pool).await?;

        let before = self.enqueued_builds.len();
        self.enqueued_builds.retain(|uuid| uuid != &build.uuid);
        if self.enqueued_builds.len() == before {
            guard.release().await?;
            return Ok(false);
        }

        self.queue_count = self.enqueued_builds.len() as i64;
        SlaveRepo::set_queue(&ctx.pool, &self.id, &self.enqueued_builds, self.queue_count)
            .await?;
        guard.release().await?;
        Ok(true)
    }

    pub async fn add_running_repo(
        &mut self,
        ctx: &Context,
        repository_id: &RepositoryId,
    ) -> Result<()> {
        let guard = self.write_lock(&ctx.pool).acquire_write().await?;
        self.reload(&ctx.pool).await?;

        let key = repository_id.to_string();
        if !self.running_repos.contains(&key) {
            self.running_repos.push(key);
        }
        self.running_count = self.running_repos.len() as i64;
        SlaveRepo::set_running(&ctx.pool, &self.id, &self.running_repos, self.running_count)
            .await?;
        guard.release().await?;
        Ok(())
    }

    pub async fn rm_running_repo(
        &mut self,
        ctx: &Context,
        repository_id: &RepositoryId,
    ) -> Result<()> {
        let guard = self.write_lock(&ctx.pool).acquire_write().await?;
        self.reload(&ctx.pool).await?;

        let key = repository_id.to_string();
        self.running_repos.retain(|r| r != &key);
        self.running_count = self.running_repos.len() as i64;
        SlaveRepo::set_running(&ctx.pool, &self.id, &self.running_repos, self.running_count)
            .await?;
        guard.release().await?;
        Ok(())
    }

    // Instance lifecycle.

    /// Starts the cloud instance behind an on-demand slave and waits its
    /// service. Returns the instance IP, or `None` for a permanent slave.
    pub async fn start_instance(&mut self, ctx: &Context) -> Result<Option<String>> {
        if !self.on_demand {
            return Ok(None);
        }

        let instance_type = self.instance_type.ok_or_else(|| {
            BellowsError::Instance(format!("on-demand slave {} without instance_type", self.name))
        })?;
        let instance = (ctx.instances)(instance_type, &self.instance_confs)?;

        if instance.is_running().await? {
            let ip = instance.get_ip().await?;
            if self.host == DYNAMIC_HOST {
                self.host = ip.clone();
                SlaveRepo::set_host(&ctx.pool, &self.id, &ip).await?;
            }
            self.wait_service_start(&ctx.settings).await?;
            return Ok(Some(ip));
        }

        tracing::info!("Starting instance for slave {}", self.name);
        instance.start().await?;
        let ip = instance.get_ip().await?;
        self.host = ip.clone();
        SlaveRepo::set_host(&ctx.pool, &self.id, &ip).await?;
        self.wait_service_start(&ctx.settings).await?;
        Ok(Some(ip))
    }

    /// Stops the instance behind an idle on-demand slave. A slave with
    /// queued or running work is left alone.
    pub async fn stop_instance(&self, ctx: &Context) -> Result<bool> {
        if !self.on_demand {
            return Ok(false);
        }

        if self.queue_count > 0 || self.running_count > 0 {
            tracing::debug!(
                "Slave {} still busy (queue {}, running {}); not stopping",
                self.name,
                self.queue_count,
                self.running_count
            );
            return Ok(false);
        }

        let instance_type = self.instance_type.ok_or_else(|| {
            BellowsError::Instance(format!("on-demand slave {} without instance_type", self.name))
        })?;
        let instance = (ctx.instances)(instance_type, &self.instance_confs)?;

        if !instance.is_running().await? {
            return Ok(false);
        }

        tracing::info!("Stopping instance for slave {}", self.name);
        instance.stop().await?;
        Ok(true)
    }

    // The build session.

    /// Runs one build on this slave: opens the stream and translates each
    /// frame into durable state. Returns false when the build ended in an
    /// exception instead of a slave-reported status.
    pub async fn build(
        &mut self,
        ctx: &Context,
        build: &mut Build,
        envvars: HashMap<String, String>,
    ) -> Result<bool> {
        self.build_with_timeout(ctx, build, envvars, Some(UNRESPONSIVE_TIMEOUT))
            .await
    }

    /// Like [`Slave::build`], with an explicit bound on the request write
    /// and each stream read.
    pub async fn build_with_timeout(
        &mut self,
        ctx: &Context,
        build: &mut Build,
        envvars: HashMap<String, String>,
        unresponsive_timeout: Option<Duration>,
    ) -> Result<bool> {
        // The build leaves the waiting queue and its repository counts as
        // running on this slave for the whole session.
        self.dequeue_build(ctx, build).await?;
        self.add_running_repo(ctx, &build.repository_id).await?;

        let result = self
            .locked_build(ctx, build, envvars, unresponsive_timeout)
            .await;

        if let Err(e) = self.rm_running_repo(ctx, &build.repository_id).await {
            tracing::error!("Failed to clear running repo on {}: {}", self.name, e);
        }

        result
    }

    async fn locked_build(
        &mut self,
        ctx: &Context,
        build: &mut Build,
        envvars: HashMap<String, String>,
        unresponsive_timeout: Option<Duration>,
    ) -> Result<bool> {
        let guard = self.write_lock(&ctx.pool).acquire_write().await?;

        build.status = BuildStatus::Preparing;
        build.update(&ctx.pool).await?;
        let repo = Repository::get(&ctx.pool, &build.repository_id).await?;

        if let Err(e) = self.start_instance(ctx).await {
            self.finish_build_start_exception(ctx, build, &e.to_string())
                .await;
            guard.release().await?;
            return Ok(false);
        }

        let session = self
            .run_build_session(ctx, build, &repo, envvars, unresponsive_timeout)
            .await;
        guard.release().await?;

        match session {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::error!("Build {} failed on {}: {}", build.uuid, self.name, e);
                if let Err(persist) = build.set_unknown_exception(&ctx.pool, &e.to_string()).await
                {
                    tracing::error!(
                        "Failed to persist exception for build {}: {}",
                        build.uuid,
                        persist
                    );
                }
                Ok(false)
            }
        }
    }

    async fn run_build_session(
        &self,
        ctx: &Context,
        build: &mut Build,
        repo: &Repository,
        envvars: HashMap<String, String>,
        unresponsive_timeout: Option<Duration>,
    ) -> Result<()> {
        tracing::debug!("Starting build {} on {}", build.uuid, self.name);
        let client = self.get_client(&ctx.settings).await?;

        let mut body = json!({
            "repo_url": repo.url,
            "build_uuid": build.uuid.to_string(),
            "envvars": envvars,
            "repo_id": repo.id.to_string(),
            "vcs_type": repo.vcs_type,
            "branch": build.branch,
            "named_tree": build.named_tree,
            "builder_name": build.builder_name,
            "builders_from": build.builders_from,
        });
        if let Some(external) = &build.external {
            body["external"] = serde_json::to_value(external)?;
        }

        let mut stream = client.build(body, unresponsive_timeout).await?;
        while let Some(info) = stream.next_info().await? {
            self.process_info(ctx, build, repo, &info).await?;
        }
        Ok(())
    }

    /// Forwards a cancel request for `build`. No local state changes: the
    /// cancellation flows back as regular stream frames.
    pub async fn cancel_build(&self, ctx: &Context, build: &Build) -> Result<Value> {
        let mut client = self.get_client(&ctx.settings).await?;
        client.cancel_build(&build.uuid.to_string()).await
    }

    // Stream frame processing.

    async fn process_info(
        &self,
        ctx: &Context,
        build: &mut Build,
        repo: &Repository,
        info: &Value,
    ) -> Result<bool> {
        match info.get("info_type").and_then(Value::as_str) {
            Some("build_info") => self.process_build_info(ctx, build, info).await,
            Some("step_info") => self.process_step_info(ctx, build, repo, info).await,
            Some("step_output_info") => {
                // Output fragments are best-effort: losing one must not
                // kill the stream.
                match self.process_step_output_info(ctx, build, repo, info).await {
                    Ok(accepted) => Ok(accepted),
                    Err(e) => {
                        tracing::error!(
                            "Error processing step output for build {}: {}",
                            build.uuid,
                            e
                        );
                        Ok(false)
                    }
                }
            }
            other => {
                tracing::warn!("Unknown info_type {:?} for build {}", other, build.uuid);
                Ok(false)
            }
        }
    }

    async fn process_build_info(
        &self,
        ctx: &Context,
        build: &mut Build,
        info: &Value,
    ) -> Result<bool> {
        let status: BuildStatus = match info.get("status").and_then(Value::as_str) {
            Some(s) => s.parse().unwrap_or(build.status),
            None => build.status,
        };
        build.status = status;

        let mut just_started = false;
        let mut just_finished = false;

        if status == BuildStatus::Running && build.started.is_none() {
            build.started = Some(wire_dt_or_now(info, "started"));
            just_started = true;
        }

        if status.is_terminal() && build.finished.is_none() {
            build.finished = Some(wire_dt_or_now(info, "finished"));
            build.total_time = info.get("total_time").and_then(Value::as_i64).or_else(|| {
                match (build.started, build.finished) {
                    (Some(started), Some(finished)) => {
                        Some((finished - started).num_seconds())
                    }
                    _ => None,
                }
            });
            just_finished = true;
        }

        match build.update(&ctx.pool).await {
            Ok(()) => {}
            Err(BellowsError::StaleUpdate(msg)) => {
                tracing::warn!("{}", msg);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        if just_started {
            ctx.signals.send(
                build.repository_id.clone(),
                EventKind::BuildStarted,
                json!({"uuid": build.uuid.to_string()}),
            );
            build.notify(ctx, EventKind::BuildStarted).await;
        }
        if just_finished {
            ctx.signals.send(
                build.repository_id.clone(),
                EventKind::BuildFinished,
                json!({"uuid": build.uuid.to_string()}),
            );
            build.notify(ctx, EventKind::BuildFinished).await;
        }

        Ok(true)
    }

    async fn process_step_info(
        &self,
        ctx: &Context,
        build: &mut Build,
        repo: &Repository,
        info: &Value,
    ) -> Result<bool> {
        let incoming = BuildStep::from_wire(repo.id.clone(), info)?;

        if let Some(step) = build.find_step_mut(&incoming.uuid) {
            // A step that already raised keeps what it printed before the
            // exception; the incoming output is appended after it.
            if incoming.status == StepStatus::Exception
                && !incoming.output.is_empty()
                && !step.output.is_empty()
            {
                step.output = format!("{}{}", step.output, incoming.output);
            } else {
                step.output = incoming.output;
            }
            step.name = incoming.name;
            step.command = incoming.command;
            step.status = incoming.status;
            step.index = incoming.index;
            step.started = incoming.started.or(step.started);
            step.finished = incoming.finished.or(step.finished);
            step.total_time = incoming.total_time.or_else(|| {
                match (step.started, step.finished) {
                    (Some(started), Some(finished)) => Some((finished - started).num_seconds()),
                    _ => None,
                }
            });

            let snapshot = step.clone();
            match BuildStepRepo::update(&ctx.pool, &snapshot).await {
                Ok(()) => {}
                Err(BellowsError::StaleUpdate(msg)) => {
                    tracing::warn!("{}", msg);
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }

            if snapshot.status.is_terminal() {
                ctx.signals.send(
                    repo.id.clone(),
                    EventKind::StepFinished,
                    json!({"uuid": snapshot.uuid.to_string()}),
                );
                ctx.exchanges
                    .publish(snapshot.to_message(&repo.id, EventKind::StepFinished.as_str()))
                    .await;
            }
            return Ok(true);
        }

        match BuildRepo::append_step(&ctx.pool, &build.uuid, &incoming).await {
            Ok(()) => {}
            Err(BellowsError::StaleUpdate(msg)) => {
                tracing::warn!("{}", msg);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        ctx.signals.send(
            repo.id.clone(),
            EventKind::StepStarted,
            json!({"uuid": incoming.uuid.to_string()}),
        );
        ctx.exchanges
            .publish(incoming.to_message(&repo.id, EventKind::StepStarted.as_str()))
            .await;
        build.steps.push(incoming);
        Ok(true)
    }

    async fn process_step_output_info(
        &self,
        ctx: &Context,
        build: &mut Build,
        repo: &Repository,
        info: &Value,
    ) -> Result<bool> {
        let uuid: Uuid = info
            .get("uuid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .parse()?;

        let sequence = info.get("sequence").and_then(Value::as_u64);
        if !self.accept_output_fragment(&uuid, sequence) {
            return Ok(false);
        }

        let chunk = info
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if !self.wait_step_materialised(ctx, build, &uuid).await? {
            tracing::warn!("Output for unknown step {} on build {}", uuid, build.uuid);
            return Ok(false);
        }

        match BuildStepRepo::append_output(&ctx.pool, &uuid, &chunk).await {
            Ok(()) => {}
            Err(BellowsError::StaleUpdate(msg)) => {
                tracing::warn!("{}", msg);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        if let Some(step) = build.find_step_mut(&uuid) {
            step.output.push_str(&chunk);
        }

        ctx.signals.send(
            repo.id.clone(),
            EventKind::StepOutputArrived,
            json!({"uuid": uuid.to_string(), "output": chunk}),
        );
        ctx.exchanges
            .publish(json!({
                "uuid": uuid.to_string(),
                "output": chunk,
                "repository_id": repo.id.to_string(),
                "event_type": EventKind::StepOutputArrived.as_str(),
            }))
            .await;

        Ok(true)
    }

    /// Accepts or rejects an output fragment by its sequence. The cache
    /// is monotone: anything below the last accepted sequence is a
    /// duplicate or a reordered retransmit and is dropped.
    fn accept_output_fragment(&self, uuid: &Uuid, sequence: Option<u64>) -> bool {
        let mut next = self.step_output_seq.entry(*uuid).or_insert(0);
        let sequence = sequence.unwrap_or(*next);
        if sequence < *next {
            return false;
        }
        *next = sequence + 1;
        true
    }

    /// Ensures the step is present in `build.steps`, polling the store a
    /// few times in case its step frame is still being processed.
    async fn wait_step_materialised(
        &self,
        ctx: &Context,
        build: &mut Build,
        uuid: &Uuid,
    ) -> Result<bool> {
        if build.find_step(uuid).is_some() {
            return Ok(true);
        }

        for _ in 0..STEP_WAIT_ATTEMPTS {
            tokio::time::sleep(STEP_WAIT_INTERVAL).await;
            if let Ok(stored) = Build::get(&ctx.pool, &build.uuid).await {
                if let Some(step) = stored.steps.into_iter().find(|s| &s.uuid == uuid) {
                    build.steps.push(step);
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// The build could not even start (instance or service failure). The
    /// build is closed with an exception; a persistence failure here is
    /// only logged since the stream for this build never opened.
    async fn finish_build_start_exception(&self, ctx: &Context, build: &mut Build, trace: &str) {
        if let Err(e) = build.set_unknown_exception(&ctx.pool, trace).await {
            tracing::error!(
                "Failed to persist start exception for build {}: {}",
                build.uuid,
                e
            );
        }
    }
}

fn wire_dt_or_now(info: &Value, key: &'static str) -> chrono::DateTime<Utc> {
    info.get(key)
        .and_then(Value::as_str)
        .and_then(|s| crate::timefmt::parse_wire(key, s).ok())
        .unwrap_or_else(Utc::now)
}
