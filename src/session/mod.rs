//! Session manager - long-lived sandboxes reused across commands
//!
//! The session table is an explicitly owned object: a `DashMap` of
//! per-session locks for lock-free listing and concurrent execution in
//! different sessions, plus one async mutex that serializes membership
//! changes (create / close / restore).
//!
//! State machine: `Active` (command running) <-> `Idle`, then
//! `Closing` -> `Closed`. A closed session is removed from the table before
//! its sandbox is torn down, so no caller observes it mid-close.

mod docker;
mod sandbox;
mod types;
mod workspace;

pub use docker::{DockerSandbox, DOCKER_PROVIDER};
pub use sandbox::{sandbox_name, SandboxHandle, SandboxProvider, SandboxSpec};
pub use types::{Session, SessionConfig, SessionData, SessionInfo, SessionState};
pub use workspace::{WorkspaceSandbox, WORKSPACE_PROVIDER};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::future::Cache;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheKey, ResultCache};
use crate::config::{Config, SessionDefaults};
use crate::core::{ExecutionConfig, RunOutput};
use crate::error::{Error, Result};
use crate::monitor::ResourceMonitor;
use crate::runtime::{RuntimePreference, RuntimeRegistry};

/// How long a closed session id keeps answering "closed" instead of "not found"
const CLOSED_MEMORY: Duration = Duration::from_secs(60 * 60);

/// Build the default provider registry: Docker when the daemon answers,
/// native workspaces always.
pub async fn default_providers(config: &Config) -> RuntimeRegistry<dyn SandboxProvider> {
    let mut providers: RuntimeRegistry<dyn SandboxProvider> = RuntimeRegistry::new();

    match DockerSandbox::connect(&config.container).await {
        Ok(docker) => providers.register(Arc::new(docker)),
        Err(e) => warn!("Docker sessions disabled: {}", e),
    }
    providers.register(Arc::new(WorkspaceSandbox::new(&config.sessions.workspace_root)));

    providers
}

/// Owner of the session table
pub struct SessionManager {
    sessions: DashMap<Uuid, Arc<Mutex<Session>>>,
    membership: tokio::sync::Mutex<()>,
    closed: Cache<Uuid, DateTime<Utc>>,
    providers: Arc<RuntimeRegistry<dyn SandboxProvider>>,
    monitor: Arc<ResourceMonitor>,
    cache: ResultCache,
    defaults: SessionDefaults,
    base_limits: ExecutionConfig,
}

impl SessionManager {
    pub fn new(providers: Arc<RuntimeRegistry<dyn SandboxProvider>>, config: &Config) -> Self {
        let monitor = Arc::new(ResourceMonitor::new(providers.clone(), config.monitor.clone()));
        SessionManager {
            sessions: DashMap::new(),
            membership: tokio::sync::Mutex::new(()),
            closed: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(CLOSED_MEMORY)
                .build(),
            providers,
            monitor,
            cache: ResultCache::from_config(&config.cache),
            defaults: config.sessions.clone(),
            base_limits: config.execution.clone(),
        }
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Pick the provider for a new session.
    ///
    /// An explicit `runtime_type` wins, then a `runtime_preference`, then the
    /// configured default provider, then the balanced choice.
    async fn provider_for(&self, config: &SessionConfig) -> Result<Arc<dyn SandboxProvider>> {
        let language = config.language.as_str();
        if !self.providers.supports(language) {
            return Err(Error::UnsupportedLanguage(language.to_string()));
        }

        if let Some(name) = &config.runtime_type {
            let provider = self
                .providers
                .get(name)
                .ok_or_else(|| Error::InvalidInput(format!("Unknown session runtime: {}", name)))?;
            if !provider.supports(language) {
                return Err(Error::UnsupportedLanguage(format!("{} on {}", language, name)));
            }
            if !provider.is_available().await {
                return Err(Error::NoRuntimeAvailable(name.clone()));
            }
            return Ok(provider);
        }

        if let Some(preference) = config.runtime_preference {
            return self
                .providers
                .select_best(language, preference)
                .await
                .ok_or_else(|| Error::NoRuntimeAvailable(language.to_string()));
        }

        if let Some(provider) = self.providers.get(&self.defaults.default_runtime) {
            if provider.supports(language) && provider.is_available().await {
                return Ok(provider);
            }
        }

        self.providers
            .select_best(language, RuntimePreference::Balanced)
            .await
            .ok_or_else(|| Error::NoRuntimeAvailable(language.to_string()))
    }

    /// Allocate a sandbox and register a new `Active` session
    pub async fn create_session(&self, mut config: SessionConfig) -> Result<SessionInfo> {
        config.language = config.language.trim().to_lowercase();
        if config.language.is_empty() {
            return Err(Error::InvalidInput("Session language is required".to_string()));
        }
        let limits = config.limits(&self.base_limits);
        limits.validate()?;

        // Sandbox creation may pull images; it runs outside the membership lock
        let provider = self.provider_for(&config).await?;
        let session_id = Uuid::new_v4();
        let spec = SandboxSpec {
            session_id,
            language: config.language.clone(),
            image: config.docker_image.clone(),
            persist_filesystem: config.persist_filesystem.unwrap_or(false),
            limits,
        };

        let handle = provider.create(&spec).await?;
        let session = Session::new(session_id, handle, config);
        let info = session.info();

        if let Some(rejected) = self.register(session).await {
            if let Err(e) = provider.destroy(&rejected.sandbox).await {
                warn!("Sandbox {} cleanup failed (ignored): {}", rejected.sandbox, e);
            }
            return Err(Error::Internal(format!("Session id {} already in use", session_id)));
        }

        info!(
            "Session {} created on {} ({})",
            session_id, info.runtime_type, info.language
        );
        Ok(info)
    }

    /// Insert under the membership lock; hands the session back if its id
    /// is already taken
    async fn register(&self, session: Session) -> Option<Session> {
        let _membership = self.membership.lock().await;
        match self.sessions.entry(session.session_id) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(session)));
                None
            }
            Entry::Occupied(_) => Some(session),
        }
    }

    fn entry(&self, session_id: Uuid) -> Result<Arc<Mutex<Session>>> {
        if let Some(entry) = self.sessions.get(&session_id) {
            return Ok(entry.value().clone());
        }
        if self.closed.contains_key(&session_id) {
            return Err(Error::SessionClosed(session_id));
        }
        Err(Error::SessionNotFound(session_id))
    }

    /// Run one command in a session
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn execute_in_session(&self, session_id: Uuid, command: &str) -> Result<RunOutput> {
        let entry = self.entry(session_id)?;

        let (handle, config) = {
            let mut session = entry.lock();
            if !session.state.accepts_commands() {
                return Err(Error::SessionClosed(session_id));
            }
            session.state = SessionState::Active;
            session.last_activity = Utc::now();
            session.in_flight += 1;
            session.execution_count += 1;
            (session.sandbox.clone(), session.config.clone())
        };

        let cache_key = config
            .cache_results
            .then(|| CacheKey::new(session_id.to_string(), &config.language, command));

        let result = match &cache_key {
            Some(key) => match self.cache.get(key).await {
                Some(hit) => Ok(hit),
                None => self.exec_uncached(&handle, command, &config).await,
            },
            None => self.exec_uncached(&handle, command, &config).await,
        };

        {
            let mut session = entry.lock();
            session.in_flight = session.in_flight.saturating_sub(1);
            session.last_activity = Utc::now();
            if session.state == SessionState::Active && session.in_flight == 0 {
                session.state = SessionState::Idle;
            }
        }

        if let (Some(key), Ok(output)) = (cache_key, &result) {
            self.cache.put(key, output.clone()).await;
        }

        result
    }

    async fn exec_uncached(&self, handle: &SandboxHandle, command: &str, config: &SessionConfig) -> Result<RunOutput> {
        let provider = self
            .providers
            .get(&handle.provider)
            .ok_or_else(|| Error::Sandbox(format!("Unknown sandbox provider: {}", handle.provider)))?;

        debug!("Executing in {}", handle);
        provider
            .exec(handle, command, config.exec_timeout(&self.defaults))
            .await
    }

    /// Remove a session and tear down its sandbox
    pub async fn close_session(&self, session_id: Uuid) -> Result<()> {
        let entry = {
            let _membership = self.membership.lock().await;
            match self.sessions.remove(&session_id) {
                Some((_, entry)) => entry,
                None => {
                    return Err(if self.closed.contains_key(&session_id) {
                        Error::SessionClosed(session_id)
                    } else {
                        Error::SessionNotFound(session_id)
                    });
                }
            }
        };
        self.closed.insert(session_id, Utc::now()).await;

        self.teardown(session_id, entry).await;
        Ok(())
    }

    async fn teardown(&self, session_id: Uuid, entry: Arc<Mutex<Session>>) {
        let handle = {
            let mut session = entry.lock();
            session.state = SessionState::Closing;
            session.sandbox.clone()
        };

        match self.providers.get(&handle.provider) {
            Some(provider) => {
                if let Err(e) = provider.destroy(&handle).await {
                    warn!("Sandbox {} cleanup failed (ignored): {}", handle, e);
                }
            }
            None => warn!("No provider '{}' to destroy {}", handle.provider, handle),
        }

        self.monitor.forget(&handle);
        self.cache.invalidate_scope(&session_id.to_string());
        entry.lock().state = SessionState::Closed;

        info!("Session {} closed", session_id);
    }

    /// Snapshot of one session
    pub fn get_session(&self, session_id: Uuid) -> Option<SessionInfo> {
        self.sessions.get(&session_id).map(|entry| entry.lock().info())
    }

    /// Snapshot of every session, oldest first
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.value().lock().info())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every idle-timed-out or over-age session
    pub async fn cleanup_expired(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().lock().is_expired(now, &self.defaults))
            .map(|entry| *entry.key())
            .collect();

        let mut closed = Vec::with_capacity(expired.len());
        for session_id in expired {
            match self.close_session(session_id).await {
                Ok(()) => {
                    info!("Session {} expired", session_id);
                    closed.push(session_id);
                }
                // Closed concurrently by someone else
                Err(e) => debug!("Expiry of {} skipped: {}", session_id, e),
            }
        }
        closed
    }

    /// Sample every session and close those with a terminating violation
    pub async fn check_resources(&self) -> Vec<Uuid> {
        let targets: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| {
                let session = entry.value().lock();
                let memory_mb = session
                    .config
                    .memory_limit_mb
                    .unwrap_or(self.base_limits.memory_limit_mb);
                (
                    session.session_id,
                    session.sandbox.clone(),
                    self.monitor.limits_for(memory_mb),
                )
            })
            .collect();

        let mut terminated = Vec::new();
        for (session_id, violation) in self.monitor.sweep(targets).await {
            if !violation.should_terminate {
                warn!(
                    "Session {}: {} at {:.0} (limit {:.0})",
                    session_id, violation.violation_type, violation.current_value, violation.limit_value
                );
                continue;
            }

            error!(
                "Session {} terminated: {} at {:.0} (limit {:.0})",
                session_id, violation.violation_type, violation.current_value, violation.limit_value
            );
            if self.close_session(session_id).await.is_ok() {
                terminated.push(session_id);
            }
        }
        terminated
    }

    /// Periodic expiry and resource sweep until cancelled
    pub async fn run_maintenance(&self, cancel: CancellationToken) {
        let period = self.defaults.cleanup_interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.cleanup_expired().await;
                    let terminated = self.check_resources().await;
                    if !expired.is_empty() || !terminated.is_empty() {
                        info!(
                            "Maintenance closed {} expired and {} over-limit sessions",
                            expired.len(),
                            terminated.len()
                        );
                    }
                }
            }
        }
        debug!("Session maintenance stopped");
    }

    /// Close every session; returns how many were closed
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<Uuid> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for session_id in ids {
            if self.close_session(session_id).await.is_ok() {
                closed += 1;
            }
        }
        info!("Closed {} sessions on shutdown", closed);
        closed
    }

    /// Serializable projections of every live session
    pub fn export_sessions(&self) -> Vec<SessionData> {
        let mut data: Vec<SessionData> = self
            .sessions
            .iter()
            .map(|entry| entry.value().lock().to_data())
            .collect();
        data.sort_by_key(|d| d.created_at);
        data
    }

    /// Re-register exported sessions whose sandboxes can still be resolved.
    /// Sessions without a live sandbox are dropped.
    pub async fn restore_sessions(&self, data: Vec<SessionData>) -> usize {
        let mut restored = 0;

        for item in data {
            let session_id = item.session_id;
            if !item.state.accepts_commands() || self.sessions.contains_key(&session_id) {
                continue;
            }

            let Some(provider) = self.providers.get(&item.runtime_type) else {
                warn!("Session {}: provider '{}' not registered", session_id, item.runtime_type);
                continue;
            };

            match provider.resolve(session_id).await {
                Ok(Some(handle)) => {
                    if self.register(Session::from_data(item, handle)).await.is_none() {
                        restored += 1;
                    }
                }
                Ok(None) => debug!("Session {} has no live sandbox, dropped", session_id),
                Err(e) => warn!("Session {} could not be resolved: {}", session_id, e),
            }
        }

        info!("Restored {} sessions", restored);
        restored
    }

    /// Write the session table to a JSON file (temp file + rename)
    pub async fn save_snapshot(&self, path: &Path) -> Result<usize> {
        let data = self.export_sessions();
        let bytes = serde_json::to_vec_pretty(&data)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!("Saved {} sessions to {}", data.len(), path.display());
        Ok(data.len())
    }

    /// Restore sessions from a snapshot file; a missing file restores nothing
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let data: Vec<SessionData> = serde_json::from_slice(&bytes)?;
        Ok(self.restore_sessions(data).await)
    }
}
