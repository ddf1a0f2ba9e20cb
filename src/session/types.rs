//! Session data types

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::sandbox::SandboxHandle;
use crate::config::SessionDefaults;
use crate::core::ExecutionConfig;
use crate::runtime::RuntimePreference;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// A command is executing
    Active,
    /// No command in flight
    Idle,
    /// Close in progress
    Closing,
    /// Terminal
    Closed,
}

impl SessionState {
    /// Whether commands may still run
    pub fn accepts_commands(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::Idle)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Active => write!(f, "active"),
            SessionState::Idle => write!(f, "idle"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Session-create input. Omitted fields fall back to `SessionDefaults`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub language: String,
    pub docker_image: Option<String>,
    pub idle_timeout_minutes: Option<u64>,
    pub max_lifetime_minutes: Option<u64>,
    pub persist_filesystem: Option<bool>,
    #[serde(rename = "memoryLimitMB")]
    pub memory_limit_mb: Option<u64>,
    /// Relative CPU weight; 1024 is one full CPU
    pub cpu_shares: Option<u64>,
    pub runtime_preference: Option<RuntimePreference>,
    /// Provider name, e.g. "docker" or "workspace"
    pub runtime_type: Option<String>,
    /// Serve repeated commands from the result cache
    pub cache_results: bool,
    pub exec_timeout_seconds: Option<u64>,
    pub environment: HashMap<String, String>,
}

impl SessionConfig {
    pub fn new(language: impl Into<String>) -> Self {
        SessionConfig {
            language: language.into(),
            ..Default::default()
        }
    }

    pub fn with_runtime_type(mut self, runtime_type: impl Into<String>) -> Self {
        self.runtime_type = Some(runtime_type.into());
        self
    }

    pub fn with_idle_timeout_minutes(mut self, minutes: u64) -> Self {
        self.idle_timeout_minutes = Some(minutes);
        self
    }

    pub fn with_max_lifetime_minutes(mut self, minutes: u64) -> Self {
        self.max_lifetime_minutes = Some(minutes);
        self
    }

    pub fn with_cache(mut self) -> Self {
        self.cache_results = true;
        self
    }

    pub fn idle_timeout(&self, defaults: &SessionDefaults) -> ChronoDuration {
        minutes(self.idle_timeout_minutes.unwrap_or(defaults.idle_timeout_minutes))
    }

    pub fn max_lifetime(&self, defaults: &SessionDefaults) -> ChronoDuration {
        minutes(self.max_lifetime_minutes.unwrap_or(defaults.max_lifetime_minutes))
    }

    pub fn exec_timeout(&self, defaults: &SessionDefaults) -> Duration {
        Duration::from_secs(self.exec_timeout_seconds.unwrap_or(defaults.exec_timeout_seconds))
    }

    /// Resource limits handed to the sandbox provider
    pub fn limits(&self, base: &ExecutionConfig) -> ExecutionConfig {
        let mut limits = base.clone();
        if let Some(mb) = self.memory_limit_mb {
            limits.memory_limit_mb = mb;
        }
        if let Some(shares) = self.cpu_shares {
            limits.cpu_limit = shares as f64 / 1024.0;
        }
        // A persistent workspace needs a writable root
        if self.persist_filesystem.unwrap_or(false) {
            limits.read_only_filesystem = false;
        }
        limits.environment.extend(self.environment.clone());
        limits
    }
}

fn minutes(m: u64) -> ChronoDuration {
    // Capped at a century so the conversion cannot overflow
    ChronoDuration::minutes(m.min(52_560_000) as i64)
}

/// A live session, owned by the session manager
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    pub sandbox: SandboxHandle,
    pub runtime_type: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: SessionState,
    pub config: SessionConfig,
    pub execution_count: u64,
    /// Commands currently executing
    pub in_flight: u32,
}

impl Session {
    pub fn new(session_id: Uuid, sandbox: SandboxHandle, config: SessionConfig) -> Self {
        let now = Utc::now();
        Session {
            session_id,
            runtime_type: sandbox.provider.clone(),
            sandbox,
            language: config.language.clone(),
            created_at: now,
            last_activity: now,
            state: SessionState::Active,
            config,
            execution_count: 0,
            in_flight: 0,
        }
    }

    /// Idle past the idle timeout or alive past the max lifetime.
    ///
    /// A session with a command in flight is never idle-expired.
    pub fn is_expired(&self, now: DateTime<Utc>, defaults: &SessionDefaults) -> bool {
        let idle = self.in_flight == 0
            && now - self.last_activity > self.config.idle_timeout(defaults);
        let too_old = now - self.created_at > self.config.max_lifetime(defaults);
        idle || too_old
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id,
            runtime_type: self.runtime_type.clone(),
            language: self.language.clone(),
            state: self.state,
            created_at: self.created_at,
            last_activity: self.last_activity,
            execution_count: self.execution_count,
        }
    }

    /// Serializable projection without the live sandbox handle
    pub fn to_data(&self) -> SessionData {
        SessionData {
            session_id: self.session_id,
            runtime_type: self.runtime_type.clone(),
            language: self.language.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            state: self.state,
            config: self.config.clone(),
            execution_count: self.execution_count,
        }
    }

    /// Rebuild from a projection once the sandbox has been re-resolved
    pub fn from_data(data: SessionData, sandbox: SandboxHandle) -> Self {
        Session {
            session_id: data.session_id,
            sandbox,
            runtime_type: data.runtime_type,
            language: data.language,
            created_at: data.created_at,
            last_activity: data.last_activity,
            // Nothing can be in flight after a restore
            state: SessionState::Idle,
            config: data.config,
            execution_count: data.execution_count,
            in_flight: 0,
        }
    }
}

/// Read-only snapshot returned by listing and lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub runtime_type: String,
    pub language: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub execution_count: u64,
}

/// Persisted session projection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub session_id: Uuid,
    pub runtime_type: String,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: SessionState,
    pub config: SessionConfig,
    pub execution_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(config: SessionConfig) -> Session {
        Session::new(Uuid::new_v4(), SandboxHandle::new("id", "fake"), config)
    }

    #[test]
    fn test_config_parses_create_input() {
        let config: SessionConfig = serde_json::from_str(
            r#"{"language":"python","dockerImage":"python:3.11","memoryLimitMB":256,
                "runtimePreference":"security","idleTimeoutMinutes":5}"#,
        )
        .unwrap();

        assert_eq!(config.language, "python");
        assert_eq!(config.docker_image.as_deref(), Some("python:3.11"));
        assert_eq!(config.memory_limit_mb, Some(256));
        assert_eq!(config.runtime_preference, Some(RuntimePreference::Security));
        assert!(!config.cache_results);
    }

    #[test]
    fn test_limits_overlay() {
        let mut config = SessionConfig::new("bash");
        config.memory_limit_mb = Some(128);
        config.cpu_shares = Some(512);
        config.persist_filesystem = Some(true);
        config.environment.insert("A".into(), "1".into());

        let limits = config.limits(&ExecutionConfig::default());
        assert_eq!(limits.memory_limit_mb, 128);
        assert_eq!(limits.cpu_limit, 0.5);
        assert!(!limits.read_only_filesystem);
        assert_eq!(limits.environment["A"], "1");
    }

    #[test]
    fn test_expiry_rules() {
        let defaults = SessionDefaults::default();
        let mut s = session(SessionConfig::new("bash").with_idle_timeout_minutes(10));
        let now = Utc::now();

        s.last_activity = now - ChronoDuration::minutes(11);
        assert!(s.is_expired(now, &defaults));

        s.in_flight = 1;
        assert!(!s.is_expired(now, &defaults));

        s.created_at = now - ChronoDuration::minutes(defaults.max_lifetime_minutes as i64 + 1);
        assert!(s.is_expired(now, &defaults));
    }

    #[test]
    fn test_data_projection_roundtrip() {
        let s = session(SessionConfig::new("bash"));
        let data = s.to_data();
        let json = serde_json::to_string(&data).unwrap();
        assert!(!json.contains("sandbox"));

        let back: SessionData = serde_json::from_str(&json).unwrap();
        let restored = Session::from_data(back, SandboxHandle::new("other", "fake"));
        assert_eq!(restored.session_id, s.session_id);
        assert_eq!(restored.state, SessionState::Idle);
        assert_eq!(restored.sandbox.id, "other");
    }
}
