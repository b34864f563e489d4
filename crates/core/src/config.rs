//! Configuration types shared across crates.
//!
//! Two documents feed the process: the server config (bind address,
//! database, stores, peer librarians) and the background config (a list of
//! typed task descriptors). Unknown task kinds and unknown keys inside a
//! task entry are configuration errors.

use crate::transfer::{DeletionPolicy, Transport};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use time::Duration;

/// A period or timeout, accepted as `"HH:MM:SS"` or an integer number of
/// seconds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cadence(Duration);

impl Cadence {
    pub fn from_seconds(secs: i64) -> crate::Result<Self> {
        if secs <= 0 {
            return Err(crate::Error::InvalidDuration(format!(
                "duration must be positive, got {secs}s"
            )));
        }
        Ok(Self(Duration::seconds(secs)))
    }

    /// Parse `"HH:MM:SS"` (hours may exceed 24) or a plain seconds count.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let secs = match parts.as_slice() {
            [h, m, sec] => {
                let h: i64 = h
                    .parse()
                    .map_err(|_| crate::Error::InvalidDuration(s.to_string()))?;
                let m: i64 = m
                    .parse()
                    .map_err(|_| crate::Error::InvalidDuration(s.to_string()))?;
                let sec: i64 = sec
                    .parse()
                    .map_err(|_| crate::Error::InvalidDuration(s.to_string()))?;
                if !(0..60).contains(&m) || !(0..60).contains(&sec) {
                    return Err(crate::Error::InvalidDuration(s.to_string()));
                }
                h * 3600 + m * 60 + sec
            }
            [secs] => secs
                .parse()
                .map_err(|_| crate::Error::InvalidDuration(s.to_string()))?,
            _ => return Err(crate::Error::InvalidDuration(s.to_string())),
        };
        Self::from_seconds(secs)
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_std(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.0.whole_seconds().max(0) as u64)
    }
}

impl fmt::Debug for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cadence({self})")
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.0.whole_seconds();
        write!(f, "{:02}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
    }
}

impl Serialize for Cadence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cadence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(i64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Cadence::from_seconds(secs).map_err(D::Error::custom),
            Raw::Text(s) => Cadence::parse(&s).map_err(D::Error::custom),
        }
    }
}

/// Top-level application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// This librarian's federation-unique name.
    pub name: String,
    #[serde(default)]
    pub server: HttpConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
    #[serde(default)]
    pub librarians: Vec<PeerConfig>,
    #[serde(default)]
    pub background: BackgroundConfig,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// How long a cached instance checksum stays fresh before integrity
    /// checks recompute it.
    #[serde(default = "default_checksum_cache_timeout")]
    pub checksum_cache_timeout: Cadence,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_checksum_cache_timeout() -> Cadence {
    // 7 days
    Cadence::from_seconds(7 * 24 * 3600).unwrap()
}

impl AppConfig {
    /// Validate cross-field invariants.
    pub fn validate(&self) -> Result<(), String> {
        let mut store_names = std::collections::HashSet::new();
        for store in &self.stores {
            if !store_names.insert(store.name.as_str()) {
                return Err(format!("duplicate store name: {}", store.name));
            }
        }
        let mut librarian_names = std::collections::HashSet::new();
        for peer in &self.librarians {
            if !librarian_names.insert(peer.name.as_str()) {
                return Err(format!("duplicate librarian name: {}", peer.name));
            }
            if peer.name == self.name {
                return Err(format!(
                    "librarian list must not contain ourselves: {}",
                    peer.name
                ));
            }
        }
        for task in &self.background.tasks {
            for store in task.store_references() {
                if !store_names.contains(store) {
                    return Err(format!(
                        "task {} references unknown store: {store}",
                        task.task_name()
                    ));
                }
            }
            if let Some(peer) = task.librarian_reference() {
                if !librarian_names.contains(peer) {
                    return Err(format!(
                        "task {} references unknown librarian: {peer}",
                        task.task_name()
                    ));
                }
            }
        }
        Ok(())
    }

    /// A minimal in-memory configuration for tests.
    pub fn for_testing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            server: HttpConfig::default(),
            database: DatabaseConfig::Sqlite {
                path: PathBuf::from(":memory:"),
            },
            stores: Vec::new(),
            librarians: Vec::new(),
            background: BackgroundConfig::default(),
            metrics_enabled: false,
            checksum_cache_timeout: default_checksum_cache_timeout(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Catalog database configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite {
        /// Database file path (`:memory:` for tests).
        path: PathBuf,
    },
}

/// A local store and its backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    pub name: String,
    pub backend: StoreBackendConfig,
    pub capacity_bytes: u64,
    /// Whether ingest and incoming transfers may pick this store.
    #[serde(default = "default_true")]
    pub ingestable: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Store backend kind. Only the local filesystem backend is constructible;
/// the remote kinds are placeholders for external byte movers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreBackendConfig {
    Filesystem {
        root: PathBuf,
        /// Staging subtree; defaults to `<root>/.staging`.
        staging: Option<PathBuf>,
    },
    Rsync {
        host: String,
        root: PathBuf,
    },
    Globus {
        endpoint: String,
        root: PathBuf,
    },
}

/// A known peer librarian.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub url: String,
    pub auth_token: String,
    #[serde(default = "default_transports")]
    pub transports: Vec<Transport>,
}

fn default_transports() -> Vec<Transport> {
    vec![Transport::Network]
}

/// Background task hosting configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// When false the server process runs ingest only and a separate
    /// background-only process hosts the tasks.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tasks: Vec::new(),
        }
    }
}

fn default_soft_timeout() -> Cadence {
    // 10 minutes
    Cadence::from_seconds(600).unwrap()
}

fn default_files_per_run() -> u32 {
    1024
}

fn default_send_batch_size() -> u32 {
    128
}

fn default_queue_batch_size() -> u32 {
    16
}

fn default_claim_ttl() -> Cadence {
    Cadence::from_seconds(3600).unwrap()
}

fn default_warn_disabled_days() -> u32 {
    7
}

fn default_deletion_policy() -> DeletionPolicy {
    DeletionPolicy::Disallowed
}

/// A configured background task instance. The `task` key selects the kind;
/// several instances of the same kind may be configured with different
/// parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskConfig {
    CheckIntegrity(CheckIntegrityConfig),
    CreateLocalClone(CreateLocalCloneConfig),
    SendClone(SendCloneConfig),
    ConsumeQueue(ConsumeQueueConfig),
    CheckConsumedQueue(CheckConsumedQueueConfig),
    ReceiveClone(ReceiveCloneConfig),
    IncomingTransferHypervisor(IncomingTransferHypervisorConfig),
    OutgoingTransferHypervisor(OutgoingTransferHypervisorConfig),
    DuplicateRemoteInstanceHypervisor(DuplicateRemoteInstanceHypervisorConfig),
    RollingDeletion(RollingDeletionConfig),
    CorruptionFixer(CorruptionFixerConfig),
}

impl TaskConfig {
    /// The task kind, as spelled in configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CheckIntegrity(_) => "check_integrity",
            Self::CreateLocalClone(_) => "create_local_clone",
            Self::SendClone(_) => "send_clone",
            Self::ConsumeQueue(_) => "consume_queue",
            Self::CheckConsumedQueue(_) => "check_consumed_queue",
            Self::ReceiveClone(_) => "receive_clone",
            Self::IncomingTransferHypervisor(_) => "incoming_transfer_hypervisor",
            Self::OutgoingTransferHypervisor(_) => "outgoing_transfer_hypervisor",
            Self::DuplicateRemoteInstanceHypervisor(_) => "duplicate_remote_instance_hypervisor",
            Self::RollingDeletion(_) => "rolling_deletion",
            Self::CorruptionFixer(_) => "corruption_fixer",
        }
    }

    /// Instance name: the configured `task_name`, or the kind.
    pub fn task_name(&self) -> &str {
        let configured = match self {
            Self::CheckIntegrity(c) => &c.task_name,
            Self::CreateLocalClone(c) => &c.task_name,
            Self::SendClone(c) => &c.task_name,
            Self::ConsumeQueue(c) => &c.task_name,
            Self::CheckConsumedQueue(c) => &c.task_name,
            Self::ReceiveClone(c) => &c.task_name,
            Self::IncomingTransferHypervisor(c) => &c.task_name,
            Self::OutgoingTransferHypervisor(c) => &c.task_name,
            Self::DuplicateRemoteInstanceHypervisor(c) => &c.task_name,
            Self::RollingDeletion(c) => &c.task_name,
            Self::CorruptionFixer(c) => &c.task_name,
        };
        configured.as_deref().unwrap_or_else(|| self.kind())
    }

    pub fn every(&self) -> Cadence {
        match self {
            Self::CheckIntegrity(c) => c.every,
            Self::CreateLocalClone(c) => c.every,
            Self::SendClone(c) => c.every,
            Self::ConsumeQueue(c) => c.every,
            Self::CheckConsumedQueue(c) => c.every,
            Self::ReceiveClone(c) => c.every,
            Self::IncomingTransferHypervisor(c) => c.every,
            Self::OutgoingTransferHypervisor(c) => c.every,
            Self::DuplicateRemoteInstanceHypervisor(c) => c.every,
            Self::RollingDeletion(c) => c.every,
            Self::CorruptionFixer(c) => c.every,
        }
    }

    pub fn soft_timeout(&self) -> Cadence {
        match self {
            Self::CheckIntegrity(c) => c.soft_timeout,
            Self::CreateLocalClone(c) => c.soft_timeout,
            Self::SendClone(c) => c.soft_timeout,
            Self::ConsumeQueue(c) => c.soft_timeout,
            Self::CheckConsumedQueue(c) => c.soft_timeout,
            Self::ReceiveClone(c) => c.soft_timeout,
            Self::IncomingTransferHypervisor(c) => c.soft_timeout,
            Self::OutgoingTransferHypervisor(c) => c.soft_timeout,
            Self::DuplicateRemoteInstanceHypervisor(c) => c.soft_timeout,
            Self::RollingDeletion(c) => c.soft_timeout,
            Self::CorruptionFixer(c) => c.soft_timeout,
        }
    }

    /// Store names this task reads or writes, for startup validation.
    pub fn store_references(&self) -> Vec<&str> {
        match self {
            Self::CheckIntegrity(c) => vec![c.store_name.as_str()],
            Self::CreateLocalClone(c) => {
                let mut refs = vec![c.clone_from.as_str()];
                refs.extend(c.clone_to.iter().map(String::as_str));
                refs
            }
            Self::SendClone(c) => c
                .store_preference
                .as_deref()
                .map(|s| vec![s])
                .unwrap_or_default(),
            Self::RollingDeletion(c) => vec![c.store_name.as_str()],
            _ => Vec::new(),
        }
    }

    /// Peer librarian this task targets, for startup validation.
    pub fn librarian_reference(&self) -> Option<&str> {
        match self {
            Self::SendClone(c) => Some(c.destination_librarian.as_str()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckIntegrityConfig {
    #[serde(default)]
    pub task_name: Option<String>,
    pub every: Cadence,
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout: Cadence,
    pub store_name: String,
    /// Only instances created within this window are checked; older ones
    /// are assumed to have been checked on a previous pass.
    pub age_in_days: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateLocalCloneConfig {
    #[serde(default)]
    pub task_name: Option<String>,
    pub every: Cadence,
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout: Cadence,
    pub clone_from: String,
    pub clone_to: Vec<String>,
    pub age_in_days: u32,
    #[serde(default = "default_files_per_run")]
    pub files_per_run: u32,
    #[serde(default)]
    pub disable_store_on_full: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendCloneConfig {
    #[serde(default)]
    pub task_name: Option<String>,
    pub every: Cadence,
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout: Cadence,
    pub destination_librarian: String,
    pub age_in_days: u32,
    #[serde(default)]
    pub store_preference: Option<String>,
    #[serde(default = "default_send_batch_size")]
    pub send_batch_size: u32,
    /// Days a destination may stay transfer-disabled before a notification
    /// is emitted.
    #[serde(default = "default_warn_disabled_days")]
    pub warn_disabled_timer: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumeQueueConfig {
    #[serde(default)]
    pub task_name: Option<String>,
    pub every: Cadence,
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout: Cadence,
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl: Cadence,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckConsumedQueueConfig {
    #[serde(default)]
    pub task_name: Option<String>,
    pub every: Cadence,
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout: Cadence,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiveCloneConfig {
    #[serde(default)]
    pub task_name: Option<String>,
    pub every: Cadence,
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout: Cadence,
    /// Deletion policy stamped onto instances created from received clones.
    #[serde(default = "default_deletion_policy")]
    pub deletion_policy: DeletionPolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IncomingTransferHypervisorConfig {
    #[serde(default)]
    pub task_name: Option<String>,
    pub every: Cadence,
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout: Cadence,
    pub age_in_days: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutgoingTransferHypervisorConfig {
    #[serde(default)]
    pub task_name: Option<String>,
    pub every: Cadence,
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout: Cadence,
    pub age_in_days: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DuplicateRemoteInstanceHypervisorConfig {
    #[serde(default)]
    pub task_name: Option<String>,
    pub every: Cadence,
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout: Cadence,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollingDeletionConfig {
    #[serde(default)]
    pub task_name: Option<String>,
    pub every: Cadence,
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout: Cadence,
    pub store_name: String,
    pub age_in_days: u32,
    pub number_of_remote_copies: u32,
    #[serde(default = "default_true")]
    pub verify_downstream_checksums: bool,
    /// Soft-delete (mark unavailable) instead of removing bytes and row.
    #[serde(default = "default_true")]
    pub mark_unavailable: bool,
    /// Ignore per-instance deletion policy.
    #[serde(default)]
    pub force_deletion: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorruptionFixerConfig {
    #[serde(default)]
    pub task_name: Option<String>,
    pub every: Cadence,
    #[serde(default = "default_soft_timeout")]
    pub soft_timeout: Cadence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence_parse_forms() {
        assert_eq!(
            Cadence::parse("01:30:00").unwrap().as_std(),
            std::time::Duration::from_secs(5400)
        );
        assert_eq!(
            Cadence::parse("3600").unwrap().as_std(),
            std::time::Duration::from_secs(3600)
        );
        assert_eq!(
            Cadence::parse("48:00:00").unwrap().as_std(),
            std::time::Duration::from_secs(48 * 3600)
        );
        assert!(Cadence::parse("0").is_err());
        assert!(Cadence::parse("-5").is_err());
        assert!(Cadence::parse("1:99:00").is_err());
        assert!(Cadence::parse("a:b:c").is_err());
    }

    #[test]
    fn test_cadence_display_roundtrip() {
        let c = Cadence::parse("26:03:07").unwrap();
        assert_eq!(c.to_string(), "26:03:07");
        assert_eq!(Cadence::parse(&c.to_string()).unwrap(), c);
    }

    #[test]
    fn test_task_config_from_toml() {
        let toml = r#"
            task = "rolling_deletion"
            every = "24:00:00"
            store_name = "primary"
            age_in_days = 30
            number_of_remote_copies = 2
        "#;
        let task: TaskConfig = toml::from_str(toml).unwrap();
        assert_eq!(task.kind(), "rolling_deletion");
        assert_eq!(task.task_name(), "rolling_deletion");
        match &task {
            TaskConfig::RollingDeletion(c) => {
                assert_eq!(c.number_of_remote_copies, 2);
                assert!(c.verify_downstream_checksums);
                assert!(c.mark_unavailable);
                assert!(!c.force_deletion);
            }
            other => panic!("unexpected task kind: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_task_kind_rejected() {
        let toml = r#"
            task = "defragment_everything"
            every = "01:00:00"
        "#;
        assert!(toml::from_str::<TaskConfig>(toml).is_err());
    }

    #[test]
    fn test_unknown_task_key_rejected() {
        let toml = r#"
            task = "corruption_fixer"
            every = "01:00:00"
            aggressiveness = 11
        "#;
        assert!(toml::from_str::<TaskConfig>(toml).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_store_reference() {
        let mut config = AppConfig::for_testing("site-a");
        config
            .background
            .tasks
            .push(TaskConfig::CheckIntegrity(CheckIntegrityConfig {
                task_name: None,
                every: Cadence::parse("01:00:00").unwrap(),
                soft_timeout: default_soft_timeout(),
                store_name: "nonexistent".to_string(),
                age_in_days: 7,
            }));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_stores() {
        let mut config = AppConfig::for_testing("site-a");
        for _ in 0..2 {
            config.stores.push(StoreConfig {
                name: "primary".to_string(),
                backend: StoreBackendConfig::Filesystem {
                    root: PathBuf::from("/data"),
                    staging: None,
                },
                capacity_bytes: 1024,
                ingestable: true,
                enabled: true,
            });
        }
        assert!(config.validate().is_err());
    }
}
