/// Engine configuration.
///
/// Values are read from environment variables with CLI overrides; every
/// knob has a default that works for a local single-machine deployment.
use std::env;
use std::path::PathBuf;

/// Remote (S3-compatible) secondary replica settings.
#[derive(Debug, Clone)]
pub struct RemoteReplicaConfig {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Database URL for the entity store.
    pub database_url: String,
    /// Root directory of the primary blob store.
    pub primary_root: PathBuf,
    /// Optional local-directory secondary replica root.
    pub secondary_root: Option<PathBuf>,
    /// Optional remote secondary replica (tried after the local one).
    pub remote_replica: Option<RemoteReplicaConfig>,
    /// Path of the symmetric key file (generated on first use).
    pub key_path: PathBuf,
    /// Newest versions kept per (user, filename); older ones are soft-deleted.
    pub retention: usize,
    /// Digits in a one-time restore code.
    pub code_length: usize,
    /// Seconds a one-time code stays valid.
    pub code_ttl_secs: i64,
    /// Whether snapshot restores require a one-time code.
    pub require_code_for_snapshot_restore: bool,
    /// Include the code in the request outcome (debug builds / local testing).
    pub debug_expose_code: bool,
    /// Replication worker poll interval in seconds when the queue is empty.
    pub replication_interval_secs: u64,
    /// Replication tasks fetched per poll.
    pub replication_batch: usize,
    /// Attempts before a replication task is flagged for manual attention.
    pub replication_max_attempts: i64,
    /// Crash-recovery worker poll interval in seconds when the queue is empty.
    pub recovery_interval_secs: u64,
    /// Pending uploads fetched per poll.
    pub recovery_batch: usize,
    /// Attempts before a pending upload is abandoned (with a DR event).
    pub recovery_max_attempts: i64,
    /// Telegram bot token for the notification channel, if configured.
    pub telegram_bot_token: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/drvault.db".into(),
            primary_root: PathBuf::from("./data/primary"),
            secondary_root: None,
            remote_replica: None,
            key_path: PathBuf::from("./data/keys/master.key"),
            retention: 3,
            code_length: 6,
            code_ttl_secs: 300,
            require_code_for_snapshot_restore: true,
            debug_expose_code: false,
            replication_interval_secs: 10,
            replication_batch: 20,
            replication_max_attempts: 10,
            recovery_interval_secs: 8,
            recovery_batch: 20,
            recovery_max_attempts: 10,
            telegram_bot_token: None,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `DRVAULT_*` environment variables on top
    /// of the defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("DRVAULT_DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Ok(v) = env::var("DRVAULT_PRIMARY_ROOT") {
            cfg.primary_root = PathBuf::from(v);
        }
        if let Ok(v) = env::var("DRVAULT_SECONDARY_ROOT") {
            cfg.secondary_root = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("DRVAULT_KEY_PATH") {
            cfg.key_path = PathBuf::from(v);
        }
        if let Some(v) = parse_env("DRVAULT_RETENTION") {
            cfg.retention = v;
        }
        if let Some(v) = parse_env("DRVAULT_CODE_LENGTH") {
            cfg.code_length = v;
        }
        if let Some(v) = parse_env("DRVAULT_CODE_TTL_SECS") {
            cfg.code_ttl_secs = v;
        }
        if let Ok(v) = env::var("DRVAULT_REQUIRE_CODE_FOR_SNAPSHOT_RESTORE") {
            cfg.require_code_for_snapshot_restore = truthy(&v);
        }
        if let Ok(v) = env::var("DRVAULT_DEBUG_EXPOSE_CODE") {
            cfg.debug_expose_code = truthy(&v);
        }
        if let Some(v) = parse_env("DRVAULT_REPLICATION_INTERVAL_SECS") {
            cfg.replication_interval_secs = v;
        }
        if let Some(v) = parse_env("DRVAULT_RECOVERY_INTERVAL_SECS") {
            cfg.recovery_interval_secs = v;
        }
        if let Ok(v) = env::var("DRVAULT_TELEGRAM_BOT_TOKEN") {
            cfg.telegram_bot_token = Some(v);
        }

        // The remote replica only activates when the endpoint is present;
        // partial configuration is ignored rather than guessed at.
        if let Ok(endpoint) = env::var("DRVAULT_REPLICA_S3_ENDPOINT") {
            let access_key_id = env::var("DRVAULT_REPLICA_S3_ACCESS_KEY").unwrap_or_default();
            let secret_access_key = env::var("DRVAULT_REPLICA_S3_SECRET_KEY").unwrap_or_default();
            let bucket = env::var("DRVAULT_REPLICA_S3_BUCKET").unwrap_or_default();
            if !access_key_id.is_empty() && !bucket.is_empty() {
                cfg.remote_replica = Some(RemoteReplicaConfig {
                    endpoint,
                    access_key_id,
                    secret_access_key,
                    bucket,
                    region: env::var("DRVAULT_REPLICA_S3_REGION")
                        .unwrap_or_else(|_| "us-east-1".into()),
                });
            }
        }

        cfg
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn truthy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}
