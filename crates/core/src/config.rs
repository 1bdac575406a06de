use std::env;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Comma-separated list; empty entries are dropped.
fn profiled_env_list(profile: &str, key: &str) -> Vec<String> {
    profiled_env_opt(profile, key)
        .map(|v| split_list(&v))
        .unwrap_or_default()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub postgres: PostgresConfig,
    pub paths: PathsConfig,
    pub poller: PollerConfig,
    pub supervisor: SupervisorConfig,
    pub archive: ArchiveConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `TAPEDECK_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("TAPEDECK_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            postgres: PostgresConfig::from_env_profiled(p),
            paths: PathsConfig::from_env_profiled(p),
            poller: PollerConfig::from_env_profiled(p),
            supervisor: SupervisorConfig::from_env_profiled(p),
            archive: ArchiveConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  postgres:    host={}, db={}", self.postgres.host, self.postgres.database);
        tracing::info!(
            "  paths:       capture_root={}, output_dir={}",
            self.paths.capture_root.display(),
            self.paths.output_dir.display()
        );
        tracing::info!(
            "  poller:      api={}, egress={}, window={}ms",
            self.poller.api_base,
            self.poller.egress_addrs.len(),
            self.poller.window_ms
        );
        tracing::info!(
            "  supervisor:  tick={}s, stop_delay={}s, command={}",
            self.supervisor.tick_secs,
            self.supervisor.stop_delay_secs,
            self.supervisor.capture_program
        );
        tracing::info!(
            "  archive:     check={}s, probe_workers={}",
            self.archive.check_interval_secs,
            self.archive.probe_workers
        );
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Full connection URL; overrides the individual fields when set.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
    /// Connection attempts made before a call site gives up for this cycle.
    pub connect_attempts: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            url: profiled_env_opt(p, "PG_URL"),
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "tapedeck"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 5),
            connect_attempts: profiled_env_u32(p, "PG_CONNECT_ATTEMPTS", 2).max(1),
        }
    }

    pub fn database_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some() || self.username.is_some()
    }
}

// ── Paths ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root holding one directory per capture attempt.
    pub capture_root: PathBuf,
    /// Where merged artifacts and error reports are written.
    pub output_dir: PathBuf,
    /// Capture subprocess logs.
    pub log_dir: PathBuf,
    /// Companion subtitle tree; `None` disables the companion wait.
    pub subtitle_root: Option<PathBuf>,
    pub subtitle_subpath: String,
    /// YAML target catalog used instead of the `targets` table when set.
    pub targets_file: Option<PathBuf>,
}

impl PathsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            capture_root: PathBuf::from(profiled_env_or(p, "CAPTURE_ROOT", "recordings")),
            output_dir: PathBuf::from(profiled_env_or(p, "OUTPUT_DIR", "merged")),
            log_dir: PathBuf::from(profiled_env_or(p, "CAPTURE_LOG_DIR", "logs")),
            subtitle_root: profiled_env_opt(p, "SUBTITLE_ROOT").map(PathBuf::from),
            subtitle_subpath: profiled_env_or(p, "SUBTITLE_SUBPATH", "AKB48/comments"),
            targets_file: profiled_env_opt(p, "TARGETS_FILE").map(PathBuf::from),
        }
    }
}

// ── Poller ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    pub api_base: String,
    /// Local addresses to bind outbound requests to; empty = OS default route only.
    pub egress_addrs: Vec<IpAddr>,
    /// Window the whole target list is spread across.
    pub window_ms: u64,
    /// Lower bound on a cycle's duration.
    pub min_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub queue_capacity: usize,
    pub reload_every_cycles: u64,
    pub flush_interval_ms: u64,
}

impl PollerConfig {
    fn from_env_profiled(p: &str) -> Self {
        let egress_addrs = profiled_env_list(p, "POLLER_EGRESS_ADDRS")
            .iter()
            .filter_map(|raw| match raw.parse::<IpAddr>() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    tracing::warn!(addr = %raw, "ignoring unparsable egress address");
                    None
                }
            })
            .collect();
        Self {
            api_base: profiled_env_or(p, "POLLER_API_BASE", "https://www.showroom-live.com"),
            egress_addrs,
            window_ms: profiled_env_u64(p, "POLLER_WINDOW_MS", 5_000),
            min_interval_ms: profiled_env_u64(p, "POLLER_MIN_INTERVAL_MS", 5_000),
            request_timeout_secs: profiled_env_u64(p, "POLLER_REQUEST_TIMEOUT_SECS", 10),
            queue_capacity: profiled_env_u64(p, "POLLER_QUEUE_CAPACITY", 1_000) as usize,
            reload_every_cycles: profiled_env_u64(p, "POLLER_RELOAD_EVERY_CYCLES", 12).max(1),
            flush_interval_ms: profiled_env_u64(p, "POLLER_FLUSH_INTERVAL_MS", 1_000),
        }
    }
}

// ── Supervisor ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub tick_secs: u64,
    pub adopted_grace_secs: u64,
    pub owned_grace_secs: u64,
    pub stop_delay_secs: u64,
    pub adopted_stop_window_secs: u64,
    pub inactivity_threshold_secs: u64,
    pub kill_wait_secs: u64,
    /// Program started for each capture, e.g. `python3`.
    pub capture_program: String,
    /// Fixed arguments placed before the target's capture name.
    pub capture_args: Vec<String>,
    /// Argument that identifies a capture process in the OS process table.
    pub process_signature: String,
    pub capture_workdir: Option<PathBuf>,
    pub excluded_targets: Vec<String>,
    pub lock_path: PathBuf,
    pub heartbeat_every_ticks: u64,
}

impl SupervisorConfig {
    fn from_env_profiled(p: &str) -> Self {
        let capture_args = match profiled_env_opt(p, "CAPTURE_ARGS") {
            Some(raw) => split_list(&raw),
            None => vec!["-u".to_string(), "showroom.py".to_string()],
        };
        Self {
            tick_secs: profiled_env_u64(p, "SUPERVISOR_TICK_SECS", 3),
            adopted_grace_secs: profiled_env_u64(p, "SUPERVISOR_ADOPTED_GRACE_SECS", 10),
            owned_grace_secs: profiled_env_u64(p, "SUPERVISOR_OWNED_GRACE_SECS", 35),
            stop_delay_secs: profiled_env_u64(p, "SUPERVISOR_STOP_DELAY_SECS", 300),
            adopted_stop_window_secs: profiled_env_u64(p, "SUPERVISOR_ADOPTED_STOP_WINDOW_SECS", 30),
            inactivity_threshold_secs: profiled_env_u64(p, "SUPERVISOR_INACTIVITY_SECS", 120),
            kill_wait_secs: profiled_env_u64(p, "SUPERVISOR_KILL_WAIT_SECS", 3),
            capture_program: profiled_env_or(p, "CAPTURE_PROGRAM", "python3"),
            capture_args,
            process_signature: profiled_env_or(p, "CAPTURE_SIGNATURE", "showroom.py"),
            capture_workdir: profiled_env_opt(p, "CAPTURE_WORKDIR").map(PathBuf::from),
            excluded_targets: profiled_env_list(p, "SUPERVISOR_EXCLUDED_TARGETS"),
            lock_path: PathBuf::from(profiled_env_or(
                p,
                "SUPERVISOR_LOCK_PATH",
                "/tmp/tapedeck-supervisor.lock",
            )),
            heartbeat_every_ticks: profiled_env_u64(p, "SUPERVISOR_HEARTBEAT_EVERY_TICKS", 20).max(1),
        }
    }
}

// ── Archive ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    pub check_interval_secs: u64,
    pub live_check_interval_secs: u64,
    pub min_segments_for_check: usize,
    pub segment_stable_secs: u64,
    pub final_inactive_secs: u64,
    pub probe_workers: usize,
    pub probe_timeout_secs: u64,
    pub probe_program: String,
    pub concat_program: String,
    pub concat_timeout_secs: u64,
    pub continuity_secs: u64,
    pub dir_fallback_secs: u64,
    pub max_dirs_per_session: usize,
    pub companion_attempts: u32,
    pub retention_secs: u64,
    pub merge_retry_secs: u64,
    /// Command handed the artifact path after a successful merge.
    pub post_merge_command: Option<String>,
}

impl ArchiveConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            check_interval_secs: profiled_env_u64(p, "ARCHIVE_CHECK_INTERVAL_SECS", 30),
            live_check_interval_secs: profiled_env_u64(p, "ARCHIVE_LIVE_CHECK_INTERVAL_SECS", 90),
            min_segments_for_check: profiled_env_u64(p, "ARCHIVE_MIN_SEGMENTS", 5) as usize,
            segment_stable_secs: profiled_env_u64(p, "ARCHIVE_SEGMENT_STABLE_SECS", 5),
            final_inactive_secs: profiled_env_u64(p, "ARCHIVE_FINAL_INACTIVE_SECS", 60),
            probe_workers: (profiled_env_u64(p, "ARCHIVE_PROBE_WORKERS", 16) as usize).max(1),
            probe_timeout_secs: profiled_env_u64(p, "ARCHIVE_PROBE_TIMEOUT_SECS", 10),
            probe_program: profiled_env_or(p, "ARCHIVE_PROBE_PROGRAM", "ffprobe"),
            concat_program: profiled_env_or(p, "ARCHIVE_CONCAT_PROGRAM", "ffmpeg"),
            concat_timeout_secs: profiled_env_u64(p, "ARCHIVE_CONCAT_TIMEOUT_SECS", 7_200),
            continuity_secs: profiled_env_u64(p, "ARCHIVE_CONTINUITY_SECS", 300),
            dir_fallback_secs: profiled_env_u64(p, "ARCHIVE_DIR_FALLBACK_SECS", 14_400),
            max_dirs_per_session: profiled_env_u64(p, "ARCHIVE_MAX_DIRS_PER_SESSION", 50) as usize,
            companion_attempts: profiled_env_u32(p, "ARCHIVE_COMPANION_ATTEMPTS", 5),
            retention_secs: profiled_env_u64(p, "ARCHIVE_RETENTION_SECS", 120),
            merge_retry_secs: profiled_env_u64(p, "ARCHIVE_MERGE_RETRY_SECS", 300),
            post_merge_command: profiled_env_opt(p, "ARCHIVE_POST_MERGE_COMMAND"),
        }
    }
}
