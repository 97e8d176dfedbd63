use std::path::PathBuf;
use std::time::Duration;

/// Application-level constants
pub const APP_NAME: &str = "Codessa";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tracing filter when RUST_LOG is unset.
pub fn default_log_filter() -> String {
    "codessa=info,tower_http=warn".to_string()
}

/// Get the application data directory
/// ~/Codessa/ on all platforms (user-visible, per design requirement)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join("Codessa")
}

/// Get the default database path
pub fn database_path() -> PathBuf {
    app_data_dir().join("codessa.db")
}

// ═══════════════════════════════════════════════════════════
// Pipeline tuning
// ═══════════════════════════════════════════════════════════

/// Per-stage timeout for external collaborator calls.
/// Expiry counts as a transient failure subject to the retry policy.
pub const STAGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Maximum attempts per stage before the job fails.
pub const MAX_STAGE_ATTEMPTS: u32 = 3;

/// Base delay for stage retry backoff (doubled per attempt, jittered).
pub const STAGE_RETRY_BASE: Duration = Duration::from_millis(500);

/// Cap for stage retry backoff.
pub const STAGE_RETRY_CAP: Duration = Duration::from_secs(30);

// ═══════════════════════════════════════════════════════════
// Status distribution
// ═══════════════════════════════════════════════════════════

/// Push-channel heartbeat interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Client-side polling interval once the watcher degrades to polling.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Push reconnect attempts before falling back to polling.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Cap on push reconnect backoff.
pub const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(10);

// ═══════════════════════════════════════════════════════════
// Webhook delivery
// ═══════════════════════════════════════════════════════════

/// Base delay for webhook retry backoff.
pub const WEBHOOK_RETRY_BASE: Duration = Duration::from_secs(30);

/// Cap on webhook retry backoff.
pub const WEBHOOK_RETRY_CAP: Duration = Duration::from_secs(3600);

/// Maximum delivery attempts before a row is marked failed permanently.
pub const WEBHOOK_MAX_ATTEMPTS: u32 = 8;

/// How long a worker's claim on a delivery row lasts.
pub const WEBHOOK_CLAIM_LEASE: Duration = Duration::from_secs(120);

/// How often the delivery worker scans for due rows.
pub const WEBHOOK_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Per-request timeout for webhook POSTs.
pub const WEBHOOK_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Environment-derived settings for the server binary.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the API server binds to.
    pub bind_addr: String,
    /// Base URL of the text-extraction service.
    pub extractor_url: String,
    /// Base URL of the de-identification service.
    pub deidentifier_url: String,
    /// Base URL of the code-inference/analysis service.
    pub analyzer_url: String,
}

impl Settings {
    /// Read settings from the environment, with local-dev defaults.
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("CODESSA_BIND")
                .unwrap_or_else(|_| "127.0.0.1:7430".to_string()),
            extractor_url: std::env::var("CODESSA_EXTRACTOR_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:7431".to_string()),
            deidentifier_url: std::env::var("CODESSA_DEIDENTIFIER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:7432".to_string()),
            analyzer_url: std::env::var("CODESSA_ANALYZER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:7433".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_under_home() {
        let dir = app_data_dir();
        let home = dirs::home_dir().unwrap();
        assert!(dir.starts_with(home));
        assert!(dir.ends_with("Codessa"));
    }

    #[test]
    fn database_path_under_app_data() {
        let db = database_path();
        assert!(db.starts_with(app_data_dir()));
    }

    #[test]
    fn stage_retry_base_below_cap() {
        assert!(STAGE_RETRY_BASE < STAGE_RETRY_CAP);
    }

    #[test]
    fn webhook_retry_base_below_cap() {
        assert!(WEBHOOK_RETRY_BASE < WEBHOOK_RETRY_CAP);
    }
}
