// Logger configuration
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON lines instead of the human readable format
    #[serde(default)]
    pub json: bool,
    /// Scrub API keys and credential digests from formatted output
    #[serde(default = "default_true")]
    pub redaction_enabled: bool,
}

fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
            redaction_enabled: true,
        }
    }
}
