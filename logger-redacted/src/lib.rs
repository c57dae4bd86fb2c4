//! Structured logging with credential redaction
//!
//! Credential identifiers are one-way hashes of caller secrets, but a hash is
//! still a bearer lookup key for the permission cache and must not end up in
//! log aggregation. This crate provides:
//!
//! - **Fingerprints**: [`fingerprint`] turns a credential hash into a short
//!   correlation tag suitable for `tracing` fields
//! - **Text redaction**: [`CredentialRedactor`] scrubs API keys
//!   (`<prefix>_<hex>`) and long hex digests from arbitrary text
//! - **Subscriber setup**: [`init`] installs an `EnvFilter` + `fmt` subscriber
//!   whose output passes through the redactor
//!
//! # Example
//!
//! ```rust,no_run
//! use logger_redacted::{fingerprint, init, LoggerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init(&LoggerConfig::default())?;
//!
//!     let key_hash = "3a9f...";
//!     tracing::info!(key = %fingerprint(key_hash), "Credential disabled");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod redactor;

pub use config::*;
pub use error::*;
pub use redactor::*;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over [`LoggerConfig::log_level`].
///
/// # Errors
///
/// Fails when the filter directive cannot be parsed, a redaction pattern
/// does not compile, or a global subscriber is already installed.
pub fn init(config: &LoggerConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| LoggerError::InvalidFilter(e.to_string()))?;

    let redactor = config
        .redaction_enabled
        .then(|| CredentialRedactor::new(RedactionConfig::default()))
        .transpose()?;
    let writer = RedactingMakeWriter::new(std::io::stdout, redactor);

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(writer))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(writer))
            .try_init()
    };

    result.map_err(|e| LoggerError::AlreadyInitialized(e.to_string()))
}
