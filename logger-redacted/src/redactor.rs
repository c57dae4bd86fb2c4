use crate::error::{LoggerError, Result};
use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::io;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

lazy_static! {
    // `<prefix>_<hex secret>` as handed out to callers
    static ref API_KEY_REGEX: std::result::Result<Regex, regex::Error> =
        Regex::new(r"\b([A-Za-z0-9]+)_[0-9a-fA-F]{32,}\b");
    // SHA-256 / SHA-512 hex digests used as credential identifiers
    static ref HEX_DIGEST_REGEX: std::result::Result<Regex, regex::Error> =
        Regex::new(r"\b[0-9a-fA-F]{64,}\b");
}

fn group<'t>(caps: &regex::Captures<'t>, index: usize) -> &'t str {
    caps.get(index).map_or("", |m| m.as_str())
}

fn builtin(pattern: &std::result::Result<Regex, regex::Error>) -> Result<Regex> {
    pattern
        .clone()
        .map_err(|e| LoggerError::InvalidPattern(e.to_string()))
}

/// Short, stable correlation tag for a credential hash.
///
/// Log lines carry this instead of the hash so that two events about the
/// same credential can be joined without the identifier itself leaking.
pub fn fingerprint(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let prefix: Vec<u8> = hasher.finalize().iter().take(8).copied().collect();
    general_purpose::URL_SAFE_NO_PAD.encode(prefix)
}

/// Credential redaction configuration
#[derive(Debug, Clone)]
pub struct RedactionConfig {
    pub redact_api_keys: bool,
    pub redact_digests: bool,
    pub hash_for_correlation: bool,
    /// Extra `(pattern, replacement)` pairs applied after the built-in rules
    pub custom_patterns: Vec<(String, String)>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            redact_api_keys: true,
            redact_digests: true,
            hash_for_correlation: true,
            custom_patterns: Vec::new(),
        }
    }
}

/// Removes credential material from free-form text
#[derive(Debug, Clone)]
pub struct CredentialRedactor {
    config: RedactionConfig,
    api_key: Regex,
    digest: Regex,
    custom: Vec<(Regex, String)>,
}

impl CredentialRedactor {
    /// # Errors
    ///
    /// Returns [`LoggerError::InvalidPattern`] if a custom pattern does not
    /// compile.
    pub fn new(config: RedactionConfig) -> Result<Self> {
        let custom = config
            .custom_patterns
            .iter()
            .map(|(pattern, replacement)| {
                Regex::new(pattern)
                    .map(|regex| (regex, replacement.clone()))
                    .map_err(|e| LoggerError::InvalidPattern(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            api_key: builtin(&API_KEY_REGEX)?,
            digest: builtin(&HEX_DIGEST_REGEX)?,
            custom,
            config,
        })
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();

        // Keys first: their suffix would otherwise be caught as a digest
        if self.config.redact_api_keys {
            result = self.redact_api_keys(&result);
        }

        if self.config.redact_digests {
            result = self.redact_digests(&result);
        }

        for (pattern, replacement) in &self.custom {
            result = pattern.replace_all(&result, replacement.as_str()).to_string();
        }

        result
    }

    fn redact_api_keys(&self, text: &str) -> String {
        self.api_key
            .replace_all(text, |caps: &regex::Captures| {
                if self.config.hash_for_correlation {
                    format!("KEY[{}]", fingerprint(group(caps, 0)))
                } else {
                    format!("{}_****", group(caps, 1))
                }
            })
            .to_string()
    }

    fn redact_digests(&self, text: &str) -> String {
        self.digest
            .replace_all(text, |caps: &regex::Captures| {
                if self.config.hash_for_correlation {
                    format!("HASH[{}]", fingerprint(group(caps, 0)))
                } else {
                    "HASH[****]".to_string()
                }
            })
            .to_string()
    }
}

/// `MakeWriter` adapter that redacts every formatted event before it
/// reaches the wrapped writer.
pub struct RedactingMakeWriter<M> {
    inner: M,
    redactor: Option<Arc<CredentialRedactor>>,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M, redactor: Option<CredentialRedactor>) -> Self {
        Self {
            inner,
            redactor: redactor.map(Arc::new),
        }
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for RedactingMakeWriter<M> {
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            redactor: self.redactor.clone(),
        }
    }
}

pub struct RedactingWriter<W> {
    inner: W,
    redactor: Option<Arc<CredentialRedactor>>,
}

impl<W> RedactingWriter<W> {
    pub fn new(inner: W, redactor: Option<Arc<CredentialRedactor>>) -> Self {
        Self { inner, redactor }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: io::Write> io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &self.redactor {
            Some(redactor) => {
                // fmt hands over one fully formatted event per call
                let redacted = redactor.redact(&String::from_utf8_lossy(buf));
                self.inner.write_all(redacted.as_bytes())?;
                Ok(buf.len())
            }
            None => self.inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
