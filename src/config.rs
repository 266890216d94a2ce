//! Configuration types.
//!
//! Everything is read once at startup by [`RelayConfig::from_env`] and then
//! handed by reference to each component's constructor.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Reply-To handling for forwarded broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyToMode {
    /// Leave the broadcaster's reply address alone.
    #[default]
    Original,
    /// Point replies at the outbound identity.
    List,
}

impl std::str::FromStr for ReplyToMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "original" => Ok(Self::Original),
            "list" => Ok(Self::List),
            other => Err(format!("expected 'original' or 'list', got '{other}'")),
        }
    }
}

/// Source mailbox connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub timeout: Duration,
    /// Largest message body accepted from the server.
    pub max_message_bytes: usize,
}

/// Outbound transport settings.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub timeout: Duration,
}

/// Randomized pacing between sends, in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    pub per_recipient: RangeInclusive<f64>,
    pub per_message: RangeInclusive<f64>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            per_recipient: 1.0..=3.0,
            per_message: 5.0..=12.0,
        }
    }
}

impl ThrottleConfig {
    /// No pauses at all. Used by tests and dry runs.
    pub fn none() -> Self {
        Self {
            per_recipient: 0.0..=0.0,
            per_message: 0.0..=0.0,
        }
    }
}

/// How broadcasts are rewritten for each recipient.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Header `From` on every outbound copy.
    pub from_header: String,
    pub reply_to: ReplyToMode,
    /// Images wider than this are re-encoded down to it.
    pub max_image_width: u32,
    /// Subject prefix for test-probe copies.
    pub subject_marker: String,
}

/// Unsubscribe link settings.
#[derive(Debug, Clone)]
pub struct UnsubscribeConfig {
    pub public_base_url: String,
    pub path: String,
    pub secret: SecretString,
}

/// Full relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub imap: ImapConfig,
    pub smtp: SmtpConfig,
    pub transform: TransformConfig,
    pub unsubscribe: UnsubscribeConfig,
    pub throttle: ThrottleConfig,
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    /// Broadcasters, matched as case-insensitive substrings of `From`.
    pub allowed_senders: Vec<String>,
    /// Recipient local-part marker that turns a broadcast into a test probe.
    pub test_marker: String,
    /// Treat "undelivered"/"delivery status notification" subjects as bounces.
    pub bounce_subject_fallback: bool,
    pub web_bind: String,
    pub log_dir: Option<PathBuf>,
}

pub const DEFAULT_SUBJECT_MARKER: &str = "[TEST]";
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 50 * 1024 * 1024;

impl RelayConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require =
            |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let timeout = Duration::from_secs(parse_or(&get, "RELAY_NET_TIMEOUT_SECS", 30u64)?);

        let imap_host = require("RELAY_IMAP_HOST")?;
        let imap_username = require("RELAY_IMAP_USERNAME")?;
        let imap_password = require("RELAY_IMAP_PASSWORD")?;

        let imap = ImapConfig {
            port: parse_or(&get, "RELAY_IMAP_PORT", 993u16)?,
            host: imap_host.clone(),
            username: imap_username.clone(),
            password: SecretString::from(imap_password.clone()),
            timeout,
            max_message_bytes: parse_or(&get, "RELAY_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?,
        };

        let smtp = SmtpConfig {
            host: get("RELAY_SMTP_HOST").unwrap_or_else(|| imap_host.replace("imap", "smtp")),
            port: parse_or(&get, "RELAY_SMTP_PORT", 587u16)?,
            username: get("RELAY_SMTP_USERNAME").unwrap_or(imap_username),
            password: SecretString::from(get("RELAY_SMTP_PASSWORD").unwrap_or(imap_password)),
            timeout,
        };

        let transform = TransformConfig {
            from_header: require("RELAY_FROM")?,
            reply_to: parse_or(&get, "RELAY_REPLY_TO_MODE", ReplyToMode::Original)?,
            max_image_width: parse_or(&get, "RELAY_MAX_IMAGE_WIDTH", 800u32)?,
            subject_marker: DEFAULT_SUBJECT_MARKER.to_string(),
        };
        if transform.max_image_width == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_MAX_IMAGE_WIDTH".into(),
                message: "must be greater than zero".into(),
            });
        }

        let unsubscribe = UnsubscribeConfig {
            public_base_url: require("RELAY_PUBLIC_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            path: get("RELAY_UNSUBSCRIBE_PATH").unwrap_or_else(|| "/unsub".into()),
            secret: SecretString::from(require("RELAY_TOKEN_SECRET")?),
        };
        if !unsubscribe.path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_UNSUBSCRIBE_PATH".into(),
                message: "must start with '/'".into(),
            });
        }

        let defaults = ThrottleConfig::default();
        let throttle = ThrottleConfig {
            per_recipient: match get("RELAY_RCPT_DELAY_SECS") {
                Some(v) => parse_range("RELAY_RCPT_DELAY_SECS", &v)?,
                None => defaults.per_recipient,
            },
            per_message: match get("RELAY_MESSAGE_DELAY_SECS") {
                Some(v) => parse_range("RELAY_MESSAGE_DELAY_SECS", &v)?,
                None => defaults.per_message,
            },
        };

        let allowed_senders: Vec<String> = require("RELAY_ALLOWED_SENDERS")?
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            imap,
            smtp,
            transform,
            unsubscribe,
            throttle,
            db_path: get("RELAY_DB_PATH")
                .unwrap_or_else(|| "./data/relay.db".into())
                .into(),
            poll_interval: Duration::from_secs(parse_or(&get, "RELAY_POLL_INTERVAL_SECS", 60u64)?),
            allowed_senders,
            test_marker: get("RELAY_TEST_MARKER").unwrap_or_else(|| "+test".into()),
            bounce_subject_fallback: parse_or(&get, "RELAY_BOUNCE_SUBJECT_FALLBACK", true)?,
            web_bind: get("RELAY_WEB_BIND").unwrap_or_else(|| "0.0.0.0:8080".into()),
            log_dir: get("RELAY_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse `"1.0-3.0"` (or a single `"2"`) into a seconds range.
fn parse_range(key: &str, raw: &str) -> Result<RangeInclusive<f64>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    };
    let (lo, hi) = raw.split_once('-').unwrap_or((raw, raw));
    let lo: f64 = lo.trim().parse().map_err(|e| invalid(format!("{e}")))?;
    let hi: f64 = hi.trim().parse().map_err(|e| invalid(format!("{e}")))?;
    if !(lo >= 0.0 && hi >= lo && hi.is_finite()) {
        return Err(invalid(format!("bad range {lo}-{hi}")));
    }
    Ok(lo..=hi)
}
