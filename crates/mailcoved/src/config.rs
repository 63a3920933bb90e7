//! Everything tunable is read from `INBUCKET_`-prefixed environment
//! variables. A malformed value is a startup error, not a silent
//! fallback to the default.

use crate::policy::{AddressPolicy, MailboxNaming};
use anyhow::Context;
use msgstore::StoreParams;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_PREFIX: &str = "INBUCKET_";

#[derive(Debug, Clone)]
pub struct Config {
    pub mailbox_naming: MailboxNaming,
    pub storage: StorageConfig,
    pub smtp: SmtpConfig,
    pub pop3: Pop3Config,
    pub web: WebConfig,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Registered storage backend name: `memory` or `file`.
    pub kind: String,
    /// Root path for disk-backed storage.
    pub params: Option<PathBuf>,
    /// Per-mailbox message cap; zero means unlimited.
    pub mailbox_msg_cap: usize,
    /// Messages older than this are swept; zero disables retention.
    pub retention_period: Duration,
    /// Sweep cadence.
    pub retention_sleep: Duration,
    /// Soft cap on total stored messages for the memory backend.
    pub max_total_messages: usize,
    /// fsync message files before rename.
    pub flush: bool,
}

impl Config {
    /// The SMTP size ceiling doubles as the storage ceiling, so an
    /// oversize message is refused even if it reaches a store through
    /// some future path other than the ingress.
    pub fn store_params(&self) -> StoreParams {
        StoreParams {
            path: self.storage.params.clone(),
            flush: self.storage.flush,
            max_total_messages: self.storage.max_total_messages,
            max_message_bytes: self.smtp.max_message_bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub addr: String,
    pub domain: String,
    pub max_recipients: usize,
    pub max_message_bytes: usize,
    pub max_connections: usize,
    pub timeout: Duration,
    pub data_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub permissive_newlines: bool,
    pub default_accept: bool,
    pub accept_domains: Vec<String>,
    pub reject_domains: Vec<String>,
    pub default_store: bool,
    pub store_domains: Vec<String>,
    pub tls_enabled: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_privkey: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Pop3Config {
    pub addr: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub addr: String,
    /// Ring size for each hub subscriber.
    pub monitor_buffer: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let mailbox_naming = match var("MAILBOXNAMING") {
            None => MailboxNaming::Local,
            Some(value) => value.parse::<MailboxNaming>().map_err(|err| {
                err.context(format!("parsing {ENV_PREFIX}MAILBOXNAMING={value}"))
            })?,
        };
        Ok(Self {
            mailbox_naming,
            storage: StorageConfig {
                kind: string("STORAGE_TYPE", "memory"),
                params: var("STORAGE_PARAMS").map(PathBuf::from),
                mailbox_msg_cap: parse("STORAGE_MAILBOXMSGCAP", 500)?,
                retention_period: duration("STORAGE_RETENTIONPERIOD", Duration::ZERO)?,
                retention_sleep: duration("STORAGE_RETENTIONSLEEP", Duration::from_secs(300))?,
                max_total_messages: parse("STORAGE_MAXTOTALMESSAGES", 0)?,
                flush: parse_bool("STORAGE_FLUSH", false)?,
            },
            smtp: SmtpConfig {
                addr: string("SMTP_ADDR", "0.0.0.0:2500"),
                domain: string("SMTP_DOMAIN", "mailcove.local"),
                max_recipients: parse("SMTP_MAXRECIPIENTS", 200)?,
                max_message_bytes: parse("SMTP_MAXMESSAGEBYTES", 10 * 1024 * 1024)?,
                max_connections: parse("SMTP_MAXCONNECTIONS", 64)?,
                timeout: duration("SMTP_TIMEOUT", Duration::from_secs(5 * 60))?,
                data_timeout: duration("SMTP_DATATIMEOUT", Duration::from_secs(10 * 60))?,
                shutdown_timeout: duration("SMTP_SHUTDOWNTIMEOUT", Duration::from_secs(10))?,
                permissive_newlines: parse_bool("SMTP_PERMISSIVENEWLINES", true)?,
                default_accept: parse_bool("SMTP_DEFAULTACCEPT", true)?,
                accept_domains: list("SMTP_ACCEPTDOMAINS"),
                reject_domains: list("SMTP_REJECTDOMAINS"),
                default_store: parse_bool("SMTP_DEFAULTSTORE", true)?,
                store_domains: list("SMTP_STOREDOMAINS"),
                tls_enabled: parse_bool("SMTP_TLSENABLED", false)?,
                tls_cert: var("SMTP_TLSCERT").map(PathBuf::from),
                tls_privkey: var("SMTP_TLSPRIVKEY").map(PathBuf::from),
            },
            pop3: Pop3Config {
                addr: string("POP3_ADDR", "0.0.0.0:1100"),
                timeout: duration("POP3_TIMEOUT", Duration::from_secs(10 * 60))?,
            },
            web: WebConfig {
                addr: string("WEB_ADDR", "0.0.0.0:9000"),
                monitor_buffer: parse("WEB_MONITORBUFFER", crate::hub::DEFAULT_EVENT_BUFFER)?,
            },
        })
    }

    pub fn address_policy(&self) -> AddressPolicy {
        AddressPolicy {
            naming: self.mailbox_naming,
            default_accept: self.smtp.default_accept,
            accept_domains: self.smtp.accept_domains.clone(),
            reject_domains: self.smtp.reject_domains.clone(),
            default_store: self.smtp.default_store,
            store_domains: self.smtp.store_domains.clone(),
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .filter(|value| !value.is_empty())
}

fn string(name: &str, default: &str) -> String {
    var(name).unwrap_or_else(|| default.to_string())
}

fn parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .with_context(|| format!("parsing {ENV_PREFIX}{name}={value}")),
    }
}

fn parse_bool(name: &str, default: bool) -> anyhow::Result<bool> {
    match var(name) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("parsing {ENV_PREFIX}{name}={value}: expected a boolean"),
        },
    }
}

/// Durations accept humantime strings ("90s", "72h") or a bare number
/// of seconds. Zero disables wherever zero is meaningful.
fn duration(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match var(name) {
        None => Ok(default),
        Some(value) => {
            if let Ok(secs) = value.parse::<u64>() {
                return Ok(Duration::from_secs(secs));
            }
            humantime::parse_duration(&value)
                .with_context(|| format!("parsing {ENV_PREFIX}{name}={value}"))
        }
    }
}

fn list(name: &str) -> Vec<String> {
    var(name)
        .map(|value| {
            value
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    // Environment access is process global, so everything env-touching
    // lives in this one test.
    #[test]
    fn from_env_reads_overrides_and_defaults() {
        std::env::set_var("INBUCKET_MAILBOXNAMING", "full");
        std::env::set_var("INBUCKET_STORAGE_TYPE", "file");
        std::env::set_var("INBUCKET_STORAGE_PARAMS", "/tmp/mailcove-test");
        std::env::set_var("INBUCKET_STORAGE_MAILBOXMSGCAP", "25");
        std::env::set_var("INBUCKET_STORAGE_RETENTIONPERIOD", "72h");
        std::env::set_var("INBUCKET_SMTP_TIMEOUT", "30");
        std::env::set_var("INBUCKET_SMTP_DEFAULTSTORE", "false");
        std::env::set_var("INBUCKET_SMTP_STOREDOMAINS", "a.example, b.example");

        let config = Config::from_env().unwrap();
        assert_equal!(config.mailbox_naming, MailboxNaming::Full);
        assert_equal!(config.storage.kind, "file");
        assert_equal!(
            config.storage.params,
            Some(PathBuf::from("/tmp/mailcove-test"))
        );
        assert_equal!(config.storage.mailbox_msg_cap, 25);
        assert_equal!(config.storage.retention_period, Duration::from_secs(72 * 3600));
        // Unset values fall back to defaults.
        assert_equal!(config.storage.retention_sleep, Duration::from_secs(300));
        assert_equal!(config.smtp.timeout, Duration::from_secs(30));
        assert!(!config.smtp.default_store);
        assert_equal!(
            config.smtp.store_domains,
            vec!["a.example".to_string(), "b.example".to_string()]
        );
        assert_equal!(config.pop3.addr, "0.0.0.0:1100");

        let policy = config.address_policy();
        assert_equal!(policy.naming, MailboxNaming::Full);
        assert!(!policy.default_store);

        // The SMTP size ceiling is threaded through to the store.
        assert_equal!(
            config.store_params().max_message_bytes,
            config.smtp.max_message_bytes
        );

        std::env::set_var("INBUCKET_SMTP_MAXRECIPIENTS", "banana");
        assert!(Config::from_env().is_err());

        for name in [
            "MAILBOXNAMING",
            "STORAGE_TYPE",
            "STORAGE_PARAMS",
            "STORAGE_MAILBOXMSGCAP",
            "STORAGE_RETENTIONPERIOD",
            "SMTP_TIMEOUT",
            "SMTP_DEFAULTSTORE",
            "SMTP_STOREDOMAINS",
            "SMTP_MAXRECIPIENTS",
        ] {
            std::env::remove_var(format!("{ENV_PREFIX}{name}"));
        }
    }
}
