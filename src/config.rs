use serde::Deserialize;
use std::{path::Path, time::Duration};

use crate::{smtp::SmtpConfig, worker::WorkerPoolConfig};

/// Prefix for environment overrides; `SMTP_PROXY_DATABASE_URL` overrides
/// `database.url` and so on for every known key.
const ENV_PREFIX: &str = "SMTP_PROXY";

const ENV_KEYS: &[&str] = &[
    "smtp.host",
    "smtp.port",
    "smtp.server_name",
    "smtp.max_connections",
    "smtp.read_timeout_secs",
    "smtp.write_timeout_secs",
    "smtp.max_message_size",
    "database.url",
    "database.pool_min",
    "database.pool_max",
    "database.connect_timeout_secs",
    "tls.cert_file",
    "tls.key_file",
    "delivery.mode",
    "queue.kind",
    "queue.url",
    "queue.queue_url",
    "queue.dlq_url",
    "queue.group_name",
    "queue.workers",
    "queue.block_timeout_ms",
    "queue.process_timeout_secs",
    "queue.shutdown_timeout_secs",
    "queue.max_retries",
    "queue.region",
    "queue.endpoint",
    "storage.kind",
    "storage.path",
    "storage.bucket",
    "storage.prefix",
    "storage.endpoint",
    "storage.region",
    "auth.signing_key",
    "auth.access_token_expiry_mins",
    "auth.refresh_token_expiry_hours",
    "auth.issuer",
    "auth.audience",
    "rate_limit.default_monthly_limit",
    "rate_limit.login_attempts_limit",
    "rate_limit.login_lockout_mins",
    "logging.level",
    "logging.output",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub smtp: SmtpSettings,
    pub database: DatabaseSettings,
    pub tls: TlsSettings,
    pub delivery: DeliverySettings,
    pub queue: QueueSettings,
    pub storage: StorageSettings,
    pub auth: AuthSettings,
    pub rate_limit: RateLimitSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub server_name: String,
    pub max_connections: u32,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub max_message_size: usize,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 2525,
            server_name: "mailgate".into(),
            max_connections: 100,
            read_timeout_secs: 60,
            write_timeout_secs: 30,
            max_message_size: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_min: u32,
    pub pool_max: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/mailgate".into(),
            pool_min: 1,
            pool_max: 5,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Both empty means a self-signed certificate is generated at startup.
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub mode: DeliveryMode,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Async,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Redis,
    Sqs,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub kind: QueueKind,
    /// Redis connection URL.
    pub url: String,
    /// SQS queue and dead-letter queue URLs.
    pub queue_url: Option<String>,
    pub dlq_url: Option<String>,
    pub group_name: String,
    pub workers: usize,
    pub block_timeout_ms: u64,
    pub process_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub max_retries: u32,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            kind: QueueKind::Redis,
            url: "redis://localhost:6379".into(),
            queue_url: None,
            dlq_url: None,
            group_name: "delivery-workers".into(),
            workers: 4,
            block_timeout_ms: 5_000,
            process_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            max_retries: 5,
            region: None,
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub kind: StorageKind,
    pub path: String,
    pub bucket: Option<String>,
    pub prefix: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: StorageKind::Local,
            path: "./data/messages".into(),
            bucket: None,
            prefix: "messages/".into(),
            endpoint: None,
            region: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub signing_key: String,
    pub access_token_expiry_mins: u64,
    pub refresh_token_expiry_hours: u64,
    pub issuer: String,
    pub audience: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            signing_key: String::new(),
            access_token_expiry_mins: 15,
            refresh_token_expiry_hours: 168,
            issuer: "mailgate".into(),
            audience: "mailgate".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub default_monthly_limit: u64,
    pub login_attempts_limit: u32,
    pub login_lockout_mins: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default_monthly_limit: 10_000,
            login_attempts_limit: 5,
            login_lockout_mins: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    File,
    Cloudwatch,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub output: LogOutput,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            output: LogOutput::Stdout,
        }
    }
}

impl Settings {
    /// Layered load: built-in defaults, then the optional config file, then
    /// `SMTP_PROXY_*` environment overrides for every known key.
    pub fn load(path: Option<&Path>) -> Result<Settings, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        for key in ENV_KEYS {
            let env_name = format!("{ENV_PREFIX}_{}", key.replace('.', "_").to_uppercase());
            builder = builder.set_override_option(*key, std::env::var(&env_name).ok())?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn smtp_config(&self) -> SmtpConfig {
        SmtpConfig {
            listen_addr: format!("{}:{}", self.smtp.host, self.smtp.port)
                .parse()
                .expect("valid smtp listen address"),
            server_name: self.smtp.server_name.clone(),
            max_connections: self.smtp.max_connections,
            read_timeout: Duration::from_secs(self.smtp.read_timeout_secs),
            write_timeout: Duration::from_secs(self.smtp.write_timeout_secs),
            max_message_size: self.smtp.max_message_size,
            cert_file: self.tls.cert_file.clone().filter(|f| !f.is_empty()).map(Into::into),
            key_file: self.tls.key_file.clone().filter(|f| !f.is_empty()).map(Into::into),
        }
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.queue.workers,
            block_timeout: Duration::from_millis(self.queue.block_timeout_ms),
            process_timeout: Duration::from_secs(self.queue.process_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.queue.shutdown_timeout_secs),
            max_retries: self.queue.max_retries,
        }
    }

    pub fn login_lockout(&self) -> Duration {
        Duration::from_secs(self.rate_limit.login_lockout_mins * 60)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file_or_env() {
        let settings = Settings::load(None).unwrap();

        assert_eq!(settings.smtp.port, 2525);
        assert_eq!(settings.queue.kind, QueueKind::Redis);
        assert_eq!(settings.queue.max_retries, 5);
        assert_eq!(settings.storage.kind, StorageKind::Local);
        assert_eq!(settings.delivery.mode, DeliveryMode::Async);
        assert_eq!(settings.rate_limit.login_attempts_limit, 5);
        assert_eq!(settings.auth.access_token_expiry_mins, 15);
    }

    #[test]
    fn file_values_override_defaults() {
        let path = std::env::temp_dir().join(format!("mailgate-{}.yaml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "smtp:\n  port: 1587\nqueue:\n  kind: sqs\n  queue_url: \"https://sqs.test/main\"\ndelivery:\n  mode: sync\n"
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.smtp.port, 1587);
        assert_eq!(settings.queue.kind, QueueKind::Sqs);
        assert_eq!(
            settings.queue.queue_url.as_deref(),
            Some("https://sqs.test/main")
        );
        assert_eq!(settings.delivery.mode, DeliveryMode::Sync);
        // untouched sections keep their defaults
        assert_eq!(settings.smtp.max_connections, 100);
    }

    #[test]
    fn environment_overrides_win() {
        // SAFETY: keys no other test reads, removed before the test returns
        unsafe {
            std::env::set_var("SMTP_PROXY_DATABASE_URL", "postgres://db.internal/mail");
            std::env::set_var("SMTP_PROXY_RATE_LIMIT_LOGIN_LOCKOUT_MINS", "30");
        }

        let settings = Settings::load(None).unwrap();

        unsafe {
            std::env::remove_var("SMTP_PROXY_DATABASE_URL");
            std::env::remove_var("SMTP_PROXY_RATE_LIMIT_LOGIN_LOCKOUT_MINS");
        }

        assert_eq!(settings.database.url, "postgres://db.internal/mail");
        assert_eq!(settings.rate_limit.login_lockout_mins, 30);
    }

    #[test]
    fn empty_tls_paths_mean_self_signed() {
        let mut settings = Settings::load(None).unwrap();
        settings.tls.cert_file = Some(String::new());
        settings.tls.key_file = Some(String::new());

        let smtp = settings.smtp_config();
        assert!(smtp.cert_file.is_none());
        assert!(smtp.key_file.is_none());
    }
}
