//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{CliArgs, Command, EngineOverrides, ServeArgs, ServeOverrides, TlsOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "folio";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 10;
const DEFAULT_MAX_REQUEST_BYTES: u64 = 32 * 1024 * 1024;
pub(crate) const DEFAULT_ENGINE_PATH: &str = "/usr/local/bin/pandoc";
pub(crate) const DEFAULT_ENGINE_DATA_DIR: &str = "/.pandoc";
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CONVERT_MAX_CONCURRENT: u32 = 8;
const DEFAULT_CONVERT_MAX_RESOURCES: u32 = 256;
const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 5;
const DEFAULT_NOTIFY_QUEUE_CAPACITY: u32 = 64;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub tls: TlsSettings,
    pub engine: EngineSettings,
    pub convert: ConvertSettings,
    pub logging: LoggingSettings,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub max_request_bytes: NonZeroU64,
    /// Take the client address from `CF-Connecting-IP` when present.
    pub cloudflare: bool,
}

/// TLS material. `cert_file`/`key_file` are either both set or both absent;
/// `root_ca` and `cert_subject` require a server certificate.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub root_ca: Option<PathBuf>,
    pub cert_subject: Option<String>,
}

impl TlsSettings {
    pub fn enabled(&self) -> bool {
        self.cert_file.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub path: PathBuf,
    pub data_dir: PathBuf,
    pub command_timeout: Duration,
    pub temp_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ConvertSettings {
    pub max_concurrent: NonZeroU32,
    pub max_resources: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub webhooks: Vec<Url>,
    pub timeout: Duration,
    pub queue_capacity: NonZeroU32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("FOLIO")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("notifications.webhooks")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) | Some(Command::CheckConfig(args)) => {
            raw.apply_serve_overrides(&args.overrides)
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    engine: RawEngineSettings,
    convert: RawConvertSettings,
    logging: RawLoggingSettings,
    notifications: RawNotificationSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(bytes) = overrides.server_max_request_bytes {
            self.server.max_request_bytes = Some(bytes);
        }
        if let Some(cloudflare) = overrides.server_cloudflare {
            self.server.cloudflare = Some(cloudflare);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(value) = overrides.convert_max_concurrent {
            self.convert.max_concurrent = Some(value);
        }
        if let Some(value) = overrides.convert_max_resources {
            self.convert.max_resources = Some(value);
        }

        self.apply_engine_overrides(&overrides.engine);
        self.apply_tls_overrides(&overrides.tls);
    }

    fn apply_engine_overrides(&mut self, overrides: &EngineOverrides) {
        if let Some(path) = overrides.engine_path.as_ref() {
            self.engine.path = Some(path.clone());
        }
        if let Some(dir) = overrides.engine_data_dir.as_ref() {
            self.engine.data_dir = Some(dir.clone());
        }
        if let Some(seconds) = overrides.command_timeout_seconds {
            self.engine.command_timeout_seconds = Some(seconds);
        }
        if let Some(dir) = overrides.temp_dir.as_ref() {
            self.engine.temp_dir = Some(dir.clone());
        }
    }

    fn apply_tls_overrides(&mut self, overrides: &TlsOverrides) {
        if let Some(path) = overrides.cert_file.as_ref() {
            self.server.tls.cert_file = Some(path.clone());
        }
        if let Some(path) = overrides.key_file.as_ref() {
            self.server.tls.key_file = Some(path.clone());
        }
        if let Some(path) = overrides.root_ca.as_ref() {
            self.server.tls.root_ca = Some(path.clone());
        }
        if let Some(subject) = overrides.cert_subject.as_ref() {
            self.server.tls.cert_subject = Some(subject.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            mut server,
            engine,
            convert,
            logging,
            notifications,
        } = raw;

        let tls = build_tls_settings(std::mem::take(&mut server.tls))?;
        let server = build_server_settings(server)?;
        let engine = build_engine_settings(engine)?;
        let convert = build_convert_settings(convert)?;
        let logging = build_logging_settings(logging)?;
        let notifications = build_notification_settings(notifications)?;

        Ok(Self {
            server,
            tls,
            engine,
            convert,
            logging,
            notifications,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    let max_request_bytes = server
        .max_request_bytes
        .unwrap_or(DEFAULT_MAX_REQUEST_BYTES);
    let max_request_bytes = NonZeroU64::new(max_request_bytes)
        .ok_or_else(|| LoadError::invalid("server.max_request_bytes", "must be greater than zero"))?;

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        max_request_bytes,
        cloudflare: server.cloudflare.unwrap_or(false),
    })
}

fn build_tls_settings(tls: RawTlsSettings) -> Result<TlsSettings, LoadError> {
    let cert_file = non_empty_path(tls.cert_file);
    let key_file = non_empty_path(tls.key_file);
    let root_ca = non_empty_path(tls.root_ca);
    let cert_subject = tls.cert_subject.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    match (&cert_file, &key_file) {
        (Some(_), None) => {
            return Err(LoadError::invalid(
                "server.tls.key_file",
                "a private key is required when a certificate is configured",
            ));
        }
        (None, Some(_)) => {
            return Err(LoadError::invalid(
                "server.tls.cert_file",
                "a certificate is required when a private key is configured",
            ));
        }
        _ => {}
    }

    if root_ca.is_some() && cert_file.is_none() {
        return Err(LoadError::invalid(
            "server.tls.root_ca",
            "client certificate verification requires a server certificate",
        ));
    }

    if cert_subject.is_some() && root_ca.is_none() {
        return Err(LoadError::invalid(
            "server.tls.cert_subject",
            "a required subject needs a root CA to verify client certificates against",
        ));
    }

    Ok(TlsSettings {
        cert_file,
        key_file,
        root_ca,
        cert_subject,
    })
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let path = engine
        .path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_PATH));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid("engine.path", "path must not be empty"));
    }

    let data_dir = engine
        .data_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENGINE_DATA_DIR));
    if data_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "engine.data_dir",
            "path must not be empty",
        ));
    }

    let timeout_secs = engine
        .command_timeout_seconds
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "engine.command_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let temp_dir = non_empty_path(engine.temp_dir).unwrap_or_else(std::env::temp_dir);

    Ok(EngineSettings {
        path,
        data_dir,
        command_timeout: Duration::from_secs(timeout_secs),
        temp_dir,
    })
}

fn build_convert_settings(convert: RawConvertSettings) -> Result<ConvertSettings, LoadError> {
    let max_concurrent = non_zero_u32(
        convert
            .max_concurrent
            .unwrap_or(DEFAULT_CONVERT_MAX_CONCURRENT)
            .into(),
        "convert.max_concurrent",
    )?;
    let max_resources = non_zero_u32(
        convert
            .max_resources
            .unwrap_or(DEFAULT_CONVERT_MAX_RESOURCES)
            .into(),
        "convert.max_resources",
    )?;

    Ok(ConvertSettings {
        max_concurrent,
        max_resources,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_notification_settings(
    notifications: RawNotificationSettings,
) -> Result<NotificationSettings, LoadError> {
    let webhooks = notifications
        .webhooks
        .unwrap_or_default()
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(|value| {
            Url::parse(value).map_err(|err| {
                LoadError::invalid(
                    "notifications.webhooks",
                    format!("invalid URL `{value}`: {err}"),
                )
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let timeout_secs = notifications
        .timeout_seconds
        .unwrap_or(DEFAULT_NOTIFY_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "notifications.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let queue_capacity = non_zero_u32(
        notifications
            .queue_capacity
            .unwrap_or(DEFAULT_NOTIFY_QUEUE_CAPACITY)
            .into(),
        "notifications.queue_capacity",
    )?;

    Ok(NotificationSettings {
        webhooks,
        timeout: Duration::from_secs(timeout_secs),
        queue_capacity,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    max_request_bytes: Option<u64>,
    cloudflare: Option<bool>,
    tls: RawTlsSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTlsSettings {
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    root_ca: Option<PathBuf>,
    cert_subject: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    path: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    command_timeout_seconds: Option<u64>,
    temp_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawConvertSettings {
    max_concurrent: Option<u32>,
    max_resources: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawNotificationSettings {
    webhooks: Option<Vec<String>>,
    timeout_seconds: Option<u64>,
    queue_capacity: Option<u32>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_empty_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|path| !path.as_os_str().is_empty())
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
