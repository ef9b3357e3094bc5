use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the folio binary.
#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "folio document conversion server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FOLIO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the conversion HTTP service.
    Serve(Box<ServeArgs>),
    /// Resolve the configuration and load the TLS material, then exit.
    #[command(name = "check-config")]
    CheckConfig(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct EngineOverrides {
    /// Override the pandoc executable path.
    #[arg(long = "engine-path", value_name = "PATH")]
    pub engine_path: Option<PathBuf>,

    /// Override the pandoc data directory containing the templates.
    #[arg(long = "engine-data-dir", value_name = "PATH")]
    pub engine_data_dir: Option<PathBuf>,

    /// Override the timeout applied to a single pandoc invocation.
    #[arg(long = "engine-command-timeout-seconds", value_name = "SECONDS")]
    pub command_timeout_seconds: Option<u64>,

    /// Override the directory under which conversion workspaces are created.
    #[arg(long = "engine-temp-dir", value_name = "PATH")]
    pub temp_dir: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct TlsOverrides {
    /// Override the server certificate chain (PEM).
    #[arg(long = "tls-cert-file", value_name = "PATH")]
    pub cert_file: Option<PathBuf>,

    /// Override the server private key (PEM).
    #[arg(long = "tls-key-file", value_name = "PATH")]
    pub key_file: Option<PathBuf>,

    /// Override the root CA bundle used to verify client certificates.
    #[arg(long = "tls-root-ca", value_name = "PATH")]
    pub root_ca: Option<PathBuf>,

    /// Override the client certificate subject that is allowed to connect.
    #[arg(long = "tls-cert-subject", value_name = "SUBJECT")]
    pub cert_subject: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub engine: EngineOverrides,

    #[command(flatten)]
    pub tls: TlsOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the maximum accepted request body size in bytes.
    #[arg(long = "server-max-request-bytes", value_name = "BYTES")]
    pub server_max_request_bytes: Option<u64>,

    /// Trust the `CF-Connecting-IP` header for the logged client address.
    #[arg(
        long = "server-cloudflare",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub server_cloudflare: Option<bool>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the number of conversions allowed to run at once.
    #[arg(long = "convert-max-concurrent", value_name = "COUNT")]
    pub convert_max_concurrent: Option<u32>,

    /// Override the maximum number of resource files per request.
    #[arg(long = "convert-max-resources", value_name = "COUNT")]
    pub convert_max_resources: Option<u32>,
}
