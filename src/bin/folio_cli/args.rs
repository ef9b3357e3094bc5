//! Command-line surface for `folio-cli`.

#![deny(clippy::all, clippy::pedantic)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "folio-cli", version, about = "folio conversion client", long_about = None)]
pub struct Cli {
    /// Service base URL, e.g. <https://folio.example.com:8000>
    #[arg(long, env = "FOLIO_SITE_URL")]
    pub site: Option<String>,

    #[command(flatten)]
    pub tls: TlsArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Default, Clone)]
pub struct TlsArgs {
    /// PEM bundle used to verify the server certificate
    #[arg(long, env = "FOLIO_CA_FILE")]
    pub ca_file: Option<PathBuf>,

    /// PEM client certificate presented to the server
    #[arg(long, env = "FOLIO_CERT_FILE", requires = "key_file")]
    pub cert_file: Option<PathBuf>,

    /// PEM private key for the client certificate
    #[arg(long, env = "FOLIO_KEY_FILE", requires = "cert_file")]
    pub key_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert a Markdown document to PDF
    Convert(ConvertArgs),
}

#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Markdown document to convert
    #[arg(long)]
    pub input: PathBuf,

    /// Template name known to the server
    #[arg(long)]
    pub template: String,

    /// Resource made available next to the document, as `relative/path=local-file`
    #[arg(long = "resource", value_parser = parse_resource)]
    pub resources: Vec<ResourceArg>,

    /// Where to write the rendered PDF
    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceArg {
    pub name: String,
    pub path: PathBuf,
}

fn parse_resource(value: &str) -> Result<ResourceArg, String> {
    let (name, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected `relative/path=local-file`, got `{value}`"))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected `relative/path=local-file`, got `{value}`"));
    }
    Ok(ResourceArg {
        name: name.to_string(),
        path: PathBuf::from(path),
    })
}
