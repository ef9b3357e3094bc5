#![deny(clippy::all, clippy::pedantic)]

use std::fs;
use std::path::Path;

use folio_api_types::{ConvertRequest, ConvertResponse, ErrorResponse};
use reqwest::{Certificate, Client, Identity, Url};
use thiserror::Error;

use crate::args::{Cli, TlsArgs};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("site URL is required (use --site or FOLIO_SITE_URL)")]
    MissingSite,
    #[error("failed to read {path}: {source}")]
    InputFile {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    OutputFile {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server error: {0}")]
    Server(String),
}

#[derive(Clone, Debug)]
pub struct Ctx {
    pub client: Client,
    pub base: Url,
}

impl Ctx {
    pub fn new(site: &str, tls: &TlsArgs) -> Result<Self, CliError> {
        let base = Url::parse(site)?.join("/")?;
        let mut builder = Client::builder().user_agent(Self::user_agent());

        if let Some(ca_file) = &tls.ca_file {
            let pem = read_file(ca_file)?;
            for cert in Certificate::from_pem_bundle(&pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        if let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) {
            let mut pem = read_file(cert_file)?;
            pem.push(b'\n');
            pem.extend(read_file(key_file)?);
            builder = builder.identity(Identity::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            base,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("folio-cli/", env!("CARGO_PKG_VERSION"))
    }

    pub fn url(&self, path: &str) -> Result<Url, CliError> {
        self.base.join(path).map_err(CliError::Url)
    }

    pub async fn convert(&self, request: &ConvertRequest) -> Result<ConvertResponse, CliError> {
        let resp = self
            .client
            .post(self.url("convert")?)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;
        if !status.is_success() {
            let detail = serde_json::from_slice::<ErrorResponse>(&bytes)
                .map(|body| body.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).into_owned());
            return Err(CliError::Server(format!("status {status}: {detail}")));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| CliError::Server(format!("failed to parse body: {e}")))
    }
}

pub fn build_ctx_from_cli(cli: &Cli) -> Result<Ctx, CliError> {
    let site = cli.site.clone().ok_or(CliError::MissingSite)?;
    Ctx::new(&site, &cli.tls)
}

pub fn read_file(path: &Path) -> Result<Vec<u8>, CliError> {
    fs::read(path).map_err(|source| CliError::InputFile {
        path: path.display().to_string(),
        source,
    })
}

pub fn write_file(path: &Path, contents: &[u8]) -> Result<(), CliError> {
    fs::write(path, contents).map_err(|source| CliError::OutputFile {
        path: path.display().to_string(),
        source,
    })
}
