//! Transport security: server certificate loading and client certificate
//! authorization for mutual TLS.

mod policy;
mod subject;
mod verifier;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
    server::WebPkiClientVerifier,
};
use thiserror::Error;

use crate::config::TlsSettings;

pub use policy::{AuthorizationDecision, CertificateSummary, TrustPolicy, VerifiedChain};
pub use subject::{render_subject, summarize_certificate};
pub use verifier::SubjectVerifier;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read `{path}`: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse PEM data in `{path}`: {reason}")]
    Pem { path: PathBuf, reason: String },
    #[error("no certificates found in `{0}`")]
    NoCertificates(PathBuf),
    #[error("invalid root certificate: {0}")]
    RootStore(String),
    #[error("failed to parse certificate: {0}")]
    Certificate(String),
    #[error("client certificate verifier: {0}")]
    Verifier(String),
    #[error("server certificate and key are not configured")]
    MissingServerCertificate,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Build the rustls server configuration: TLS 1.3 only, client certificates
/// requested and verified whenever the trust policy carries a root bundle.
pub fn build_server_config(
    settings: &TlsSettings,
    policy: Arc<TrustPolicy>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let (Some(cert_file), Some(key_file)) = (settings.cert_file.as_ref(), settings.key_file.as_ref())
    else {
        return Err(TlsError::MissingServerCertificate);
    };

    let certs = load_certificates(cert_file)?;
    let key = load_private_key(key_file)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])?;

    let builder = match policy.roots() {
        Some(roots) => {
            let inner = WebPkiClientVerifier::builder_with_provider(roots, provider)
                .build()
                .map_err(|err| TlsError::Verifier(err.to_string()))?;
            builder.with_client_cert_verifier(Arc::new(SubjectVerifier::new(inner, policy)))
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder.with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Read every PEM certificate from `path`. An empty bundle is an error.
pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_file(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TlsError::Pem {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_file(path)?;
    PrivateKeyDer::from_pem_slice(&pem).map_err(|err| TlsError::Pem {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}
