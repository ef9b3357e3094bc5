use std::{collections::BTreeSet, path::Path, sync::Arc};

use rustls::{RootCertStore, pki_types::CertificateDer};
use tracing::{debug, warn};

use super::{TlsError, load_certificates, subject::summarize_certificate};

/// Subject and serial of one certificate in a presented chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    pub subject: String,
    pub serial: String,
}

impl CertificateSummary {
    pub fn new(subject: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            serial: serial.into(),
        }
    }
}

/// A certificate chain, leaf first, that the TLS stack already validated
/// against the configured root bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifiedChain {
    certificates: Vec<CertificateSummary>,
}

impl VerifiedChain {
    pub fn new(certificates: Vec<CertificateSummary>) -> Self {
        Self { certificates }
    }

    /// Summarize DER certificates, leaf first.
    pub fn from_der(certificates: &[CertificateDer<'_>]) -> Result<Self, TlsError> {
        let certificates = certificates
            .iter()
            .map(|cert| summarize_certificate(cert.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { certificates })
    }

    pub fn leaf(&self) -> Option<&CertificateSummary> {
        self.certificates.first()
    }

    pub fn certificates(&self) -> &[CertificateSummary] {
        &self.certificates
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationDecision {
    Granted,
    /// No presented leaf carried the required subject. `observed_subjects`
    /// lists every distinct leaf subject seen, sorted.
    Denied { observed_subjects: Vec<String> },
}

impl AuthorizationDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Process-wide client certificate policy, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct TrustPolicy {
    roots: Option<Arc<RootCertStore>>,
    required_subject: Option<String>,
}

impl TrustPolicy {
    pub fn new(roots: Option<RootCertStore>, required_subject: Option<String>) -> Self {
        Self {
            roots: roots.map(Arc::new),
            required_subject,
        }
    }

    /// Load the root bundle from disk. Any read or parse failure is fatal so
    /// a broken bundle never degrades into an open server.
    pub fn load(root_ca: Option<&Path>, required_subject: Option<String>) -> Result<Self, TlsError> {
        let roots = match root_ca {
            Some(path) => {
                let mut store = RootCertStore::empty();
                for cert in load_certificates(path)? {
                    store
                        .add(cert)
                        .map_err(|err| TlsError::RootStore(err.to_string()))?;
                }
                Some(store)
            }
            None => None,
        };
        Ok(Self::new(roots, required_subject))
    }

    pub fn roots(&self) -> Option<Arc<RootCertStore>> {
        self.roots.clone()
    }

    pub fn requires_client_certificate(&self) -> bool {
        self.roots.is_some()
    }

    pub fn required_subject(&self) -> Option<&str> {
        self.required_subject.as_deref()
    }

    /// Decide whether a peer presenting `chains` may connect.
    ///
    /// Without a root bundle the policy is inactive and always grants. With a
    /// bundle but no required subject every validated peer is granted.
    /// Otherwise the leaf subject of some chain must equal the required
    /// subject exactly; zero chains deny.
    pub fn authorize(&self, chains: &[VerifiedChain]) -> AuthorizationDecision {
        if self.roots.is_none() {
            return AuthorizationDecision::Granted;
        }
        let Some(required) = self.required_subject.as_deref() else {
            return AuthorizationDecision::Granted;
        };

        let mut observed = BTreeSet::new();
        for chain in chains {
            for cert in chain.certificates() {
                debug!(
                    target = "folio::tls::authorize",
                    subject = %cert.subject,
                    serial = %cert.serial,
                    "Examining client certificate"
                );
            }

            let Some(leaf) = chain.leaf() else {
                continue;
            };
            if leaf.subject == required {
                debug!(
                    target = "folio::tls::authorize",
                    subject = %leaf.subject,
                    "Allowing client certificate"
                );
                return AuthorizationDecision::Granted;
            }
            observed.insert(leaf.subject.clone());
        }

        let observed_subjects: Vec<String> = observed.into_iter().collect();
        warn!(
            target = "folio::tls::authorize",
            required_subject = required,
            rejected_subjects = %observed_subjects.join(", "),
            chains = chains.len(),
            "Access denied, no valid client certificate provided"
        );
        metrics::counter!("folio_tls_denied_total").increment(1);

        AuthorizationDecision::Denied { observed_subjects }
    }
}
