use std::sync::Arc;

use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, Error, SignatureScheme,
    client::danger::HandshakeSignatureValid,
    pki_types::{CertificateDer, UnixTime},
    server::danger::{ClientCertVerified, ClientCertVerifier},
};
use tracing::warn;

use super::policy::{TrustPolicy, VerifiedChain};

/// Client certificate verifier that runs the subject policy after the inner
/// verifier has validated the chain against the root bundle.
///
/// rustls hands over the leaf and the presented intermediates rather than a
/// list of built chains, so the policy sees exactly one chain, leaf first.
#[derive(Debug)]
pub struct SubjectVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    policy: Arc<TrustPolicy>,
}

impl SubjectVerifier {
    pub fn new(inner: Arc<dyn ClientCertVerifier>, policy: Arc<TrustPolicy>) -> Self {
        Self { inner, policy }
    }
}

impl ClientCertVerifier for SubjectVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, Error> {
        let verified = self
            .inner
            .verify_client_cert(end_entity, intermediates, now)?;

        let mut presented = Vec::with_capacity(intermediates.len() + 1);
        presented.push(end_entity.clone());
        presented.extend(intermediates.iter().cloned());

        let chain = VerifiedChain::from_der(&presented).map_err(|err| {
            warn!(
                target = "folio::tls::verifier",
                error = %err,
                "Failed to parse client certificate chain"
            );
            Error::InvalidCertificate(CertificateError::BadEncoding)
        })?;

        if self.policy.authorize(&[chain]).is_granted() {
            Ok(verified)
        } else {
            Err(Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
