use super::{pem_to_der, CertificateWrapper};
use crate::encoding::blake2s_256;
use crate::error::{AuthError, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;
use x509_parser::prelude::*;

const CACHE_CAPACITY: usize = 20;

/// Trust anchor for every signed response: the MilleGrille CA plus a small
/// cache of leaf certificates whose chain was already validated.
#[derive(Debug)]
pub struct CertificateStore {
    ca_pem: String,
    ca_der: Vec<u8>,
    idmg: String,
    validated: Mutex<VecDeque<String>>,
}

impl CertificateStore {
    /// Loads the CA certificate. The CA must be self-signed.
    ///
    /// # Errors
    /// Returns `InvalidCertificate` if the PEM does not parse or the CA is not
    /// self-signed.
    pub fn new(ca_pem: &str) -> Result<Self> {
        let ca_der = pem_to_der(ca_pem)?;
        {
            let (_, ca) = parse_x509_certificate(&ca_der)
                .map_err(|err| AuthError::InvalidCertificate(format!("CA: {err}")))?;
            ca.verify_signature(None).map_err(|err| {
                AuthError::InvalidCertificate(format!("CA is not self-signed: {err}"))
            })?;
        }

        Ok(Self {
            ca_pem: ca_pem.to_string(),
            idmg: hex::encode(blake2s_256(&ca_der)),
            ca_der,
            validated: Mutex::new(VecDeque::with_capacity(CACHE_CAPACITY)),
        })
    }

    #[must_use]
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Identity of the MilleGrille, derived from the CA certificate.
    #[must_use]
    pub fn idmg(&self) -> &str {
        &self.idmg
    }

    /// True when `pem` is this store's CA certificate.
    #[must_use]
    pub fn is_ca(&self, pem: &str) -> bool {
        pem_to_der(pem).is_ok_and(|der| der == self.ca_der)
    }

    /// Verifies that every link of `chain` is signed by the next one and that
    /// the last link is signed by the CA. The leaf must be valid at `now`.
    ///
    /// # Errors
    /// `UntrustedChain` when a link does not verify, `InvalidCertificate` when
    /// the leaf is outside its validity window.
    pub fn verify_chain(&self, chain: &CertificateWrapper, now: i64) -> Result<()> {
        if !chain.is_valid_at(now) {
            return Err(AuthError::InvalidCertificate(format!(
                "certificate not valid at {now} (valid {} to {})",
                chain.not_before(),
                chain.not_after()
            )));
        }

        let fingerprint = chain.fingerprint();
        if self.is_cached(&fingerprint) {
            debug!(fingerprint = %fingerprint, "certificate chain already validated");
            return Ok(());
        }

        let mut ders: Vec<&[u8]> = chain.ders().iter().map(Vec::as_slice).collect();
        if ders.len() > 1 && ders.last().is_some_and(|last| *last == self.ca_der.as_slice()) {
            ders.pop();
        }

        let (_, ca) = parse_x509_certificate(&self.ca_der)
            .map_err(|err| AuthError::InvalidCertificate(format!("CA: {err}")))?;

        for (index, der) in ders.iter().enumerate() {
            let (_, cert) = parse_x509_certificate(der)
                .map_err(|err| AuthError::InvalidCertificate(format!("chain element {index}: {err}")))?;
            let issuer_der = ders.get(index + 1);
            match issuer_der {
                Some(issuer_der) => {
                    let (_, issuer) = parse_x509_certificate(issuer_der).map_err(|err| {
                        AuthError::InvalidCertificate(format!("chain element {}: {err}", index + 1))
                    })?;
                    verify_link(&cert, &issuer, index)?;
                }
                None => verify_link(&cert, &ca, index)?,
            }
        }

        self.remember(fingerprint);
        Ok(())
    }

    fn is_cached(&self, fingerprint: &str) -> bool {
        self.validated
            .lock()
            .map(|cache| cache.iter().any(|entry| entry == fingerprint))
            .unwrap_or(false)
    }

    fn remember(&self, fingerprint: String) {
        if let Ok(mut cache) = self.validated.lock() {
            if cache.len() >= CACHE_CAPACITY {
                cache.pop_front();
            }
            cache.push_back(fingerprint);
        }
    }
}

fn verify_link(cert: &X509Certificate<'_>, issuer: &X509Certificate<'_>, index: usize) -> Result<()> {
    if cert.issuer() != issuer.subject() {
        return Err(AuthError::UntrustedChain(format!(
            "chain element {index} issued by {}, expected {}",
            cert.issuer(),
            issuer.subject()
        )));
    }
    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|err| AuthError::UntrustedChain(format!("chain element {index}: {err}")))
}
