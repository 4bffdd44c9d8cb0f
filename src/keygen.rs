//! Ed25519 keypair and CSR generation.

use crate::certificate::OID_USER_ID_ARCS;
use crate::error::{AuthError, Result};
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::SigningKey;
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair, PKCS_ED25519};
use serde::{Deserialize, Serialize};
use std::fmt;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;

/// A CSR together with the key material that produced it.
///
/// The request is useless without its private key, so it must be persisted
/// before it is sent anywhere.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateRequest {
    pub pem: String,
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
    pub public_key_hex: String,
    pub private_key_pem: String,
}

impl fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("public_key_hex", &self.public_key_hex)
            .field("private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl CertificateRequest {
    /// Rebuilds the signing key from the stored seed.
    ///
    /// # Errors
    /// Returns `KeyGeneration` if the stored seed is not 32 bytes.
    pub fn signing_key(&self) -> Result<SigningKey> {
        signing_key_from_seed(&self.private_key)
    }
}

/// Generates a fresh Ed25519 keypair and a CSR with `username` as common name.
///
/// When `user_id` is known it is embedded as the MilleGrilles user id extension
/// so the issued certificate keeps the same account binding.
///
/// # Errors
/// Returns `KeyGeneration` if rcgen fails to produce the key or the request.
pub fn create_request(username: &str, user_id: Option<&str>) -> Result<CertificateRequest> {
    let key_pair = KeyPair::generate_for(&PKCS_ED25519)
        .map_err(|err| AuthError::KeyGeneration(err.to_string()))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, username);
    if let Some(user_id) = user_id {
        params.custom_extensions.push(CustomExtension::from_oid_content(
            OID_USER_ID_ARCS,
            user_id.as_bytes().to_vec(),
        ));
    }

    let pem = params
        .serialize_request(&key_pair)
        .and_then(|csr| csr.pem())
        .map_err(|err| AuthError::KeyGeneration(format!("csr: {err}")))?;

    let signing_key = SigningKey::from_pkcs8_der(&key_pair.serialize_der())
        .map_err(|err| AuthError::KeyGeneration(format!("pkcs8: {err}")))?;
    let public_key = signing_key.verifying_key().to_bytes().to_vec();

    Ok(CertificateRequest {
        pem,
        private_key: signing_key.to_bytes().to_vec(),
        public_key_hex: hex::encode(&public_key),
        public_key,
        private_key_pem: key_pair.serialize_pem(),
    })
}

pub(crate) fn signing_key_from_seed(seed: &[u8]) -> Result<SigningKey> {
    let seed: [u8; 32] = seed
        .try_into()
        .map_err(|_| AuthError::KeyGeneration(format!("expected 32 byte seed, got {}", seed.len())))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Identity claims read back from a CSR.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsrInfo {
    pub common_name: Option<String>,
    pub public_key_hex: String,
}

/// Parses a PEM CSR and checks its self-signature.
///
/// # Errors
/// Returns `InvalidCertificate` if the PEM is not a well-formed, self-consistent
/// certification request.
pub fn inspect_csr(pem: &str) -> Result<CsrInfo> {
    let (_, block) = parse_x509_pem(pem.as_bytes())
        .map_err(|err| AuthError::InvalidCertificate(format!("invalid CSR PEM: {err}")))?;
    if block.label != "CERTIFICATE REQUEST" {
        return Err(AuthError::InvalidCertificate(format!(
            "unexpected PEM label {}",
            block.label
        )));
    }
    let (_, csr) = X509CertificationRequest::from_der(&block.contents)
        .map_err(|err| AuthError::InvalidCertificate(format!("invalid CSR: {err}")))?;
    csr.verify_signature()
        .map_err(|err| AuthError::InvalidCertificate(format!("CSR signature: {err}")))?;

    let info = &csr.certification_request_info;
    let common_name = info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    Ok(CsrInfo {
        common_name,
        public_key_hex: hex::encode(&info.subject_pki.subject_public_key.data),
    })
}
