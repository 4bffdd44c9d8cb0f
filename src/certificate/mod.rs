//! X.509 certificate chains as handed out by the MilleGrilles certificate authority.
//!
//! A chain is a list of PEM blocks, leaf first. The CA itself is never part of a
//! stored per-user chain; it lives in the [`CertificateStore`].

mod store;

pub use store::CertificateStore;

use crate::encoding::blake2s_256;
use crate::error::{AuthError, Result};
use base64ct::{Base64, Encoding};
use x509_parser::pem::{parse_x509_pem, Pem};
use x509_parser::prelude::*;

const PEM_LABEL: &str = "CERTIFICATE";

pub const OID_EXCHANGES: &str = "1.2.3.4.0";
pub const OID_ROLES: &str = "1.2.3.4.1";
pub const OID_DOMAINS: &str = "1.2.3.4.2";
pub const OID_USER_ID: &str = "1.2.3.4.3";
pub const OID_GLOBAL_DELEGATION: &str = "1.2.3.4.4";

/// Arc form of [`OID_USER_ID`], used when building requests.
pub const OID_USER_ID_ARCS: &[u64] = &[1, 2, 3, 4, 3];

/// Named fields readable from the leaf certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extension {
    CommonName,
    UserId,
    Delegation,
    Roles,
    Exchanges,
    Domains,
}

/// Parsed certificate chain with the leaf fields extracted up front.
#[derive(Clone, Debug)]
pub struct CertificateWrapper {
    chain: Vec<String>,
    ders: Vec<Vec<u8>>,
    not_before: i64,
    not_after: i64,
    common_name: Option<String>,
    user_id: Option<String>,
    delegation: Option<String>,
    roles: Option<String>,
    exchanges: Option<String>,
    domains: Option<String>,
    public_key: Vec<u8>,
}

impl CertificateWrapper {
    /// Parses a leaf-first PEM chain.
    ///
    /// # Errors
    /// Returns `InvalidCertificate` if the chain is empty or any block is not a
    /// well-formed X.509 certificate.
    pub fn parse(chain: &[String]) -> Result<Self> {
        if chain.is_empty() {
            return Err(AuthError::InvalidCertificate("empty chain".into()));
        }

        let ders = chain
            .iter()
            .map(|pem| pem_to_der(pem))
            .collect::<Result<Vec<_>>>()?;

        let (_, leaf) = parse_x509_certificate(&ders[0])
            .map_err(|err| AuthError::InvalidCertificate(format!("leaf: {err}")))?;
        for (index, der) in ders.iter().enumerate().skip(1) {
            parse_x509_certificate(der).map_err(|err| {
                AuthError::InvalidCertificate(format!("chain element {index}: {err}"))
            })?;
        }

        let validity = leaf.validity();
        let common_name = leaf
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        let mut wrapper = Self {
            chain: chain.to_vec(),
            not_before: validity.not_before.timestamp(),
            not_after: validity.not_after.timestamp(),
            common_name,
            user_id: None,
            delegation: None,
            roles: None,
            exchanges: None,
            domains: None,
            public_key: leaf.public_key().subject_public_key.data.to_vec(),
            ders: Vec::new(),
        };

        for ext in leaf.extensions() {
            let value = String::from_utf8(ext.value.to_vec()).ok();
            match ext.oid.to_id_string().as_str() {
                OID_USER_ID => wrapper.user_id = value,
                OID_GLOBAL_DELEGATION => wrapper.delegation = value,
                OID_ROLES => wrapper.roles = value,
                OID_EXCHANGES => wrapper.exchanges = value,
                OID_DOMAINS => wrapper.domains = value,
                _ => {}
            }
        }

        wrapper.ders = ders;
        Ok(wrapper)
    }

    #[must_use]
    pub fn not_before(&self) -> i64 {
        self.not_before
    }

    #[must_use]
    pub fn not_after(&self) -> i64 {
        self.not_after
    }

    #[must_use]
    pub fn is_valid_at(&self, now: i64) -> bool {
        now >= self.not_before && now <= self.not_after
    }

    #[must_use]
    pub fn extension(&self, name: Extension) -> Option<&str> {
        match name {
            Extension::CommonName => self.common_name.as_deref(),
            Extension::UserId => self.user_id.as_deref(),
            Extension::Delegation => self.delegation.as_deref(),
            Extension::Roles => self.roles.as_deref(),
            Extension::Exchanges => self.exchanges.as_deref(),
            Extension::Domains => self.domains.as_deref(),
        }
    }

    #[must_use]
    pub fn common_name(&self) -> Option<&str> {
        self.extension(Extension::CommonName)
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.extension(Extension::UserId)
    }

    /// Raw Ed25519 public key of the leaf.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(&self.public_key)
    }

    /// Hex blake2s-256 digest of the leaf DER.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        hex::encode(blake2s_256(&self.ders[0]))
    }

    #[must_use]
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    pub(crate) fn ders(&self) -> &[Vec<u8>] {
        &self.ders
    }
}

/// Splits a concatenated PEM file into one certificate per entry, in file
/// order. Text outside the blocks is skipped.
///
/// # Errors
/// `InvalidCertificate` for a truncated or undecodable block, or a block that
/// is not a certificate.
pub fn split_pem_chain(text: &str) -> Result<Vec<String>> {
    Pem::iter_from_buffer(text.as_bytes())
        .enumerate()
        .map(|(index, block)| {
            let block = block.map_err(|err| {
                AuthError::InvalidCertificate(format!("PEM block {index}: {err}"))
            })?;
            if block.label != PEM_LABEL {
                return Err(AuthError::InvalidCertificate(format!(
                    "PEM block {index}: unexpected label {}",
                    block.label
                )));
            }
            Ok(der_to_pem(&block.contents))
        })
        .collect()
}

fn der_to_pem(der: &[u8]) -> String {
    let body = Base64::encode_string(der);
    let mut pem = format!("-----BEGIN {PEM_LABEL}-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {PEM_LABEL}-----\n"));
    pem
}

pub(crate) fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let (_, block) = parse_x509_pem(pem.as_bytes())
        .map_err(|err| AuthError::InvalidCertificate(format!("invalid PEM: {err}")))?;
    if block.label != PEM_LABEL {
        return Err(AuthError::InvalidCertificate(format!(
            "unexpected PEM label {}",
            block.label
        )));
    }
    Ok(block.contents)
}
