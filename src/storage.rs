//! Per-user persisted identity.
//!
//! The store itself is a collaborator; this module only defines the record
//! shape, the trait the core needs and an in-memory implementation.

use crate::certificate::{CertificateStore, CertificateWrapper};
use crate::error::{AuthError, Result};
use crate::keygen::CertificateRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Active signing identity. `chain` never contains the CA.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CertificateEntry {
    pub chain: Vec<String>,
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
    pub public_key_hex: String,
}

impl fmt::Debug for CertificateEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateEntry")
            .field("chain_len", &self.chain.len())
            .field("public_key_hex", &self.public_key_hex)
            .field("private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl CertificateEntry {
    /// Builds the entry for a chain the server issued against `request`.
    ///
    /// Any CA certificate in `chain` is dropped, the rest must verify against
    /// the CA and its leaf must carry the request's public key.
    ///
    /// # Errors
    /// - `InvalidCertificate` if nothing remains after removing the CA or the
    ///   leaf does not parse.
    /// - `UntrustedChain` if the chain does not lead to the CA.
    /// - `Mismatch` if the leaf key is not the requested one.
    pub fn from_issued(
        request: &CertificateRequest,
        chain: &[String],
        store: &CertificateStore,
        now: i64,
    ) -> Result<Self> {
        let chain: Vec<String> = chain.iter().filter(|pem| !store.is_ca(pem)).cloned().collect();
        let wrapper = CertificateWrapper::parse(&chain)?;
        store.verify_chain(&wrapper, now)?;

        if wrapper.public_key_hex() != request.public_key_hex {
            warn!(
                expected = %request.public_key_hex,
                received = %wrapper.public_key_hex(),
                "issued certificate does not match the pending request"
            );
            return Err(AuthError::Mismatch(
                "issued certificate key differs from the pending request".into(),
            ));
        }

        Ok(Self {
            chain,
            private_key: request.private_key.clone(),
            public_key: request.public_key.clone(),
            public_key_hex: request.public_key_hex.clone(),
        })
    }

    /// # Errors
    /// `InvalidCertificate` if the stored chain no longer parses.
    pub fn wrapper(&self) -> Result<CertificateWrapper> {
        CertificateWrapper::parse(&self.chain)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    #[serde(default)]
    pub certificate: Option<CertificateEntry>,
    #[serde(default)]
    pub pending_request: Option<CertificateRequest>,
}

impl UserRecord {
    #[must_use]
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            ..Self::default()
        }
    }
}

/// Local persistence keyed by username. Every `get` returns an independent copy.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, username: &str) -> Result<Option<UserRecord>>;

    async fn put(&self, username: &str, record: UserRecord) -> Result<()>;

    async fn usernames(&self) -> Result<Vec<String>>;

    /// Removes the certificate and keeps any pending request.
    async fn clear_certificate(&self, username: &str) -> Result<()> {
        if let Some(mut record) = self.get(username).await? {
            if record.certificate.take().is_some() {
                debug!(username, "certificate cleared");
                self.put(username, record).await?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserStore {
    records: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get(&self, username: &str) -> Result<Option<UserRecord>> {
        Ok(self.records.read().await.get(username).cloned())
    }

    async fn put(&self, username: &str, record: UserRecord) -> Result<()> {
        if record.username != username {
            return Err(AuthError::Storage(format!(
                "record for {} stored under {username}",
                record.username
            )));
        }
        self.records.write().await.insert(username.to_string(), record);
        Ok(())
    }

    async fn usernames(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.records.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
