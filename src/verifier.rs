//! Verification of signed server responses.

use crate::certificate::{CertificateStore, CertificateWrapper};
use crate::error::{AuthError, Result};
use crate::message::{MessageKind, MilleGrillesMessage};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// Payload of a message whose chain and signature were checked.
#[derive(Clone, Debug)]
pub struct VerifiedContent {
    content: Value,
    certificate: CertificateWrapper,
    message: MilleGrillesMessage,
}

impl VerifiedContent {
    #[must_use]
    pub fn content(&self) -> &Value {
        &self.content
    }

    /// Certificate that signed the message.
    #[must_use]
    pub fn certificate(&self) -> &CertificateWrapper {
        &self.certificate
    }

    #[must_use]
    pub fn message(&self) -> &MilleGrillesMessage {
        &self.message
    }

    /// Deserializes the payload.
    ///
    /// # Errors
    /// `Json` when the payload does not have the expected shape.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.content.clone())?)
    }
}

/// Checks a message's certificate chain against the CA, then its id and
/// signature, and only then parses the content.
#[derive(Clone, Debug)]
pub struct ResponseVerifier {
    store: Arc<CertificateStore>,
}

impl ResponseVerifier {
    #[must_use]
    pub fn new(store: Arc<CertificateStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// # Errors
    /// - `InvalidSignature` when the signature or certificate is missing, the
    ///   message was altered, or the signature does not verify.
    /// - `UnknownResponseType` for unknown kinds.
    /// - `UntrustedChain` when the chain does not lead to the CA.
    /// - `UnsupportedEncryptedPayload` for encrypted responses.
    pub fn verify(&self, message: &MilleGrillesMessage, now: i64) -> Result<VerifiedContent> {
        let (Some(sig), Some(chain)) = (message.sig.as_deref(), message.certificat.as_deref())
        else {
            return Err(AuthError::InvalidSignature(
                "response has no signature or certificate".into(),
            ));
        };
        let kind = MessageKind::try_from(message.kind)?;

        let certificate = CertificateWrapper::parse(chain)
            .map_err(|err| AuthError::UntrustedChain(err.to_string()))?;
        self.store.verify_chain(&certificate, now).map_err(|err| match err {
            AuthError::UntrustedChain(_) => err,
            other => AuthError::UntrustedChain(other.to_string()),
        })?;

        if certificate.public_key_hex() != message.pubkey {
            return Err(AuthError::InvalidSignature(
                "pubkey does not match the signing certificate".into(),
            ));
        }

        let expected_id = message.compute_id()?;
        if expected_id != message.id {
            warn!(id = %message.id, "message id does not match its content");
            return Err(AuthError::InvalidSignature("message id does not match content".into()));
        }

        verify_signature(certificate.public_key(), &message.id, sig)?;

        if kind == MessageKind::EncryptedResponse {
            return Err(AuthError::UnsupportedEncryptedPayload);
        }

        let content: Value = serde_json::from_str(&message.contenu)?;
        Ok(VerifiedContent {
            content,
            certificate,
            message: message.clone(),
        })
    }
}

fn verify_signature(public_key: &[u8], id: &str, sig: &str) -> Result<()> {
    let public_key: &[u8; 32] = public_key
        .try_into()
        .map_err(|_| AuthError::InvalidSignature("certificate key is not Ed25519".into()))?;
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|err| AuthError::InvalidSignature(err.to_string()))?;
    let sig_bytes =
        hex::decode(sig).map_err(|err| AuthError::InvalidSignature(format!("sig: {err}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|err| AuthError::InvalidSignature(err.to_string()))?;
    let id_bytes =
        hex::decode(id).map_err(|err| AuthError::InvalidSignature(format!("id: {err}")))?;
    verifying_key
        .verify(&id_bytes, &signature)
        .map_err(|err| AuthError::InvalidSignature(err.to_string()))
}
