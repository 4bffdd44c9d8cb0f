//! MilleGrilles signed message envelope.

use crate::encoding::{blake2s_256, canonical_json, canonical_json_string};
use crate::error::{AuthError, Result};
use crate::keygen::signing_key_from_seed;
use crate::storage::CertificateEntry;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Document,
    Request,
    Command,
    Transaction,
    Event,
    EncryptedResponse,
    MigratedTransaction,
    InterMillegrilleCommand,
}

impl MessageKind {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Document => 0,
            Self::Request => 1,
            Self::Command => 2,
            Self::Transaction => 3,
            Self::Event => 5,
            Self::EncryptedResponse => 6,
            Self::MigratedTransaction => 7,
            Self::InterMillegrilleCommand => 8,
        }
    }

    /// Routed kinds include `routage` in their id.
    #[must_use]
    pub fn is_routed(self) -> bool {
        matches!(
            self,
            Self::Request
                | Self::Command
                | Self::Transaction
                | Self::Event
                | Self::MigratedTransaction
                | Self::InterMillegrilleCommand
        )
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = AuthError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Document,
            1 => Self::Request,
            2 => Self::Command,
            3 => Self::Transaction,
            5 => Self::Event,
            6 => Self::EncryptedResponse,
            7 => Self::MigratedTransaction,
            8 => Self::InterMillegrilleCommand,
            other => return Err(AuthError::UnknownResponseType(format!("kind {other}"))),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Routage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domaine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl Routage {
    #[must_use]
    pub fn new(domaine: &str, action: &str) -> Self {
        Self {
            domaine: Some(domaine.to_string()),
            action: Some(action.to_string()),
        }
    }
}

/// Wire form of a signed message. `kind` is kept raw so unknown kinds survive
/// deserialization and can be rejected explicitly.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MilleGrillesMessage {
    pub id: String,
    pub pubkey: String,
    pub estampille: i64,
    pub kind: u8,
    pub contenu: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routage: Option<Routage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificat: Option<Vec<String>>,
}

impl MilleGrillesMessage {
    /// Recomputes the message id from its signed fields.
    ///
    /// # Errors
    /// `UnknownResponseType` for unknown kinds.
    pub fn compute_id(&self) -> Result<String> {
        let kind = MessageKind::try_from(self.kind)?;
        compute_id(&self.pubkey, self.estampille, kind, &self.contenu, self.routage.as_ref())
    }
}

fn compute_id(
    pubkey: &str,
    estampille: i64,
    kind: MessageKind,
    contenu: &str,
    routage: Option<&Routage>,
) -> Result<String> {
    let fields = if kind.is_routed() {
        let routage = routage.ok_or_else(|| {
            AuthError::Encoding(format!("kind {} requires routage", kind.code()))
        })?;
        json!([pubkey, estampille, kind.code(), contenu, routage])
    } else {
        json!([pubkey, estampille, kind.code(), contenu])
    };
    Ok(hex::encode(blake2s_256(&canonical_json(&fields)?)))
}

/// Signs outgoing messages with a certificate's key.
pub struct MessageFactory {
    signing_key: SigningKey,
    chain: Vec<String>,
    pubkey: String,
}

impl MessageFactory {
    #[must_use]
    pub fn new(signing_key: SigningKey, chain: Vec<String>) -> Self {
        let pubkey = hex::encode(signing_key.verifying_key().as_bytes());
        Self {
            signing_key,
            chain,
            pubkey,
        }
    }

    /// Factory for a stored user certificate.
    ///
    /// # Errors
    /// `KeyGeneration` if the stored private key is unusable, `Mismatch` if it
    /// does not belong to the stored public key.
    pub fn from_entry(entry: &CertificateEntry) -> Result<Self> {
        let signing_key = signing_key_from_seed(&entry.private_key)?;
        let factory = Self::new(signing_key, entry.chain.clone());
        if factory.pubkey != entry.public_key_hex {
            return Err(AuthError::Mismatch(
                "stored private key does not match the certificate".into(),
            ));
        }
        Ok(factory)
    }

    #[must_use]
    pub fn public_key_hex(&self) -> &str {
        &self.pubkey
    }

    /// # Errors
    /// Fails if `content` does not serialize.
    pub fn create_routed_message<T: Serialize + ?Sized>(
        &self,
        kind: MessageKind,
        content: &T,
        routage: Routage,
        estampille: i64,
    ) -> Result<MilleGrillesMessage> {
        self.sign(kind, content, Some(routage), estampille)
    }

    /// # Errors
    /// Fails if `content` does not serialize.
    pub fn create_response<T: Serialize + ?Sized>(
        &self,
        content: &T,
        estampille: i64,
    ) -> Result<MilleGrillesMessage> {
        self.sign(MessageKind::Document, content, None, estampille)
    }

    fn sign<T: Serialize + ?Sized>(
        &self,
        kind: MessageKind,
        content: &T,
        routage: Option<Routage>,
        estampille: i64,
    ) -> Result<MilleGrillesMessage> {
        let contenu = canonical_json_string(content)?;
        let id = compute_id(&self.pubkey, estampille, kind, &contenu, routage.as_ref())?;
        let id_bytes = hex::decode(&id).map_err(|err| AuthError::Encoding(err.to_string()))?;
        let signature = self.signing_key.sign(&id_bytes);

        Ok(MilleGrillesMessage {
            id,
            pubkey: self.pubkey.clone(),
            estampille,
            kind: kind.code(),
            contenu,
            routage: if kind.is_routed() { routage } else { None },
            sig: Some(hex::encode(signature.to_bytes())),
            certificat: Some(self.chain.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    fn factory() -> MessageFactory {
        MessageFactory::new(SigningKey::from_bytes(&[9u8; 32]), vec!["PEM".into()])
    }

    #[test]
    fn kinds_round_trip_and_reject_unknown() {
        for code in [0u8, 1, 2, 3, 5, 6, 7, 8] {
            assert_eq!(MessageKind::try_from(code).unwrap().code(), code);
        }
        assert!(matches!(
            MessageKind::try_from(4),
            Err(AuthError::UnknownResponseType(_))
        ));
        assert!(!MessageKind::Document.is_routed());
        assert!(MessageKind::Command.is_routed());
    }

    #[test]
    fn signed_message_id_and_signature_verify() {
        let factory = factory();
        let message = factory
            .create_routed_message(
                MessageKind::Command,
                &json!({"b": 1, "a": 2}),
                Routage::new("CoreMaitreDesComptes", "authentifierUsager"),
                1_700_000_000,
            )
            .unwrap();

        assert_eq!(message.contenu, r#"{"a":2,"b":1}"#);
        assert_eq!(message.compute_id().unwrap(), message.id);

        let signature = Signature::from_slice(&hex::decode(message.sig.as_ref().unwrap()).unwrap()).unwrap();
        factory
            .signing_key
            .verifying_key()
            .verify(&hex::decode(&message.id).unwrap(), &signature)
            .unwrap();
    }

    #[test]
    fn routage_changes_id() {
        let factory = factory();
        let a = factory
            .create_routed_message(MessageKind::Request, &json!({}), Routage::new("D", "a"), 1)
            .unwrap();
        let b = factory
            .create_routed_message(MessageKind::Request, &json!({}), Routage::new("D", "b"), 1)
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn responses_are_unrouted_documents() {
        let message = factory().create_response(&json!({"ok": true}), 5).unwrap();
        assert_eq!(message.kind, 0);
        assert!(message.routage.is_none());
        assert_eq!(message.compute_id().unwrap(), message.id);
    }

    #[test]
    fn routed_kind_without_routage_is_rejected() {
        let mut message = factory()
            .create_routed_message(MessageKind::Command, &json!({}), Routage::new("D", "a"), 1)
            .unwrap();
        message.routage = None;
        assert!(message.compute_id().is_err());
    }
}
