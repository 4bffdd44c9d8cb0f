//! WebAuthn challenge preparation.
//!
//! ### Flow Overview
//! 1. **Decode**: the server's `publicKey` options carry base64url strings; the
//!    challenge and the allowed credential ids are decoded to raw bytes.
//! 2. **Attest**: when a CSR is pending, a `demandeCertificat` object is built and
//!    its blake2s-256 digest over canonical JSON is appended to the 32 byte server
//!    challenge. The device then signs both the login and the certificate request.
//! 3. **Hand off**: the resulting [`PreparedChallenge`] is passed unchanged to the
//!    security device and, with its `challenge_reference`, to the server.

use crate::encoding::{blake2s_256, canonical_json, decode_base64url};
use crate::error::{AuthError, Result};
use crate::lifecycle::now_unix_seconds;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Length of a server challenge that can carry a CSR attestation.
pub const SERVER_CHALLENGE_LEN: usize = 32;

/// Challenge as sent by the server (`authentication_challenge`).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticationChallenge {
    #[serde(rename = "publicKey", default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKeyChallenge>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyChallenge {
    pub challenge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_credentials: Option<Vec<CredentialDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rp_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_verification: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialDescriptor {
    pub id: String,
    #[serde(rename = "type", default = "public_key_type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transports: Option<Vec<String>>,
}

fn public_key_type() -> String {
    "public-key".to_string()
}

/// Decoded options handed to the security device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyOptions {
    pub challenge: Vec<u8>,
    pub allow_credentials: Vec<AllowedCredential>,
    pub rp_id: Option<String>,
    pub timeout: Option<u64>,
    pub user_verification: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllowedCredential {
    pub id: Vec<u8>,
    pub kind: String,
    pub transports: Option<Vec<String>>,
}

/// Certificate request piggy-backed on an authentication.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CsrAttestation {
    #[serde(rename = "nomUsager")]
    pub username: String,
    pub csr: String,
    #[serde(rename = "date")]
    pub timestamp_seconds: i64,
    #[serde(
        rename = "activationTierce",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub activation_third_party: Option<bool>,
}

impl CsrAttestation {
    /// blake2s-256 over the canonical JSON form.
    ///
    /// # Errors
    /// Fails only if serialization fails.
    pub fn digest(&self) -> Result<[u8; 32]> {
        Ok(blake2s_256(&canonical_json(self)?))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedChallenge {
    pub public_key: PublicKeyOptions,
    pub csr_attestation: Option<CsrAttestation>,
    /// Original base64url challenge, echoed back to the server.
    pub challenge_reference: String,
}

/// Prepares `server_challenge` for signing at the current time.
///
/// # Errors
/// See [`prepare_at`].
pub fn prepare(
    username: &str,
    server_challenge: &AuthenticationChallenge,
    pending_csr: Option<&str>,
    third_party_activation: bool,
) -> Result<PreparedChallenge> {
    prepare_at(
        username,
        server_challenge,
        pending_csr,
        third_party_activation,
        now_unix_seconds(),
    )
}

/// Prepares `server_challenge` for signing, stamping any CSR attestation with `now`.
///
/// # Errors
/// `MissingPublicKeyField` when the challenge has no `publicKey` options,
/// `Encoding` for undecodable base64url, `ChallengeMalformed` when a CSR must be
/// attested but the server challenge is not 32 bytes.
pub fn prepare_at(
    username: &str,
    server_challenge: &AuthenticationChallenge,
    pending_csr: Option<&str>,
    third_party_activation: bool,
    now: i64,
) -> Result<PreparedChallenge> {
    let options = server_challenge
        .public_key
        .as_ref()
        .ok_or(AuthError::MissingPublicKeyField)?;

    let mut challenge = decode_base64url(&options.challenge)?;
    let allow_credentials = options
        .allow_credentials
        .iter()
        .flatten()
        .map(|cred| {
            Ok(AllowedCredential {
                id: decode_base64url(&cred.id)?,
                kind: cred.kind.clone(),
                transports: cred.transports.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let csr_attestation = match pending_csr {
        Some(csr) => {
            if challenge.len() != SERVER_CHALLENGE_LEN {
                return Err(AuthError::ChallengeMalformed(format!(
                    "expected a {SERVER_CHALLENGE_LEN} byte challenge, got {}",
                    challenge.len()
                )));
            }
            let attestation = CsrAttestation {
                username: username.to_string(),
                csr: csr.to_string(),
                timestamp_seconds: now,
                activation_third_party: third_party_activation.then_some(true),
            };
            challenge.extend_from_slice(&attestation.digest()?);
            debug!(username, "CSR attestation appended to challenge");
            Some(attestation)
        }
        None => None,
    };

    Ok(PreparedChallenge {
        public_key: PublicKeyOptions {
            challenge,
            allow_credentials,
            rp_id: options.rp_id.clone(),
            timeout: options.timeout,
            user_verification: options.user_verification.clone(),
        },
        csr_attestation,
        challenge_reference: options.challenge.clone(),
    })
}
