//! Linking a new browser to an existing account from another device.
//!
//! The new browser shows a short code derived from its pending public key and
//! waits for an activation push. The companion device, already signed in, looks
//! the code up, checks who the request is for and approves it server side.

use crate::auth::{AuthContext, Session};
use crate::certificate::CertificateWrapper;
use crate::error::{AuthError, Result};
use crate::keygen::inspect_csr;
use crate::transport::{ActivationMessage, ActivationSubscription};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{info, instrument, warn};

const CODE_HEX_LEN: usize = 8;

static ACTIVATION_CODE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?i)^([0-9a-f]{4})-?([0-9a-f]{4})$"));

/// `xxxx-xxxx` from the last 8 hex characters of the key.
///
/// # Errors
/// `InvalidCode` if the key is shorter than 8 hex characters.
pub fn activation_code(public_key_hex: &str) -> Result<String> {
    let key = public_key_hex.trim().to_ascii_lowercase();
    if key.len() < CODE_HEX_LEN || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(AuthError::InvalidCode(format!(
            "public key {public_key_hex:?} is not a hex fingerprint"
        )));
    }
    let tail = &key[key.len() - CODE_HEX_LEN..];
    Ok(format!("{}-{}", &tail[..4], &tail[4..]))
}

/// Accepts `xxxx-xxxx` or `xxxxxxxx` in any case and returns `xxxx-xxxx`.
///
/// # Errors
/// `InvalidCode` for anything else.
pub fn normalize_activation_code(input: &str) -> Result<String> {
    let pattern = ACTIVATION_CODE
        .as_ref()
        .map_err(|err| AuthError::Config(format!("activation code pattern: {err}")))?;
    let captures = pattern
        .captures(input.trim())
        .ok_or_else(|| AuthError::InvalidCode(format!("{input:?} is not an activation code")))?;
    Ok(format!("{}-{}", &captures[1], &captures[2]).to_ascii_lowercase())
}

/// A recovery waiting for approval.
pub struct PendingRecovery {
    pub username: String,
    pub code: String,
    pub public_key_hex: String,
    subscription: ActivationSubscription,
}

impl std::fmt::Debug for PendingRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRecovery")
            .field("username", &self.username)
            .field("code", &self.code)
            .field("public_key_hex", &self.public_key_hex)
            .finish_non_exhaustive()
    }
}

/// A request found by its code on the companion device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryCandidate {
    pub username: String,
    pub csr: String,
    pub public_key_hex: String,
}

pub struct RecoveryFlow {
    ctx: Arc<AuthContext>,
}

impl RecoveryFlow {
    #[must_use]
    pub fn new(ctx: Arc<AuthContext>) -> Self {
        Self { ctx }
    }

    /// Registers the pending request under its activation code and subscribes
    /// to the activation push for its key. An existing pending request is
    /// reused.
    ///
    /// # Errors
    /// Storage, key generation and transport errors.
    #[instrument(skip(self))]
    pub async fn begin_recovery(&self, username: &str) -> Result<PendingRecovery> {
        let user_id = match self.ctx.store.get(username).await? {
            Some(record) => record
                .certificate
                .as_ref()
                .and_then(|entry| entry.wrapper().ok())
                .and_then(|wrapper| wrapper.user_id().map(str::to_string)),
            None => None,
        };
        let request = self
            .ctx
            .lifecycle()
            .ensure_request(username, user_id.as_deref())
            .await?;
        let code = activation_code(&request.public_key_hex)?;

        self.ctx.api.add_recovery_request(username, &request.pem).await?;
        let subscription = self.ctx.api.subscribe_activation(&request.public_key_hex).await?;
        info!(username, code = %code, "recovery request registered");

        Ok(PendingRecovery {
            username: username.to_string(),
            code,
            public_key_hex: request.public_key_hex,
            subscription,
        })
    }

    /// Stores the certificate carried by an activation push.
    ///
    /// # Errors
    /// - `Mismatch` if the push is for another key than the pending request or
    ///   the certificate is issued to another user.
    /// - `UntrustedChain` if the chain does not lead to the CA.
    #[instrument(skip(self, message), fields(fingerprint = %message.fingerprint_pk))]
    pub async fn handle_activation(&self, username: &str, message: &ActivationMessage) -> Result<()> {
        let record = self
            .ctx
            .store
            .get(username)
            .await?
            .ok_or_else(|| AuthError::Mismatch(format!("no pending request for {username}")))?;
        let pending = record
            .pending_request
            .as_ref()
            .ok_or_else(|| AuthError::Mismatch(format!("no pending request for {username}")))?;
        if pending.public_key_hex != message.fingerprint_pk {
            warn!(username, expected = %pending.public_key_hex, "activation for another key");
            return Err(AuthError::Mismatch(
                "activation does not match the pending request".into(),
            ));
        }

        let certificates = self.ctx.certificates();
        let chain: Vec<String> = message
            .certificat
            .iter()
            .filter(|pem| !certificates.is_ca(pem))
            .cloned()
            .collect();
        let leaf = CertificateWrapper::parse(&chain)?;
        if leaf.common_name() != Some(username) {
            warn!(username, issued_to = ?leaf.common_name(), "activation for another user");
            return Err(AuthError::Mismatch(format!(
                "certificate issued to {:?}, expected {username}",
                leaf.common_name()
            )));
        }

        self.ctx.adopt_issued(username, &message.certificat).await
    }

    /// Stores the activated certificate and opens a session with it.
    ///
    /// # Errors
    /// As [`handle_activation`](Self::handle_activation), then session errors.
    pub async fn complete_activation(
        &self,
        username: &str,
        message: &ActivationMessage,
        session_duration_secs: u64,
    ) -> Result<Session> {
        self.handle_activation(username, message).await?;
        self.ctx
            .confirm_and_activate(username, session_duration_secs)
            .await
    }

    /// Waits for the activation push for the pending key and completes it.
    /// Forged pushes and pushes for another key or user are logged and
    /// skipped. The subscription is closed whatever the outcome.
    ///
    /// # Errors
    /// `Disconnected` if the subscription ends, otherwise storage and session
    /// errors from [`complete_activation`](Self::complete_activation).
    #[instrument(skip(self, pending), fields(username = %pending.username))]
    pub async fn wait_for_activation(
        &self,
        mut pending: PendingRecovery,
        session_duration_secs: u64,
    ) -> Result<Session> {
        let outcome = loop {
            let message = match pending.subscription.recv().await {
                Ok(message) => message,
                Err(err @ AuthError::Disconnected(_)) => break Err(err),
                Err(err) => {
                    warn!("skipping unverifiable activation: {err}");
                    continue;
                }
            };
            match self
                .complete_activation(&pending.username, &message, session_duration_secs)
                .await
            {
                Err(
                    err @ (AuthError::Mismatch(_)
                    | AuthError::UntrustedChain(_)
                    | AuthError::InvalidCertificate(_)),
                ) => warn!("skipping activation: {err}"),
                outcome => break outcome,
            }
        };
        if let Err(err) = pending.subscription.close().await {
            warn!("closing activation subscription: {err}");
        }
        outcome
    }

    /// Looks a code up on behalf of an authenticated companion device.
    ///
    /// Returns `None` when no request is registered under the code.
    ///
    /// # Errors
    /// - `InvalidCode` for malformed input.
    /// - `Mismatch` if the CSR is for another user than the server reports.
    #[instrument(skip(self))]
    pub async fn lookup_code(&self, code: &str) -> Result<Option<RecoveryCandidate>> {
        let code = normalize_activation_code(code)?;
        let Some(request) = self.ctx.api.get_recovery_request_by_code(&code).await? else {
            return Ok(None);
        };
        let csr = inspect_csr(&request.csr)?;
        if csr.common_name.as_deref() != Some(request.username.as_str()) {
            warn!(code = %code, reported = %request.username, "recovery CSR for another user");
            return Err(AuthError::Mismatch(format!(
                "CSR issued for {:?}, server reports {}",
                csr.common_name, request.username
            )));
        }
        if activation_code(&csr.public_key_hex)? != code {
            return Err(AuthError::Mismatch("CSR key does not match the code".into()));
        }
        Ok(Some(RecoveryCandidate {
            username: request.username,
            csr: request.csr,
            public_key_hex: csr.public_key_hex,
        }))
    }
}
