//! Server protocol over an abstract connection.
//!
//! [`Connection`] is the transport seam (socket.io in the browser client).
//! [`ServerApi`] builds the account requests on top of it, enforces the request
//! timeouts and runs every reply through the [`ResponseVerifier`]. The only
//! reply accepted without a signature is the connection handshake listed in
//! [`UNVERIFIED_EVENTS`].

use crate::challenge::{AuthenticationChallenge, CsrAttestation};
use crate::config::ClientConfig;
use crate::device::SignedAssertion;
use crate::error::{AuthError, Result};
use crate::lifecycle::now_unix_seconds;
use crate::message::{MessageFactory, MessageKind, MilleGrillesMessage, Routage};
use crate::verifier::{ResponseVerifier, VerifiedContent};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

pub const DOMAIN_ACCOUNTS: &str = "CoreMaitreDesComptes";

pub const ACTION_GET_USER: &str = "getUsager";
pub const ACTION_REGISTER: &str = "inscrireUsager";
pub const ACTION_AUTHENTICATE: &str = "authentifierUsager";
pub const ACTION_ACTIVATE_SESSION: &str = "authentifier";
pub const ACTION_GENERATE_CHALLENGE: &str = "genererChallenge";
pub const ACTION_ADD_KEY: &str = "ajouterCle";
pub const ACTION_ADD_RECOVERY: &str = "ajouterCsrRecovery";
pub const ACTION_GET_RECOVERY_BY_CODE: &str = "getCsrRecoveryParcode";
pub const ACTION_GENERATE_TOTP: &str = "genererTotp";
pub const ACTION_CONFIRM_TOTP: &str = "confirmerTotp";
pub const ACTION_SIGN_ACCOUNT: &str = "signerCompteUsager";

pub const EVENT_AUTH_STATE: &str = "getEtatAuth";

/// Bootstrap events whose replies are read without signature verification.
pub const UNVERIFIED_EVENTS: &[&str] = &[EVENT_AUTH_STATE];

/// Transport collaborator.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Sends an unsigned request and returns the signed reply.
    async fn request(&self, domain: &str, action: &str, payload: Value) -> Result<MilleGrillesMessage>;

    /// Sends a message signed by the client and returns the signed reply.
    async fn submit(&self, message: MilleGrillesMessage) -> Result<MilleGrillesMessage>;

    /// Raw event call, reply returned as plain JSON.
    async fn raw_call(&self, event: &str, payload: Value) -> Result<Value>;

    /// Starts delivering activation pushes for `public_key_hex`.
    async fn subscribe_activation(
        &self,
        public_key_hex: &str,
    ) -> Result<mpsc::Receiver<MilleGrillesMessage>>;

    async fn unsubscribe_activation(&self, public_key_hex: &str) -> Result<()>;
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub authenticated: bool,
    pub username: Option<String>,
    pub user_id: Option<String>,
    pub idmg: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChallengePurpose {
    Registration,
    Authentication,
    Delegation,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AvailableMethods {
    #[serde(default)]
    pub activation: bool,
    #[serde(default)]
    pub certificat: bool,
}

/// What the server offers a known user.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserLoginInfo {
    #[serde(default)]
    pub authentication_challenge: Option<AuthenticationChallenge>,
    #[serde(default)]
    pub challenge_certificat: Option<String>,
    #[serde(rename = "methodesDisponibles", default)]
    pub available_methods: Option<AvailableMethods>,
    /// Certificate issued inline for an activated pending key.
    #[serde(default)]
    pub certificat: Option<Vec<String>>,
    #[serde(rename = "compte", default)]
    pub account: Option<AccountVersions>,
}

/// Version of the account's delegations. Certificates issued before
/// `delegations_date` carry stale roles.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountVersions {
    #[serde(default)]
    pub delegations_version: Option<u64>,
    /// Unix seconds.
    #[serde(default)]
    pub delegations_date: Option<i64>,
}

impl UserLoginInfo {
    #[must_use]
    pub fn activation_available(&self) -> bool {
        self.available_methods.is_some_and(|methods| methods.activation)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthenticationResponse {
    #[serde(default)]
    pub auth: bool,
    #[serde(rename = "userId", default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub certificat: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryRequest {
    pub csr: String,
    #[serde(rename = "nomUsager")]
    pub username: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TotpProvisioning {
    /// QR code image, base64 PNG.
    pub qr: String,
    pub correlation: String,
}

/// Push received once a companion device approved a recovery request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivationMessage {
    pub certificat: Vec<String>,
    pub fingerprint_pk: String,
}

#[derive(Debug, Default, Deserialize)]
struct OkReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    err: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RegistrationReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    certificat: Option<Vec<String>>,
    #[serde(default)]
    err: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChallengeReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    challenge: Option<Value>,
    #[serde(default)]
    err: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RecoveryReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    csr: Option<String>,
    #[serde(rename = "nomUsager", default)]
    username: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TotpReply {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    qr: Option<String>,
    #[serde(default)]
    correlation: Option<String>,
    #[serde(default)]
    err: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionReply {
    #[serde(default)]
    ok: bool,
    #[serde(rename = "nomUsager", default)]
    username: Option<String>,
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthStateReply {
    #[serde(default)]
    auth: bool,
    #[serde(default)]
    username: Option<String>,
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
    #[serde(default)]
    idmg: Option<String>,
}

/// Account protocol client.
pub struct ServerApi {
    connection: Arc<dyn Connection>,
    verifier: ResponseVerifier,
    config: ClientConfig,
    status: Mutex<ConnectionStatus>,
}

impl ServerApi {
    #[must_use]
    pub fn new(connection: Arc<dyn Connection>, verifier: ResponseVerifier, config: ClientConfig) -> Self {
        Self {
            connection,
            verifier,
            config,
            status: Mutex::new(ConnectionStatus::default()),
        }
    }

    #[must_use]
    pub fn verifier(&self) -> &ResponseVerifier {
        &self.verifier
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Last known session state.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_status(&self, update: impl FnOnce(&mut ConnectionStatus)) -> ConnectionStatus {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut status);
        status.clone()
    }

    /// Marks the connection lost.
    pub fn disconnected(&self) {
        self.update_status(|status| *status = ConnectionStatus::default());
    }

    async fn bounded<T>(
        &self,
        limit: Duration,
        what: &str,
        call: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| AuthError::NetworkTimeout(format!("{what} after {}ms", limit.as_millis())))?
    }

    async fn call(&self, action: &str, payload: Value, limit: Duration) -> Result<VerifiedContent> {
        let reply = self
            .bounded(limit, action, self.connection.request(DOMAIN_ACCOUNTS, action, payload))
            .await?;
        self.verifier.verify(&reply, now_unix_seconds())
    }

    async fn call_signed(&self, message: MilleGrillesMessage, what: &str) -> Result<VerifiedContent> {
        let reply = self
            .bounded(self.config.request_timeout, what, self.connection.submit(message))
            .await?;
        self.verifier.verify(&reply, now_unix_seconds())
    }

    async fn unverified_call(&self, event: &str, payload: Value) -> Result<Value> {
        if !UNVERIFIED_EVENTS.contains(&event) {
            return Err(AuthError::InvalidSignature(format!(
                "{event} replies must be signed"
            )));
        }
        self.bounded(self.config.request_timeout, event, self.connection.raw_call(event, payload))
            .await
    }

    /// Handshake run on every (re)connection.
    ///
    /// # Errors
    /// Transport errors and timeouts.
    #[instrument(skip(self))]
    pub async fn connection_status(&self) -> Result<ConnectionStatus> {
        let raw = self.unverified_call(EVENT_AUTH_STATE, json!({})).await?;
        if let Some(err) = raw.get("err").and_then(Value::as_str) {
            return Err(AuthError::Server(err.to_string()));
        }
        let reply: AuthStateReply = serde_json::from_value(raw)?;
        Ok(self.update_status(|status| {
            status.connected = true;
            status.authenticated = reply.auth;
            status.username = reply.username;
            status.user_id = reply.user_id;
            if reply.idmg.is_some() {
                status.idmg = reply.idmg;
            }
        }))
    }

    /// `None` when the username is unknown to the server.
    ///
    /// # Errors
    /// Transport errors, `NetworkTimeout` after the user lookup timeout and
    /// verification failures.
    #[instrument(skip(self))]
    pub async fn get_user_status(
        &self,
        username: &str,
        current_public_key: Option<&str>,
        pending_public_key: Option<&str>,
    ) -> Result<Option<UserLoginInfo>> {
        let payload = json!({
            "nomUsager": username,
            "hostname": self.config.hostname,
            "fingerprintPkCourant": current_public_key,
            "fingerprintPkNouveau": pending_public_key,
        });
        let verified = self
            .call(ACTION_GET_USER, payload, self.config.user_lookup_timeout)
            .await?;
        if verified.content().is_null() {
            debug!(username, "unknown user");
            return Ok(None);
        }
        verified.parse().map(Some)
    }

    /// Returns the issued chain, CA last.
    ///
    /// # Errors
    /// `Registration` when the server refuses the account.
    #[instrument(skip(self, csr))]
    pub async fn register_account(&self, username: &str, csr: &str) -> Result<Vec<String>> {
        let payload = json!({"nomUsager": username, "csr": csr});
        let reply: RegistrationReply = self
            .call(ACTION_REGISTER, payload, self.config.request_timeout)
            .await?
            .parse()?;
        match (reply.ok, reply.certificat) {
            (true, Some(chain)) if !chain.is_empty() => Ok(chain),
            (_, _) => Err(AuthError::Registration(
                reply.err.unwrap_or_else(|| "no certificate returned".to_string()),
            )),
        }
    }

    /// Submits a WebAuthn assertion.
    ///
    /// # Errors
    /// Transport and verification failures. A refusal is returned as
    /// `auth == false`, not as an error.
    #[instrument(skip(self, attestation, assertion, challenge_reference))]
    pub async fn authenticate(
        &self,
        username: &str,
        attestation: Option<&CsrAttestation>,
        assertion: &SignedAssertion,
        challenge_reference: &str,
        session_duration_secs: u64,
    ) -> Result<AuthenticationResponse> {
        let payload = json!({
            "nomUsager": username,
            "demandeCertificat": attestation,
            "webauthn": assertion,
            "challenge": challenge_reference,
            "dureeSession": session_duration_secs,
        });
        self.call(ACTION_AUTHENTICATE, payload, self.config.request_timeout)
            .await?
            .parse()
    }

    /// Answers a certificate challenge with a message signed by the stored key.
    ///
    /// # Errors
    /// Transport and verification failures.
    #[instrument(skip(self, factory, challenge))]
    pub async fn authenticate_with_certificate(
        &self,
        factory: &MessageFactory,
        challenge: &str,
        session_duration_secs: u64,
    ) -> Result<AuthenticationResponse> {
        let content = json!({
            "certificate_challenge": challenge,
            "activation": true,
            "dureeSession": session_duration_secs,
        });
        let message = factory.create_routed_message(
            MessageKind::Command,
            &content,
            Routage::new(DOMAIN_ACCOUNTS, ACTION_AUTHENTICATE),
            now_unix_seconds(),
        )?;
        self.call_signed(message, ACTION_AUTHENTICATE).await?.parse()
    }

    /// Asks for a new certificate for the attested CSR, signed with the
    /// current certificate and approved by a WebAuthn assertion. Returns the
    /// issued chain, CA last.
    ///
    /// # Errors
    /// `AuthenticationRejected` when the server refuses the assertion or
    /// returns no certificate.
    #[instrument(skip(self, factory, attestation, assertion, challenge_reference))]
    pub async fn sign_user_account(
        &self,
        factory: &MessageFactory,
        attestation: &CsrAttestation,
        assertion: &SignedAssertion,
        challenge_reference: &str,
    ) -> Result<Vec<String>> {
        let content = json!({
            "demandeCertificat": attestation,
            "challenge": challenge_reference,
            "hostname": self.config.hostname,
            "clientAssertionResponse": assertion,
        });
        let message = factory.create_routed_message(
            MessageKind::Command,
            &content,
            Routage::new(DOMAIN_ACCOUNTS, ACTION_SIGN_ACCOUNT),
            now_unix_seconds(),
        )?;
        let reply: RegistrationReply = self
            .call_signed(message, ACTION_SIGN_ACCOUNT)
            .await?
            .parse()?;
        match (reply.ok, reply.certificat) {
            (true, Some(chain)) if !chain.is_empty() => Ok(chain),
            (_, _) => {
                warn!(err = ?reply.err, "certificate renewal refused");
                Err(AuthError::AuthenticationRejected)
            }
        }
    }

    /// Authenticates the connection itself with the user's certificate.
    ///
    /// # Errors
    /// `AuthenticationRejected` when the server refuses the certificate.
    #[instrument(skip(self, factory))]
    pub async fn activate_session(&self, factory: &MessageFactory) -> Result<ConnectionStatus> {
        let message = factory.create_routed_message(
            MessageKind::Command,
            &json!({}),
            Routage::new(DOMAIN_ACCOUNTS, ACTION_ACTIVATE_SESSION),
            now_unix_seconds(),
        )?;
        let reply: SessionReply = self
            .call_signed(message, ACTION_ACTIVATE_SESSION)
            .await?
            .parse()?;
        if !reply.ok {
            warn!("session activation refused");
            return Err(AuthError::AuthenticationRejected);
        }
        Ok(self.update_status(|status| {
            status.connected = true;
            status.authenticated = true;
            if reply.username.is_some() {
                status.username = reply.username;
            }
            if reply.user_id.is_some() {
                status.user_id = reply.user_id;
            }
        }))
    }

    /// Raw WebAuthn options for `purpose`, as sent by the server.
    ///
    /// # Errors
    /// `Server` when no challenge is returned.
    #[instrument(skip(self))]
    pub async fn generate_webauthn_challenge(&self, purpose: ChallengePurpose) -> Result<Value> {
        let payload = json!({"hostname": self.config.hostname, "type": purpose});
        let reply: ChallengeReply = self
            .call(ACTION_GENERATE_CHALLENGE, payload, self.config.request_timeout)
            .await?
            .parse()?;
        match (reply.ok, reply.challenge) {
            (true, Some(challenge)) => Ok(challenge),
            (_, _) => Err(AuthError::Server(
                reply.err.unwrap_or_else(|| "no challenge returned".to_string()),
            )),
        }
    }

    /// # Errors
    /// `Registration` when the server rejects the attestation.
    #[instrument(skip(self, attestation))]
    pub async fn respond_registration_challenge(
        &self,
        attestation: &Value,
        public_key_hex: &str,
        revoke_others: bool,
    ) -> Result<()> {
        let payload = json!({
            "reponseChallenge": attestation,
            "fingerprintPk": public_key_hex,
            "hostname": self.config.hostname,
            "reset_cles": revoke_others,
        });
        let reply: OkReply = self
            .call(ACTION_ADD_KEY, payload, self.config.request_timeout)
            .await?
            .parse()?;
        ok_or(reply, AuthError::Registration)
    }

    /// # Errors
    /// `Server` when the server refuses the request.
    #[instrument(skip(self, csr))]
    pub async fn add_recovery_request(&self, username: &str, csr: &str) -> Result<()> {
        let payload = json!({"nomUsager": username, "csr": csr});
        let reply: OkReply = self
            .call(ACTION_ADD_RECOVERY, payload, self.config.request_timeout)
            .await?
            .parse()?;
        ok_or(reply, AuthError::Server)
    }

    /// `None` when no request is registered under `code`.
    ///
    /// # Errors
    /// Transport and verification failures.
    #[instrument(skip(self))]
    pub async fn get_recovery_request_by_code(&self, code: &str) -> Result<Option<RecoveryRequest>> {
        let reply: RecoveryReply = self
            .call(ACTION_GET_RECOVERY_BY_CODE, json!({"code": code}), self.config.request_timeout)
            .await?
            .parse()?;
        Ok(match (reply.ok, reply.csr, reply.username) {
            (true, Some(csr), Some(username)) => Some(RecoveryRequest { csr, username }),
            _ => None,
        })
    }

    /// # Errors
    /// `Server` when no secret is returned.
    #[instrument(skip(self))]
    pub async fn generate_totp(&self) -> Result<TotpProvisioning> {
        let reply: TotpReply = self
            .call(ACTION_GENERATE_TOTP, json!({}), self.config.request_timeout)
            .await?
            .parse()?;
        match (reply.ok, reply.qr, reply.correlation) {
            (true, Some(qr), Some(correlation)) => Ok(TotpProvisioning { qr, correlation }),
            _ => Err(AuthError::Server(
                reply.err.unwrap_or_else(|| "no TOTP secret returned".to_string()),
            )),
        }
    }

    /// # Errors
    /// `InvalidCode` when the server rejects the code.
    #[instrument(skip(self, code))]
    pub async fn confirm_totp(&self, code: &SecretString, correlation: &str) -> Result<()> {
        let payload = json!({"code": code.expose_secret(), "correlation": correlation});
        let reply: OkReply = self
            .call(ACTION_CONFIRM_TOTP, payload, self.config.request_timeout)
            .await?
            .parse()?;
        ok_or(reply, AuthError::InvalidCode)
    }

    /// # Errors
    /// Transport errors.
    #[instrument(skip(self))]
    pub async fn subscribe_activation(&self, public_key_hex: &str) -> Result<ActivationSubscription> {
        let receiver = self
            .bounded(
                self.config.request_timeout,
                "subscribe_activation",
                self.connection.subscribe_activation(public_key_hex),
            )
            .await?;
        Ok(ActivationSubscription {
            receiver,
            connection: Arc::clone(&self.connection),
            verifier: self.verifier.clone(),
            public_key_hex: public_key_hex.to_string(),
        })
    }
}

fn ok_or(reply: OkReply, error: fn(String) -> AuthError) -> Result<()> {
    if reply.ok {
        Ok(())
    } else {
        Err(error(reply.err.unwrap_or_else(|| "refused".to_string())))
    }
}

/// Activation pushes for one public key. Call [`close`](Self::close) when done.
pub struct ActivationSubscription {
    receiver: mpsc::Receiver<MilleGrillesMessage>,
    connection: Arc<dyn Connection>,
    verifier: ResponseVerifier,
    public_key_hex: String,
}

impl ActivationSubscription {
    #[must_use]
    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// Waits for the next verified push.
    ///
    /// # Errors
    /// `Disconnected` when the transport drops the subscription, verification
    /// errors for forged pushes.
    pub async fn recv(&mut self) -> Result<ActivationMessage> {
        let message = self
            .receiver
            .recv()
            .await
            .ok_or_else(|| AuthError::Disconnected("activation subscription closed".into()))?;
        self.verifier.verify(&message, now_unix_seconds())?.parse()
    }

    /// # Errors
    /// Transport errors.
    pub async fn close(self) -> Result<()> {
        self.connection
            .unsubscribe_activation(&self.public_key_hex)
            .await
    }
}
