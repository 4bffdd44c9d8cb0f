//! Authentication orchestration.
//!
//! ### Flow Overview
//! 1. **Lookup**: [`Authenticator::check_user`] renews or clears the stored
//!    certificate if it is due, then asks the server what it offers for this
//!    username and the local public keys.
//! 2. **Branch**: unknown users are offered registration; a certificate
//!    challenge is answered with the stored key; an activation returns a
//!    certificate inline; a WebAuthn challenge is prepared for the device;
//!    with none of these the user must recover from another device.
//! 3. **Session**: every successful path asks the server once more to accept
//!    the certificate now stored, then authenticates the connection with it.
//! 4. **Renewal**: while signed in, [`AuthContext::renewal_due`] and
//!    [`AuthContext::renew_certificate`] replace an aging certificate.

mod debounce;
mod loadable;
mod refresh;
mod renewal;
mod state;

pub use debounce::{CheckResult, Debouncer, UsernameWatcher};
pub use loadable::Loadable;
pub use refresh::ChallengeRefresher;
pub use state::{AuthEvent, AuthState, InvalidTransition};

use crate::certificate::CertificateStore;
use crate::challenge::{prepare, PreparedChallenge};
use crate::config::ClientConfig;
use crate::device::SecurityDevice;
use crate::error::{AuthError, Result};
use crate::keygen::create_request;
use crate::lifecycle::{now_unix_seconds, CertificateLifecycleManager};
use crate::message::MessageFactory;
use crate::storage::{CertificateEntry, UserRecord, UserStore};
use crate::transport::{ConnectionStatus, ServerApi, UserLoginInfo};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, instrument, warn};

/// Collaborators shared by every flow.
pub struct AuthContext {
    pub config: ClientConfig,
    pub store: Arc<dyn UserStore>,
    pub api: Arc<ServerApi>,
    pub device: Arc<dyn SecurityDevice>,
}

impl AuthContext {
    #[must_use]
    pub fn new(
        store: Arc<dyn UserStore>,
        api: Arc<ServerApi>,
        device: Arc<dyn SecurityDevice>,
    ) -> Self {
        Self {
            config: api.config().clone(),
            store,
            api,
            device,
        }
    }

    #[must_use]
    pub fn lifecycle(&self) -> CertificateLifecycleManager {
        CertificateLifecycleManager::new(Arc::clone(&self.store))
    }

    #[must_use]
    pub fn certificates(&self) -> &CertificateStore {
        self.api.verifier().store()
    }

    async fn record(&self, username: &str) -> Result<UserRecord> {
        Ok(self
            .store
            .get(username)
            .await?
            .unwrap_or_else(|| UserRecord::new(username)))
    }

    /// Stores a chain issued for the pending request, replacing the current
    /// certificate and consuming the request.
    pub(crate) async fn adopt_issued(&self, username: &str, chain: &[String]) -> Result<()> {
        let mut record = self.record(username).await?;
        let request = record.pending_request.take().ok_or_else(|| {
            AuthError::Mismatch("certificate issued without a pending request".into())
        })?;
        let entry =
            CertificateEntry::from_issued(&request, chain, self.certificates(), now_unix_seconds())?;
        info!(username, public_key = %entry.public_key_hex, "issued certificate stored");
        record.certificate = Some(entry);
        self.store.put(username, record).await
    }

    /// Asks the server again with the stored certificate, answers a certificate
    /// challenge if one is offered, then activates the connection session.
    pub(crate) async fn confirm_and_activate(
        &self,
        username: &str,
        session_duration_secs: u64,
    ) -> Result<Session> {
        let record = self.record(username).await?;
        let entry = record
            .certificate
            .as_ref()
            .ok_or_else(|| AuthError::MustManuallyAuthenticate(username.to_string()))?;
        let info = self
            .api
            .get_user_status(
                username,
                Some(&entry.public_key_hex),
                record.pending_request.as_ref().map(|r| r.public_key_hex.as_str()),
            )
            .await?
            .ok_or(AuthError::AuthenticationRejected)?;

        if let Some(challenge) = info.challenge_certificat.as_deref() {
            let factory = MessageFactory::from_entry(entry)?;
            let response = self
                .api
                .authenticate_with_certificate(&factory, challenge, session_duration_secs)
                .await?;
            if !response.auth {
                warn!(username, "server refused the stored certificate");
                return Err(AuthError::AuthenticationRejected);
            }
        }

        self.authenticate_connection(username).await
    }

    /// Authenticates the connection with the stored certificate.
    ///
    /// An expired certificate is cleared and replaced by a new request; the
    /// user then has to authenticate manually.
    ///
    /// # Errors
    /// `MustManuallyAuthenticate` when no usable certificate is stored.
    #[instrument(skip(self))]
    pub async fn authenticate_connection(&self, username: &str) -> Result<Session> {
        let record = self.record(username).await?;
        let Some(entry) = record.certificate.as_ref() else {
            return Err(AuthError::MustManuallyAuthenticate(username.to_string()));
        };
        let wrapper = entry.wrapper()?;
        if now_unix_seconds() > wrapper.not_after() {
            info!(username, "stored certificate expired");
            self.store.clear_certificate(username).await?;
            self.lifecycle()
                .ensure_request(username, wrapper.user_id())
                .await?;
            return Err(AuthError::MustManuallyAuthenticate(username.to_string()));
        }

        let factory = MessageFactory::from_entry(entry)?;
        let status = self.api.activate_session(&factory).await?;
        Ok(Session {
            username: username.to_string(),
            user_id: status.user_id.clone().or_else(|| wrapper.user_id().map(str::to_string)),
            status,
        })
    }
}

/// An authenticated connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub username: String,
    pub user_id: Option<String>,
    pub status: ConnectionStatus,
}

/// Result of looking a username up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Unknown to the server; call [`Authenticator::register`].
    Register,
    /// Sign with [`Authenticator::login`].
    WebauthnChallenge(PreparedChallenge),
    /// Signed in with the stored or activated certificate.
    Authenticated(Session),
    /// Nothing usable from this browser; start a
    /// [`RecoveryFlow`](crate::recovery::RecoveryFlow).
    Recovery,
}

/// Puts the state back to `Idle` when `check_user` ends, by error or by being
/// dropped, while still looking up or on the certificate screen for the same
/// user. Screens the user acts on are left alone.
struct UnfinishedLookup<'a> {
    state: &'a Mutex<AuthState>,
    username: &'a str,
}

impl Drop for UnfinishedLookup<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let unfinished = matches!(
            &*state,
            AuthState::CheckingUser { username } | AuthState::CertificateAuth { username }
                if username == self.username
        );
        if unfinished {
            debug!(username = self.username, from = %*state, "lookup ended early");
            *state = AuthState::Idle;
        }
    }
}

/// One login attempt at a time.
pub struct Authenticator {
    ctx: Arc<AuthContext>,
    state: Mutex<AuthState>,
}

impl Authenticator {
    #[must_use]
    pub fn new(ctx: Arc<AuthContext>) -> Self {
        Self {
            ctx,
            state: Mutex::new(AuthState::Idle),
        }
    }

    #[must_use]
    pub fn context(&self) -> &AuthContext {
        &self.ctx
    }

    #[must_use]
    pub fn state(&self) -> AuthState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn apply(&self, event: AuthEvent) -> Result<AuthState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let next = state.on(event)?;
        debug!(from = %*state, to = %next, "auth state");
        *state = next.clone();
        Ok(next)
    }

    fn username_in(&self, expected: fn(&AuthState) -> bool, operation: &str) -> Result<String> {
        let state = self.state();
        match state.username() {
            Some(username) if expected(&state) => Ok(username.to_string()),
            _ => Err(InvalidTransition::new(&state, operation).into()),
        }
    }

    /// Back to `Idle` for a new attempt.
    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = AuthState::Idle;
    }

    /// Cancels the current screen. Stored state is left as is; a pending
    /// request is reused by the next attempt.
    pub fn abandon(&self) -> AuthState {
        self.apply(AuthEvent::Abandon).unwrap_or_else(|_| self.state())
    }

    /// Looks `username` up and acts on what the server offers.
    ///
    /// Safe to drop at any await: an unfinished lookup or certificate attempt
    /// returns the state to `Idle`.
    ///
    /// # Errors
    /// Lookup failures return the state to `Idle`; the caller retries on the
    /// next username change. Verification failures are never downgraded.
    #[instrument(skip(self))]
    pub async fn check_user(&self, username: &str) -> Result<CheckOutcome> {
        self.apply(AuthEvent::CheckUser(username.to_string()))?;
        let _unfinished = UnfinishedLookup {
            state: &self.state,
            username,
        };

        let (record, info) = match self.lookup(username).await {
            Ok(found) => found,
            Err(err) => {
                warn!(username, "user lookup failed: {err}");
                self.apply(AuthEvent::LookupFailed)?;
                return Err(err);
            }
        };
        let Some(info) = info else {
            self.apply(AuthEvent::UnknownUser)?;
            return Ok(CheckOutcome::Register);
        };
        let duration = self.ctx.config.session_duration_secs;

        if let (Some(_), Some(challenge)) = (&record.certificate, info.challenge_certificat.as_deref()) {
            self.apply(AuthEvent::CertificateChallengeOffered)?;
            return self
                .certificate_auth(challenge, duration)
                .await
                .map(CheckOutcome::Authenticated);
        }

        if info.activation_available() && record.pending_request.is_some() {
            if let Some(chain) = info.certificat.as_deref() {
                self.apply(AuthEvent::ActivationAccepted)?;
                return self
                    .activate_with_certificate(chain, duration)
                    .await
                    .map(CheckOutcome::Authenticated);
            }
        }

        if let Some(challenge) = info.authentication_challenge.as_ref() {
            let csr = match (&record.pending_request, &record.certificate) {
                (Some(request), _) => Some(request.pem.clone()),
                (None, None) => Some(self.ctx.lifecycle().ensure_request(username, None).await?.pem),
                (None, Some(_)) => None,
            };
            let prepared = match prepare(username, challenge, csr.as_deref(), false) {
                Ok(prepared) => prepared,
                Err(err) => {
                    self.apply(AuthEvent::LookupFailed)?;
                    return Err(err);
                }
            };
            self.apply(AuthEvent::WebauthnChallengeOffered)?;
            return Ok(CheckOutcome::WebauthnChallenge(prepared));
        }

        info!(username, "no authentication method available");
        self.apply(AuthEvent::NoMethodAvailable)?;
        Ok(CheckOutcome::Recovery)
    }

    async fn lookup(&self, username: &str) -> Result<(UserRecord, Option<UserLoginInfo>)> {
        let record = self.ctx.record(username).await?;
        if record.certificate.is_some() {
            self.ctx
                .lifecycle()
                .evaluate_and_act_on_due(&record, now_unix_seconds())
                .await?;
        }
        let record = self.ctx.record(username).await?;
        let info = self
            .ctx
            .api
            .get_user_status(
                username,
                record.certificate.as_ref().map(|c| c.public_key_hex.as_str()),
                record.pending_request.as_ref().map(|r| r.public_key_hex.as_str()),
            )
            .await?;
        Ok((record, info))
    }

    /// Re-fetches and prepares the WebAuthn challenge for the user on screen,
    /// without changing state. Used by [`ChallengeRefresher`].
    ///
    /// # Errors
    /// `AuthenticationRejected` when the server no longer offers a challenge.
    pub async fn fetch_webauthn_challenge(&self, username: &str) -> Result<PreparedChallenge> {
        let record = self.ctx.record(username).await?;
        let info = self
            .ctx
            .api
            .get_user_status(
                username,
                record.certificate.as_ref().map(|c| c.public_key_hex.as_str()),
                record.pending_request.as_ref().map(|r| r.public_key_hex.as_str()),
            )
            .await?
            .ok_or(AuthError::AuthenticationRejected)?;
        let challenge = info
            .authentication_challenge
            .ok_or(AuthError::AuthenticationRejected)?;
        let csr = record.pending_request.as_ref().map(|r| r.pem.as_str());
        prepare(username, &challenge, csr, false)
    }

    /// Signs `prepared` with the security device and submits it.
    ///
    /// The device is called before anything else is awaited: some platforms
    /// only show the biometric prompt inside the originating user gesture.
    ///
    /// # Errors
    /// - `HardwareInteractionFailed` from the device; the same challenge may be
    ///   retried.
    /// - `AuthenticationRejected` when the server refuses the assertion.
    /// - Session errors once a certificate has been issued and stored. The
    ///   state returns to `Idle` since the attested request no longer exists.
    #[instrument(skip(self, prepared))]
    pub async fn login(&self, prepared: &PreparedChallenge, session_duration_secs: u64) -> Result<Session> {
        let username =
            self.username_in(|s| matches!(s, AuthState::WebauthnChallenge { .. }), "login")?;

        let assertion = self.ctx.device.get_assertion(&prepared.public_key).await?;

        let response = self
            .ctx
            .api
            .authenticate(
                &username,
                prepared.csr_attestation.as_ref(),
                &assertion,
                &prepared.challenge_reference,
                session_duration_secs,
            )
            .await?;
        if !response.auth || response.user_id.is_none() {
            warn!(username = %username, "assertion refused");
            self.apply(AuthEvent::Rejected)?;
            return Err(AuthError::AuthenticationRejected);
        }

        if let Some(chain) = response.certificat.as_deref() {
            self.ctx.adopt_issued(&username, chain).await?;
        }

        let session = match self
            .ctx
            .confirm_and_activate(&username, session_duration_secs)
            .await
        {
            Ok(session) => session,
            Err(err) if response.certificat.is_some() => {
                // The attested CSR is consumed; the next lookup signs in with
                // the stored certificate instead of retrying this challenge.
                warn!(username = %username, "session after issuance failed: {err}");
                self.reset();
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        self.apply(AuthEvent::Authenticated {
            user_id: response.user_id.clone(),
        })?;
        Ok(Session {
            user_id: response.user_id,
            ..session
        })
    }

    /// Answers a certificate challenge with the stored private key.
    ///
    /// # Errors
    /// `MustManuallyAuthenticate` without a stored certificate,
    /// `AuthenticationRejected` when the server refuses it.
    #[instrument(skip(self, challenge))]
    pub async fn certificate_auth(&self, challenge: &str, session_duration_secs: u64) -> Result<Session> {
        let username = self.username_in(
            |s| matches!(s, AuthState::CertificateAuth { .. }),
            "certificate_auth",
        )?;
        let record = self.ctx.record(&username).await?;
        let entry = record
            .certificate
            .as_ref()
            .ok_or_else(|| AuthError::MustManuallyAuthenticate(username.clone()))?;

        let factory = MessageFactory::from_entry(entry)?;
        let response = self
            .ctx
            .api
            .authenticate_with_certificate(&factory, challenge, session_duration_secs)
            .await?;
        if !response.auth {
            self.apply(AuthEvent::Rejected)?;
            return Err(AuthError::AuthenticationRejected);
        }

        let session = self.ctx.authenticate_connection(&username).await?;
        self.apply(AuthEvent::Authenticated {
            user_id: response.user_id.clone().or_else(|| session.user_id.clone()),
        })?;
        Ok(session)
    }

    /// Adopts a certificate issued inline for the pending request, then
    /// confirms it with the server before opening the session.
    ///
    /// # Errors
    /// `Mismatch` if the certificate is not for the pending key.
    #[instrument(skip(self, chain))]
    pub async fn activate_with_certificate(
        &self,
        chain: &[String],
        session_duration_secs: u64,
    ) -> Result<Session> {
        let username = self.username_in(
            |s| matches!(s, AuthState::CertificateAuth { .. }),
            "activate_with_certificate",
        )?;
        self.ctx.adopt_issued(&username, chain).await?;
        let session = self
            .ctx
            .confirm_and_activate(&username, session_duration_secs)
            .await?;
        self.apply(AuthEvent::Authenticated {
            user_id: session.user_id.clone(),
        })?;
        Ok(session)
    }

    /// Creates the account with a fresh CSR and signs in with the issued
    /// certificate.
    ///
    /// # Errors
    /// `Registration` when the server refuses the account.
    #[instrument(skip(self))]
    pub async fn register(&self, session_duration_secs: u64) -> Result<Session> {
        let username =
            self.username_in(|s| matches!(s, AuthState::Register { .. }), "register")?;

        let request = create_request(&username, None)?;
        let mut record = self.ctx.record(&username).await?;
        record.pending_request = Some(request.clone());
        self.ctx.store.put(&username, record).await?;

        let chain = self
            .ctx
            .api
            .register_account(&username, &request.pem)
            .await?;
        self.ctx.adopt_issued(&username, &chain).await?;

        let session = self
            .ctx
            .confirm_and_activate(&username, session_duration_secs)
            .await?;
        self.apply(AuthEvent::Authenticated {
            user_id: session.user_id.clone(),
        })?;
        info!(username = %username, "account registered");
        Ok(session)
    }

    /// Resumes a server session already open for `username`.
    ///
    /// # Errors
    /// `MustManuallyAuthenticate` when no usable certificate is stored.
    pub async fn establish_session(&self, username: &str) -> Result<Session> {
        let session = self.ctx.authenticate_connection(username).await?;
        self.apply(AuthEvent::SessionResumed {
            username: username.to_string(),
            user_id: session.user_id.clone(),
        })?;
        Ok(session)
    }

    /// Switches the current screen to recovery.
    ///
    /// # Errors
    /// `InvalidTransition` outside the register, certificate and WebAuthn
    /// screens.
    pub fn fall_back_to_recovery(&self) -> Result<AuthState> {
        self.apply(AuthEvent::RecoveryRequested)
    }

    /// Records a session opened by a [`RecoveryFlow`](crate::recovery::RecoveryFlow).
    ///
    /// # Errors
    /// `InvalidTransition` when not in recovery for the same user.
    pub fn finish_recovery(&self, session: &Session) -> Result<AuthState> {
        self.username_in(
            |s| matches!(s, AuthState::Recovery { .. }),
            "finish_recovery",
        )
        .and_then(|username| {
            if username == session.username {
                Ok(())
            } else {
                Err(AuthError::Mismatch(format!(
                    "session for {}, recovering {username}",
                    session.username
                )))
            }
        })?;
        self.apply(AuthEvent::Authenticated {
            user_id: session.user_id.clone(),
        })
    }
}
