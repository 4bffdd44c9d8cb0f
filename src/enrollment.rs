use crate::auth::AuthContext;
use crate::error::{AuthError, Result};
use crate::transport::ChallengePurpose;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

/// Both ways to add a second factor, offered together.
#[derive(Debug)]
pub struct EnrollmentSession {
    pub username: String,
    /// Raw WebAuthn creation options.
    pub webauthn_challenge: Value,
    /// QR code image, base64 PNG.
    pub totp_qr: String,
    pub totp_correlation: String,
    completed: AtomicBool,
    /// Held while a path talks to the server.
    submitting: Mutex<()>,
}

impl EnrollmentSession {
    fn new(username: &str, webauthn_challenge: Value, totp_qr: String, totp_correlation: String) -> Self {
        Self {
            username: username.to_string(),
            webauthn_challenge,
            totp_qr,
            totp_correlation,
            completed: AtomicBool::new(false),
            submitting: Mutex::new(()),
        }
    }

    /// True once the server accepted either path.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Waits for the other path's submission, then returns `None` if it
    /// completed the enrollment.
    async fn begin_submission(&self) -> Option<MutexGuard<'_, ()>> {
        let guard = self.submitting.lock().await;
        (!self.is_completed()).then_some(guard)
    }

    fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnrollmentOutcome {
    Completed,
    /// The other path completed first.
    Ignored,
}

pub struct SecurityDeviceEnrollment {
    ctx: Arc<AuthContext>,
}

impl SecurityDeviceEnrollment {
    #[must_use]
    pub fn new(ctx: Arc<AuthContext>) -> Self {
        Self { ctx }
    }

    /// Fetches a WebAuthn registration challenge and a TOTP secret
    /// concurrently.
    ///
    /// # Errors
    /// The first failure of either request.
    #[instrument(skip(self))]
    pub async fn begin_enrollment(&self, username: &str) -> Result<EnrollmentSession> {
        let (webauthn_challenge, totp) = tokio::try_join!(
            self.ctx.api.generate_webauthn_challenge(ChallengePurpose::Registration),
            self.ctx.api.generate_totp(),
        )?;
        debug!(username, correlation = %totp.correlation, "enrollment offered");
        Ok(EnrollmentSession::new(
            username,
            webauthn_challenge,
            totp.qr,
            totp.correlation,
        ))
    }

    /// Registers a new security device.
    ///
    /// `public_key_hex` is the certificate key of the signed-in browser; with
    /// `revoke_others` every other credential of the account is dropped.
    ///
    /// The device prompt does not block the TOTP path: whichever path the
    /// server accepts first completes the session and the other is ignored.
    ///
    /// # Errors
    /// `HardwareInteractionFailed` from the device, `Registration` when the
    /// server refuses the attestation. The session stays open for another try.
    #[instrument(skip(self, session), fields(username = %session.username))]
    pub async fn complete_with_hardware_key(
        &self,
        session: &EnrollmentSession,
        public_key_hex: &str,
        revoke_others: bool,
    ) -> Result<EnrollmentOutcome> {
        if session.is_completed() {
            return Ok(EnrollmentOutcome::Ignored);
        }
        let attestation = self
            .ctx
            .device
            .create_credential(&session.webauthn_challenge)
            .await?;

        let Some(_submitting) = session.begin_submission().await else {
            debug!("completed with TOTP while the device was prompting");
            return Ok(EnrollmentOutcome::Ignored);
        };
        self.ctx
            .api
            .respond_registration_challenge(&attestation, public_key_hex, revoke_others)
            .await?;
        session.mark_completed();
        info!(revoke_others, "security device registered");
        Ok(EnrollmentOutcome::Completed)
    }

    /// Confirms the TOTP secret with the first code from the authenticator app.
    ///
    /// # Errors
    /// `InvalidCode` for anything but 6 digits, or when the server rejects it.
    #[instrument(skip(self, session, code), fields(username = %session.username))]
    pub async fn complete_with_totp(
        &self,
        session: &EnrollmentSession,
        code: &SecretString,
    ) -> Result<EnrollmentOutcome> {
        let digits = code.expose_secret().trim();
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AuthError::InvalidCode("TOTP codes are 6 digits".into()));
        }
        let Some(_submitting) = session.begin_submission().await else {
            return Ok(EnrollmentOutcome::Ignored);
        };
        let code = SecretString::from(digits.to_string());
        self.ctx
            .api
            .confirm_totp(&code, &session.totp_correlation)
            .await?;
        session.mark_completed();
        info!("TOTP confirmed");
        Ok(EnrollmentOutcome::Completed)
    }
}
