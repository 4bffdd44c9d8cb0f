//! Renewing the certificate of a signed-in user.
//!
//! A certificate is renewed when it passed two thirds of its validity window
//! or when the account's delegations changed after it was issued. The new
//! certificate is requested with the current one and approved by the
//! security device.

use super::{AuthContext, Session};
use crate::challenge::{prepare, PreparedChallenge};
use crate::error::{AuthError, Result};
use crate::lifecycle::now_unix_seconds;
use crate::message::MessageFactory;
use tracing::{debug, info, instrument};

impl AuthContext {
    /// Whether the stored certificate of `username` should be renewed. Creates
    /// the renewal request when the answer is yes and none is pending.
    ///
    /// # Errors
    /// `MustManuallyAuthenticate` without a stored certificate, plus lookup
    /// and storage errors.
    #[instrument(skip(self))]
    pub async fn renewal_due(&self, username: &str) -> Result<bool> {
        let record = self.record(username).await?;
        let Some(entry) = record.certificate.as_ref() else {
            return Err(AuthError::MustManuallyAuthenticate(username.to_string()));
        };
        if record.pending_request.is_some() {
            return Ok(true);
        }
        if self
            .lifecycle()
            .evaluate_and_act_on_due(&record, now_unix_seconds())
            .await?
            .is_some()
        {
            return Ok(true);
        }

        let wrapper = entry.wrapper()?;
        let delegations_date = self
            .api
            .get_user_status(username, Some(&entry.public_key_hex), None)
            .await?
            .and_then(|info| info.account)
            .and_then(|account| account.delegations_date);
        match delegations_date {
            Some(date) if date > wrapper.not_before() => {
                info!(username, date, "delegations changed since issuance");
                self.lifecycle()
                    .ensure_request(username, wrapper.user_id())
                    .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Fetches a WebAuthn challenge binding the renewal request, creating the
    /// request if none is pending.
    ///
    /// # Errors
    /// `MustManuallyAuthenticate` without a stored certificate,
    /// `AuthenticationRejected` when the server offers no challenge.
    #[instrument(skip(self))]
    pub async fn prepare_renewal(&self, username: &str) -> Result<PreparedChallenge> {
        let record = self.record(username).await?;
        let Some(entry) = record.certificate.as_ref() else {
            return Err(AuthError::MustManuallyAuthenticate(username.to_string()));
        };
        let wrapper = entry.wrapper()?;
        let request = self
            .lifecycle()
            .ensure_request(username, wrapper.user_id())
            .await?;
        let challenge = self
            .api
            .get_user_status(
                username,
                Some(&entry.public_key_hex),
                Some(&request.public_key_hex),
            )
            .await?
            .and_then(|info| info.authentication_challenge)
            .ok_or(AuthError::AuthenticationRejected)?;
        prepare(username, &challenge, Some(&request.pem), false)
    }

    /// Signs `prepared` with the security device, has the server sign the
    /// attested request, stores the new certificate and reopens the session
    /// with it.
    ///
    /// The device is called before anything else is awaited.
    ///
    /// # Errors
    /// - `ChallengeMalformed` when `prepared` attests no request.
    /// - `HardwareInteractionFailed` from the device; the request stays pending.
    /// - `AuthenticationRejected` when the server refuses the renewal.
    /// - `Mismatch` when the issued key is not the pending one.
    #[instrument(skip(self, prepared))]
    pub async fn renew_certificate(
        &self,
        username: &str,
        prepared: &PreparedChallenge,
    ) -> Result<Session> {
        let attestation = prepared
            .csr_attestation
            .as_ref()
            .ok_or_else(|| AuthError::ChallengeMalformed("renewal without a request".into()))?;

        let assertion = self.device.get_assertion(&prepared.public_key).await?;

        let record = self.record(username).await?;
        let entry = record
            .certificate
            .as_ref()
            .ok_or_else(|| AuthError::MustManuallyAuthenticate(username.to_string()))?;
        let factory = MessageFactory::from_entry(entry)?;
        let chain = self
            .api
            .sign_user_account(&factory, attestation, &assertion, &prepared.challenge_reference)
            .await?;
        debug!(username, certificates = chain.len(), "renewal issued");

        self.adopt_issued(username, &chain).await?;
        self.authenticate_connection(username).await
    }
}
