use crate::error::{AuthError, Result};
use crate::keygen::{create_request, CertificateRequest};
use crate::storage::{UserRecord, UserStore};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument};

/// Where a certificate stands in its validity window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateState {
    Valid,
    /// Past two thirds of the window.
    RenewalDue,
    Expired,
}

#[must_use]
pub fn classify(not_before: i64, not_after: i64, now: i64) -> CertificateState {
    if now > not_after {
        return CertificateState::Expired;
    }
    let renew_at = not_before + (not_after - not_before) * 2 / 3;
    if now > renew_at {
        CertificateState::RenewalDue
    } else {
        CertificateState::Valid
    }
}

#[must_use]
pub fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

/// Renews or clears stored certificates as they age.
#[derive(Clone)]
pub struct CertificateLifecycleManager {
    store: Arc<dyn UserStore>,
}

impl CertificateLifecycleManager {
    #[must_use]
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Evaluates the stored certificate of `record.username` at `now` and
    /// returns the request it created, if any.
    ///
    /// The record is read again from the store so repeated calls see the
    /// request created by an earlier one and never create a second.
    ///
    /// - `Expired`: the certificate is cleared; a request is created unless one
    ///   is already pending.
    /// - `RenewalDue`: a request is created unless one is already pending; the
    ///   certificate stays usable.
    /// - `Valid`: nothing.
    ///
    /// # Errors
    /// `InvalidCertificate` if the stored chain does not parse, `Mismatch` if its
    /// common name is not the username, plus storage and key generation errors.
    #[instrument(skip(self, record), fields(username = %record.username))]
    pub async fn evaluate_and_act_on_due(
        &self,
        record: &UserRecord,
        now: i64,
    ) -> Result<Option<CertificateRequest>> {
        let username = record.username.as_str();
        let mut current = self
            .store
            .get(username)
            .await?
            .unwrap_or_else(|| record.clone());

        let Some(entry) = current.certificate.as_ref() else {
            return Ok(None);
        };
        let wrapper = entry.wrapper()?;
        match wrapper.common_name() {
            Some(cn) if cn == username => {}
            Some(cn) => {
                return Err(AuthError::Mismatch(format!(
                    "certificate issued to {cn}, expected {username}"
                )))
            }
            None => {
                return Err(AuthError::InvalidCertificate(
                    "certificate has no common name".into(),
                ))
            }
        }
        let user_id = wrapper.user_id().map(str::to_string);

        match classify(wrapper.not_before(), wrapper.not_after(), now) {
            CertificateState::Valid => Ok(None),
            CertificateState::RenewalDue => {
                if current.pending_request.is_some() {
                    debug!("renewal already pending");
                    return Ok(None);
                }
                let request = create_request(username, user_id.as_deref())?;
                current.pending_request = Some(request.clone());
                self.store.put(username, current).await?;
                info!(public_key = %request.public_key_hex, "renewal request created");
                Ok(Some(request))
            }
            CertificateState::Expired => {
                current.certificate = None;
                let created = if current.pending_request.is_some() {
                    None
                } else {
                    let request = create_request(username, user_id.as_deref())?;
                    current.pending_request = Some(request.clone());
                    Some(request)
                };
                self.store.put(username, current).await?;
                info!(new_request = created.is_some(), "expired certificate cleared");
                Ok(created)
            }
        }
    }

    /// Returns the pending request for `username`, creating and persisting one
    /// first when there is none.
    ///
    /// # Errors
    /// Storage and key generation errors.
    pub async fn ensure_request(
        &self,
        username: &str,
        user_id: Option<&str>,
    ) -> Result<CertificateRequest> {
        let mut record = self
            .store
            .get(username)
            .await?
            .unwrap_or_else(|| UserRecord::new(username));
        if let Some(request) = record.pending_request.as_ref() {
            return Ok(request.clone());
        }
        let request = create_request(username, user_id)?;
        record.pending_request = Some(request.clone());
        self.store.put(username, record).await?;
        debug!(username, public_key = %request.public_key_hex, "certificate request created");
        Ok(request)
    }
}
