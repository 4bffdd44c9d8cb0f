//! Hardware security device (WebAuthn) seam.

use crate::challenge::PublicKeyOptions;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Assertion returned by the device, base64url encoded for transport.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedAssertion {
    #[serde(rename = "id64")]
    pub id: String,
    pub response: AssertionResponse,
    #[serde(rename = "type", default = "public_key_type")]
    pub kind: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResponse {
    pub authenticator_data: Option<String>,
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: Option<String>,
    pub signature: Option<String>,
    pub user_handle: Option<String>,
}

fn public_key_type() -> String {
    "public-key".to_string()
}

/// The cryptography happens in the device; the core only moves bytes around.
///
/// Implementations report user cancellation and device errors as
/// `HardwareInteractionFailed`. No timeout is imposed on these calls.
#[async_trait]
pub trait SecurityDevice: Send + Sync {
    async fn get_assertion(&self, options: &PublicKeyOptions) -> Result<SignedAssertion>;

    /// Creates a credential from server registration options, returning the
    /// attestation as JSON.
    async fn create_credential(&self, options: &Value) -> Result<Value>;
}
