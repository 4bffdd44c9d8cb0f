//! Signed server descriptor (`fiche.json`) loaded before any connection.

use crate::certificate::CertificateStore;
use crate::error::{AuthError, Result};
use crate::message::MilleGrillesMessage;
use crate::verifier::ResponseVerifier;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
struct FicheContent {
    idmg: String,
    ca: String,
    #[serde(default)]
    chiffrage: Vec<Vec<String>>,
}

/// Trust material of a MilleGrille.
#[derive(Debug, Clone)]
pub struct Fiche {
    pub idmg: String,
    pub ca: String,
    /// Encryption certificate chains published by the server.
    pub chiffrage: Vec<Vec<String>>,
    pub store: Arc<CertificateStore>,
}

/// Loads the descriptor: the CA it carries must hash to its `idmg` (and to
/// `expected_idmg` when pinned), then the descriptor must verify against that CA.
///
/// # Errors
/// `Mismatch` when the CA does not match the identity, `UntrustedChain` or
/// `InvalidSignature` when the descriptor does not verify.
pub fn load_fiche(
    message: &MilleGrillesMessage,
    expected_idmg: Option<&str>,
    now: i64,
) -> Result<Fiche> {
    let content: FicheContent = serde_json::from_str(&message.contenu)?;
    let store = CertificateStore::new(&content.ca)?;

    if store.idmg() != content.idmg {
        return Err(AuthError::Mismatch("idmg does not match the CA certificate".into()));
    }
    if let Some(expected) = expected_idmg {
        if expected != content.idmg {
            return Err(AuthError::Mismatch(format!(
                "expected MilleGrille {expected}, got {}",
                content.idmg
            )));
        }
    }

    let store = Arc::new(store);
    ResponseVerifier::new(Arc::clone(&store)).verify(message, now)?;
    info!(idmg = %content.idmg, "fiche loaded");

    Ok(Fiche {
        idmg: content.idmg,
        ca: content.ca,
        chiffrage: content.chiffrage,
        store,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Pki;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    fn fiche_message(pki: &Pki, idmg: &str) -> MilleGrillesMessage {
        pki.server_factory()
            .create_response(&json!({"idmg": idmg, "ca": pki.ca_pem(), "chiffrage": []}), NOW)
            .unwrap()
    }

    #[test]
    fn loads_and_pins_identity() {
        let pki = Pki::new();
        let idmg = CertificateStore::new(&pki.ca_pem()).unwrap().idmg().to_string();
        let message = fiche_message(&pki, &idmg);

        let fiche = load_fiche(&message, Some(&idmg), NOW).unwrap();
        assert_eq!(fiche.idmg, idmg);
        assert_eq!(fiche.store.idmg(), idmg);

        assert!(matches!(
            load_fiche(&message, Some("zOther"), NOW),
            Err(AuthError::Mismatch(_))
        ));
    }

    #[test]
    fn rejects_wrong_idmg_for_ca() {
        let pki = Pki::new();
        let message = fiche_message(&pki, "zForged");
        assert!(matches!(load_fiche(&message, None, NOW), Err(AuthError::Mismatch(_))));
    }

    #[test]
    fn rejects_descriptor_signed_under_another_ca() {
        let pki = Pki::new();
        let other = Pki::new();
        let idmg = CertificateStore::new(&pki.ca_pem()).unwrap().idmg().to_string();
        let message = other
            .server_factory()
            .create_response(&json!({"idmg": idmg, "ca": pki.ca_pem()}), NOW)
            .unwrap();
        assert!(matches!(
            load_fiche(&message, None, NOW),
            Err(AuthError::UntrustedChain(_))
        ));
    }
}
