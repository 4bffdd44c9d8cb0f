#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use async_trait::async_trait;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::SigningKey;
use millegrilles_auth::auth::{AuthContext, Authenticator};
use millegrilles_auth::certificate::{CertificateStore, CertificateWrapper};
use millegrilles_auth::challenge::PublicKeyOptions;
use millegrilles_auth::config::ClientConfig;
use millegrilles_auth::device::{AssertionResponse, SecurityDevice, SignedAssertion};
use millegrilles_auth::error::{AuthError, Result};
use millegrilles_auth::keygen::inspect_csr;
use millegrilles_auth::lifecycle::now_unix_seconds;
use millegrilles_auth::message::{MessageFactory, MilleGrillesMessage};
use millegrilles_auth::recovery::activation_code;
use millegrilles_auth::storage::MemoryUserStore;
use millegrilles_auth::transport::{
    Connection, ServerApi, ACTION_ACTIVATE_SESSION, ACTION_ADD_KEY, ACTION_ADD_RECOVERY,
    ACTION_AUTHENTICATE, ACTION_CONFIRM_TOTP, ACTION_GENERATE_CHALLENGE, ACTION_GENERATE_TOTP,
    ACTION_GET_RECOVERY_BY_CODE, ACTION_GET_USER, ACTION_REGISTER, ACTION_SIGN_ACCOUNT,
};
use millegrilles_auth::verifier::ResponseVerifier;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose, PKCS_ED25519,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Notify};

pub const USER_ID: &str = "u-1";
pub const DAY: i64 = 86_400;

fn at(timestamp: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(timestamp).unwrap()
}

/// Throwaway CA plus a server certificate to sign replies with.
pub struct Pki {
    ca_key: KeyPair,
    ca_cert: Certificate,
    server: MessageFactory,
}

impl Pki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate_for(&PKCS_ED25519).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, "MilleGrille test CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        params.not_before = at(0);
        params.not_after = at(4_000_000_000);
        let ca_cert = params.self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate_for(&PKCS_ED25519).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, "maitredescomptes");
        params.not_before = at(0);
        params.not_after = at(4_000_000_000);
        let server_cert = params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();
        let signing_key = SigningKey::from_pkcs8_der(&server_key.serialize_der()).unwrap();
        let server = MessageFactory::new(signing_key, vec![server_cert.pem(), ca_cert.pem()]);

        Self {
            ca_key,
            ca_cert,
            server,
        }
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    /// Signs a client CSR for 30 days starting now, returning `[leaf, ca]`.
    pub fn issue(&self, csr_pem: &str) -> Vec<String> {
        let now = now_unix_seconds();
        self.issue_between(csr_pem, now - 60, now + 30 * DAY)
    }

    pub fn issue_between(&self, csr_pem: &str, not_before: i64, not_after: i64) -> Vec<String> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).unwrap();
        csr.params.not_before = at(not_before);
        csr.params.not_after = at(not_after);
        let leaf = csr.signed_by(&self.ca_cert, &self.ca_key).unwrap();
        vec![leaf.pem(), self.ca_pem()]
    }

    /// Leaf for an arbitrary common name and key, as a misbehaving server would
    /// issue it.
    pub fn issue_foreign(&self, common_name: &str) -> Vec<String> {
        let key = KeyPair::generate_for(&PKCS_ED25519).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        let now = now_unix_seconds();
        params.not_before = at(now - 60);
        params.not_after = at(now + 30 * DAY);
        let leaf = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        vec![leaf.pem(), self.ca_pem()]
    }

    pub fn sign(&self, content: &Value) -> MilleGrillesMessage {
        self.server
            .create_response(content, now_unix_seconds())
            .unwrap()
    }
}

/// In-process account server. `getUsager` replies are scripted; everything
/// else follows the protocol.
pub struct FakeServer {
    pub pki: Pki,
    lookups: Mutex<VecDeque<Value>>,
    pub accept_assertions: AtomicBool,
    pub calls: Mutex<Vec<(String, Value)>>,
    recovery: Mutex<Vec<(String, String)>>,
    activations: Mutex<HashMap<String, mpsc::Sender<MilleGrillesMessage>>>,
    pub unsubscribed: AtomicUsize,
    pub issued: Mutex<Vec<Vec<String>>>,
    /// Holds every signed command this long before answering.
    pub submit_delay: Mutex<Option<Duration>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self {
            pki: Pki::new(),
            lookups: Mutex::new(VecDeque::new()),
            accept_assertions: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            recovery: Mutex::new(Vec::new()),
            activations: Mutex::new(HashMap::new()),
            unsubscribed: AtomicUsize::new(0),
            issued: Mutex::new(Vec::new()),
            submit_delay: Mutex::new(None),
        }
    }

    /// Queues `getUsager` replies; the last one keeps being returned.
    pub fn script_lookups(&self, replies: impl IntoIterator<Item = Value>) {
        self.lookups.lock().unwrap().extend(replies);
    }

    pub fn actions(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(action, _)| action.clone()).collect()
    }

    pub fn payloads(&self, action: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(seen, _)| seen == action)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn is_subscribed(&self, public_key_hex: &str) -> bool {
        self.activations.lock().unwrap().contains_key(public_key_hex)
    }

    /// Pushes a signed activation to the subscriber of `public_key_hex`.
    pub fn push_activation(&self, public_key_hex: &str, content: &Value) {
        let sender = self
            .activations
            .lock()
            .unwrap()
            .get(public_key_hex)
            .cloned()
            .expect("no subscriber for key");
        sender.try_send(self.pki.sign(content)).unwrap();
    }

    /// Ends the subscription of `public_key_hex` from the server side.
    pub fn drop_subscription(&self, public_key_hex: &str) {
        self.activations.lock().unwrap().remove(public_key_hex);
    }

    /// Approves the recovery request registered for `public_key_hex`, as the
    /// companion device would.
    pub fn approve_recovery(&self, public_key_hex: &str) {
        let csr = self
            .recovery
            .lock()
            .unwrap()
            .iter()
            .find(|(_, csr)| inspect_csr(csr).unwrap().public_key_hex == public_key_hex)
            .map(|(_, csr)| csr.clone())
            .expect("no recovery request for key");
        let chain = self.issue(&csr);
        self.push_activation(
            public_key_hex,
            &json!({"certificat": chain, "fingerprint_pk": public_key_hex}),
        );
    }

    fn issue(&self, csr: &str) -> Vec<String> {
        let chain = self.pki.issue(csr);
        self.issued.lock().unwrap().push(chain.clone());
        chain
    }

    pub fn last_issued(&self) -> Vec<String> {
        self.issued.lock().unwrap().last().cloned().expect("nothing issued")
    }

    fn lookup(&self) -> Value {
        let mut lookups = self.lookups.lock().unwrap();
        if lookups.len() > 1 {
            lookups.pop_front().unwrap_or(Value::Null)
        } else {
            lookups.front().cloned().unwrap_or(Value::Null)
        }
    }

    fn reply_to(&self, action: &str, payload: &Value) -> Value {
        match action {
            ACTION_GET_USER => self.lookup(),
            ACTION_REGISTER => {
                let csr = payload["csr"].as_str().unwrap();
                json!({"ok": true, "certificat": self.issue(csr)})
            }
            ACTION_AUTHENTICATE => {
                if !self.accept_assertions.load(Ordering::SeqCst) {
                    return json!({"auth": false});
                }
                match payload["demandeCertificat"]["csr"].as_str() {
                    Some(csr) => {
                        json!({"auth": true, "userId": USER_ID, "certificat": self.issue(csr)})
                    }
                    None => json!({"auth": true, "userId": USER_ID}),
                }
            }
            ACTION_ADD_RECOVERY => {
                let username = payload["nomUsager"].as_str().unwrap().to_string();
                let csr = payload["csr"].as_str().unwrap().to_string();
                self.recovery.lock().unwrap().push((username, csr));
                json!({"ok": true})
            }
            ACTION_GET_RECOVERY_BY_CODE => {
                let code = payload["code"].as_str().unwrap();
                let found = self.recovery.lock().unwrap().iter().find_map(|(username, csr)| {
                    let key = inspect_csr(csr).ok()?.public_key_hex;
                    (activation_code(&key).ok()? == code).then(|| (username.clone(), csr.clone()))
                });
                match found {
                    Some((username, csr)) => json!({"ok": true, "csr": csr, "nomUsager": username}),
                    None => json!({"ok": false}),
                }
            }
            ACTION_GENERATE_CHALLENGE => json!({
                "ok": true,
                "challenge": {"publicKey": {"challenge": "cmVnaXN0cmF0aW9u", "rp": {"id": "grille.local"}}},
            }),
            ACTION_ADD_KEY => json!({"ok": true}),
            ACTION_GENERATE_TOTP => json!({"ok": true, "qr": "iVBORw0KGgo", "correlation": "totp-1"}),
            ACTION_CONFIRM_TOTP => json!({"ok": payload["code"] == "123456", "err": "wrong code"}),
            other => json!({"ok": false, "err": format!("unexpected {other}")}),
        }
    }
}

#[async_trait]
impl Connection for FakeServer {
    async fn request(&self, _domain: &str, action: &str, payload: Value) -> Result<MilleGrillesMessage> {
        self.calls.lock().unwrap().push((action.to_string(), payload.clone()));
        Ok(self.pki.sign(&self.reply_to(action, &payload)))
    }

    async fn submit(&self, message: MilleGrillesMessage) -> Result<MilleGrillesMessage> {
        let action = message
            .routage
            .as_ref()
            .and_then(|routage| routage.action.clone())
            .unwrap_or_default();
        let content: Value = serde_json::from_str(&message.contenu)?;
        self.calls.lock().unwrap().push((action.clone(), content.clone()));
        let delay = *self.submit_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let chain = message.certificat.clone().unwrap_or_default();
        let username = CertificateWrapper::parse(&chain)
            .ok()
            .and_then(|wrapper| wrapper.common_name().map(str::to_string));
        let reply = match action.as_str() {
            ACTION_AUTHENTICATE => json!({
                "auth": self.accept_assertions.load(Ordering::SeqCst),
                "userId": USER_ID,
            }),
            ACTION_ACTIVATE_SESSION => json!({"ok": true, "nomUsager": username, "userId": USER_ID}),
            ACTION_SIGN_ACCOUNT if self.accept_assertions.load(Ordering::SeqCst) => {
                let csr = content["demandeCertificat"]["csr"].as_str().unwrap();
                json!({"ok": true, "certificat": self.issue(csr)})
            }
            ACTION_SIGN_ACCOUNT => json!({"ok": false, "err": "assertion refused"}),
            other => json!({"ok": false, "err": format!("unexpected {other}")}),
        };
        Ok(self.pki.sign(&reply))
    }

    async fn raw_call(&self, _event: &str, _payload: Value) -> Result<Value> {
        Ok(json!({"auth": false}))
    }

    async fn subscribe_activation(&self, public_key_hex: &str) -> Result<mpsc::Receiver<MilleGrillesMessage>> {
        let (sender, receiver) = mpsc::channel(4);
        self.activations
            .lock()
            .unwrap()
            .insert(public_key_hex.to_string(), sender);
        Ok(receiver)
    }

    async fn unsubscribe_activation(&self, public_key_hex: &str) -> Result<()> {
        self.activations.lock().unwrap().remove(public_key_hex);
        self.unsubscribed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Signs whatever it is asked to, unless told to fail.
#[derive(Default)]
pub struct FakeDevice {
    pub fail: AtomicBool,
    pub challenges: Mutex<Vec<Vec<u8>>>,
    /// When set, credential creation waits for a notification.
    pub credential_gate: Mutex<Option<Arc<Notify>>>,
    pub credentials_requested: AtomicUsize,
}

impl FakeDevice {
    /// Makes the next credential creations wait until the returned handle is
    /// notified.
    pub fn hold_credentials(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.credential_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl SecurityDevice for FakeDevice {
    async fn get_assertion(&self, options: &PublicKeyOptions) -> Result<SignedAssertion> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuthError::HardwareInteractionFailed("user cancelled".into()));
        }
        self.challenges.lock().unwrap().push(options.challenge.clone());
        Ok(SignedAssertion {
            id: "Y3JlZGVudGlhbA".into(),
            response: AssertionResponse {
                authenticator_data: Some("YXV0aA".into()),
                client_data_json: Some("Y2xpZW50".into()),
                signature: Some("c2ln".into()),
                user_handle: None,
            },
            kind: "public-key".into(),
        })
    }

    async fn create_credential(&self, options: &Value) -> Result<Value> {
        self.credentials_requested.fetch_add(1, Ordering::SeqCst);
        let gate = self.credential_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuthError::HardwareInteractionFailed("no device".into()));
        }
        Ok(json!({"id": "bmV3LWtleQ", "options": options}))
    }
}

pub struct Harness {
    pub server: Arc<FakeServer>,
    pub device: Arc<FakeDevice>,
    pub store: Arc<MemoryUserStore>,
    pub ctx: Arc<AuthContext>,
}

impl Harness {
    pub fn new() -> Self {
        let server = Arc::new(FakeServer::new());
        let device = Arc::new(FakeDevice::default());
        let store = Arc::new(MemoryUserStore::new());

        let certificates = CertificateStore::new(&server.pki.ca_pem()).unwrap();
        let config = ClientConfig {
            request_timeout: Duration::from_secs(2),
            user_lookup_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        }
        .with_hostname("grille.local");
        let api = ServerApi::new(
            server.clone(),
            ResponseVerifier::new(Arc::new(certificates)),
            config,
        );
        let ctx = Arc::new(AuthContext::new(store.clone(), Arc::new(api), device.clone()));

        Self {
            server,
            device,
            store,
            ctx,
        }
    }

    pub fn authenticator(&self) -> Authenticator {
        Authenticator::new(self.ctx.clone())
    }
}
