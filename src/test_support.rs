//! Throwaway Ed25519 PKI for unit tests.

use crate::keygen::CertificateRequest;
use crate::message::{MessageFactory, MilleGrillesMessage};
use crate::storage::CertificateEntry;
use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signer, SigningKey};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    CustomExtension, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose, PKCS_ED25519,
};
use time::OffsetDateTime;

pub(crate) struct IssuedLeaf {
    pub cert_pem: String,
    pub public_key_hex: String,
    pub signing_key: SigningKey,
}

pub(crate) struct Pki {
    ca_key: KeyPair,
    ca_cert: Certificate,
    server_key: SigningKey,
    server_pem: String,
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

        let mut pki = Self {
            ca_key,
            ca_cert,
            server_key: SigningKey::from_bytes(&[0u8; 32]),
            server_pem: String::new(),
        };
        let server = pki.issue_user("server", None, 0, 4_000_000_000);
        pki.server_key = server.signing_key;
        pki.server_pem = server.cert_pem;
        pki
    }

    pub fn ca_pem(&self) -> String {
        self.ca_cert.pem()
    }

    pub fn issue_user(
        &self,
        common_name: &str,
        user_id: Option<&str>,
        not_before: i64,
        not_after: i64,
    ) -> IssuedLeaf {
        let key = KeyPair::generate_for(&PKCS_ED25519).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.not_before = at(not_before);
        params.not_after = at(not_after);
        if let Some(user_id) = user_id {
            params.custom_extensions.push(CustomExtension::from_oid_content(
                &[1, 2, 3, 4, 3],
                user_id.as_bytes().to_vec(),
            ));
        }
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        let signing_key = SigningKey::from_pkcs8_der(&key.serialize_der()).unwrap();

        IssuedLeaf {
            cert_pem: cert.pem(),
            public_key_hex: hex::encode(signing_key.verifying_key().as_bytes()),
            signing_key,
        }
    }

    /// Signs a client CSR the way the certificate authority would.
    pub fn sign_csr(&self, csr_pem: &str, not_before: i64, not_after: i64) -> String {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).unwrap();
        csr.params.not_before = at(not_before);
        csr.params.not_after = at(not_after);
        csr.signed_by(&self.ca_cert, &self.ca_key).unwrap().pem()
    }

    /// Stored entry for a leaf issued against `request`'s key.
    pub fn entry_for(&self, request: &CertificateRequest, not_before: i64, not_after: i64) -> CertificateEntry {
        CertificateEntry {
            chain: vec![self.sign_csr(&request.pem, not_before, not_after)],
            private_key: request.private_key.clone(),
            public_key: request.public_key.clone(),
            public_key_hex: request.public_key_hex.clone(),
        }
    }

    pub fn server_factory(&self) -> MessageFactory {
        MessageFactory::new(self.server_key.clone(), vec![self.server_pem.clone(), self.ca_pem()])
    }

    /// Recomputes id and signature after a test altered a message.
    pub fn resign(&self, message: &MilleGrillesMessage) -> MilleGrillesMessage {
        let mut message = message.clone();
        message.id = message.compute_id().unwrap();
        let signature = self.server_key.sign(&hex::decode(&message.id).unwrap());
        message.sig = Some(hex::encode(signature.to_bytes()));
        message
    }
}

fn at(timestamp: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(timestamp).unwrap()
}
