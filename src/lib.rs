//! # MilleGrilles authentication client
//!
//! Client side of MilleGrilles account authentication: every user holds an
//! Ed25519 certificate issued by the MilleGrille CA and proves possession of it
//! to the server, or signs a WebAuthn challenge with a security device to get a
//! new one.
//!
//! ## Pieces
//!
//! - [`keygen`] creates keypairs and CSRs, [`lifecycle`] renews certificates
//!   before they expire and clears them once they have.
//! - [`challenge`] turns a server WebAuthn challenge into device options, binding
//!   a pending CSR to the signature.
//! - [`verifier`] checks every signed server reply against the CA before it is
//!   read; [`transport`] is the account protocol on top of it.
//! - [`auth`] drives login and registration, [`recovery`] links a new browser
//!   from another device and [`enrollment`] adds security devices or TOTP.
//!
//! The `cli` feature, on by default, adds the `millegrilles-auth` binary and
//! its `cli` module.
//!
//! Storage, transport and the security device are collaborators behind
//! [`storage::UserStore`], [`transport::Connection`] and
//! [`device::SecurityDevice`].

pub mod auth;
pub mod certificate;
pub mod challenge;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod device;
pub mod encoding;
pub mod enrollment;
pub mod error;
pub mod fiche;
pub mod keygen;
pub mod lifecycle;
pub mod message;
pub mod recovery;
pub mod storage;
pub mod transport;
pub mod verifier;

#[cfg(test)]
mod test_support;

pub use auth::{AuthContext, AuthState, Authenticator, CheckOutcome, Session};
pub use certificate::{CertificateStore, CertificateWrapper};
pub use config::ClientConfig;
pub use enrollment::SecurityDeviceEnrollment;
pub use error::{AuthError, Result};
pub use recovery::RecoveryFlow;
