use std::fmt;
use thiserror::Error;

/// Login screen state, independent of any rendering layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AuthState {
    #[default]
    Idle,
    CheckingUser {
        username: String,
    },
    /// Unknown username, registration offered.
    Register {
        username: String,
    },
    /// The stored certificate is being used, no device interaction.
    CertificateAuth {
        username: String,
    },
    WebauthnChallenge {
        username: String,
    },
    /// No way to authenticate from here, activation code shown.
    Recovery {
        username: String,
    },
    SessionEstablished {
        username: String,
        user_id: Option<String>,
    },
    Abandoned,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthEvent {
    CheckUser(String),
    UnknownUser,
    CertificateChallengeOffered,
    ActivationAccepted,
    WebauthnChallengeOffered,
    NoMethodAvailable,
    /// The lookup itself failed; the next keystroke retries.
    LookupFailed,
    RecoveryRequested,
    SessionResumed {
        username: String,
        user_id: Option<String>,
    },
    Authenticated {
        user_id: Option<String>,
    },
    Rejected,
    Abandon,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition from {from} on {event}")]
pub struct InvalidTransition {
    pub from: String,
    pub event: String,
}

impl InvalidTransition {
    pub(crate) fn new(from: &AuthState, event: impl fmt::Debug) -> Self {
        Self {
            from: from.to_string(),
            event: format!("{event:?}"),
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::CheckingUser { .. } => "checking-user",
            Self::Register { .. } => "register",
            Self::CertificateAuth { .. } => "certificate-auth",
            Self::WebauthnChallenge { .. } => "webauthn-challenge",
            Self::Recovery { .. } => "recovery",
            Self::SessionEstablished { .. } => "session-established",
            Self::Abandoned => "abandoned",
        };
        f.write_str(name)
    }
}

impl AuthState {
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        match self {
            Self::CheckingUser { username }
            | Self::Register { username }
            | Self::CertificateAuth { username }
            | Self::WebauthnChallenge { username }
            | Self::Recovery { username }
            | Self::SessionEstablished { username, .. } => Some(username),
            Self::Idle | Self::Abandoned => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionEstablished { .. } | Self::Abandoned)
    }

    /// Returns the state reached on `event`.
    ///
    /// # Errors
    /// `InvalidTransition` when `event` is not accepted in this state. Terminal
    /// states accept nothing.
    pub fn on(&self, event: AuthEvent) -> Result<Self, InvalidTransition> {
        use AuthEvent as E;

        let invalid = |event: AuthEvent| Err(InvalidTransition::new(self, event));
        if self.is_terminal() {
            return invalid(event);
        }
        let username = || self.username().unwrap_or_default().to_string();

        match (self, event) {
            (_, E::Abandon) => Ok(Self::Abandoned),
            (Self::CertificateAuth { .. }, event @ E::CheckUser(_)) => invalid(event),
            (_, E::CheckUser(username)) => Ok(Self::CheckingUser { username }),
            (Self::Idle, E::SessionResumed { username, user_id }) => {
                Ok(Self::SessionEstablished { username, user_id })
            }

            (Self::CheckingUser { .. }, E::UnknownUser) => Ok(Self::Register { username: username() }),
            (Self::CheckingUser { .. }, E::CertificateChallengeOffered | E::ActivationAccepted) => {
                Ok(Self::CertificateAuth { username: username() })
            }
            (Self::CheckingUser { .. }, E::WebauthnChallengeOffered) => {
                Ok(Self::WebauthnChallenge { username: username() })
            }
            (Self::CheckingUser { .. }, E::NoMethodAvailable) => Ok(Self::Recovery { username: username() }),
            (Self::CheckingUser { .. }, E::LookupFailed) => Ok(Self::Idle),

            (
                Self::Register { .. } | Self::WebauthnChallenge { .. } | Self::CertificateAuth { .. },
                E::RecoveryRequested,
            ) => Ok(Self::Recovery { username: username() }),

            (
                Self::Register { .. }
                | Self::CertificateAuth { .. }
                | Self::WebauthnChallenge { .. }
                | Self::Recovery { .. },
                E::Authenticated { user_id },
            ) => Ok(Self::SessionEstablished { username: username(), user_id }),

            (Self::CertificateAuth { .. }, E::Rejected) => Ok(Self::Idle),
            (Self::Register { .. } | Self::WebauthnChallenge { .. } | Self::Recovery { .. }, E::Rejected) => {
                Ok(self.clone())
            }

            (_, event) => invalid(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checking() -> AuthState {
        AuthState::Idle.on(AuthEvent::CheckUser("alice".into())).unwrap()
    }

    #[test]
    fn lookup_outcomes() {
        assert_eq!(
            checking().on(AuthEvent::UnknownUser).unwrap(),
            AuthState::Register { username: "alice".into() }
        );
        assert_eq!(
            checking().on(AuthEvent::WebauthnChallengeOffered).unwrap(),
            AuthState::WebauthnChallenge { username: "alice".into() }
        );
        assert_eq!(
            checking().on(AuthEvent::ActivationAccepted).unwrap(),
            AuthState::CertificateAuth { username: "alice".into() }
        );
        assert_eq!(
            checking().on(AuthEvent::NoMethodAvailable).unwrap(),
            AuthState::Recovery { username: "alice".into() }
        );
        assert_eq!(checking().on(AuthEvent::LookupFailed).unwrap(), AuthState::Idle);
    }

    #[test]
    fn webauthn_rejection_keeps_challenge_screen() {
        let state = checking().on(AuthEvent::WebauthnChallengeOffered).unwrap();
        assert_eq!(state.on(AuthEvent::Rejected).unwrap(), state);
        let recovery = state.on(AuthEvent::RecoveryRequested).unwrap();
        assert_eq!(recovery, AuthState::Recovery { username: "alice".into() });
    }

    #[test]
    fn authenticated_is_terminal() {
        let state = checking()
            .on(AuthEvent::WebauthnChallengeOffered)
            .unwrap()
            .on(AuthEvent::Authenticated { user_id: Some("u-1".into()) })
            .unwrap();
        assert_eq!(
            state,
            AuthState::SessionEstablished { username: "alice".into(), user_id: Some("u-1".into()) }
        );
        assert!(state.is_terminal());
        assert!(state.on(AuthEvent::Abandon).is_err());
        assert!(state.on(AuthEvent::CheckUser("bob".into())).is_err());
    }

    #[test]
    fn abandon_from_any_open_state() {
        for state in [
            AuthState::Idle,
            checking(),
            checking().on(AuthEvent::UnknownUser).unwrap(),
            checking().on(AuthEvent::NoMethodAvailable).unwrap(),
        ] {
            assert_eq!(state.on(AuthEvent::Abandon).unwrap(), AuthState::Abandoned);
        }
    }

    #[test]
    fn new_username_restarts_lookup() {
        let state = checking().on(AuthEvent::UnknownUser).unwrap();
        assert_eq!(
            state.on(AuthEvent::CheckUser("bob".into())).unwrap(),
            AuthState::CheckingUser { username: "bob".into() }
        );
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        let err = AuthState::Idle.on(AuthEvent::Authenticated { user_id: None }).unwrap_err();
        assert_eq!(err.from, "idle");
        assert!(AuthState::Idle.on(AuthEvent::UnknownUser).is_err());
        let cert = checking().on(AuthEvent::CertificateChallengeOffered).unwrap();
        assert!(cert.on(AuthEvent::CheckUser("bob".into())).is_err());
        assert_eq!(cert.on(AuthEvent::Rejected).unwrap(), AuthState::Idle);
    }

    #[test]
    fn resumed_session_from_idle() {
        let state = AuthState::Idle
            .on(AuthEvent::SessionResumed { username: "alice".into(), user_id: None })
            .unwrap();
        assert_eq!(state.username(), Some("alice"));
        assert!(state.is_terminal());
    }
}
