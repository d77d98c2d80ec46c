//! Connection transition table
//!
//! `apply` is the only place an instance's status, codes and reconnect
//! counter change. It is pure: the caller holds the per-instance lock and
//! performs the returned [`Effect`] (open a session, notify, schedule a
//! reconnect, ...).
//!
//! | From                          | Trigger                    | To              |
//! |-------------------------------|----------------------------|-----------------|
//! | uninitialized/disconnected/logged_out (any if forced) | init | connecting |
//! | connecting/qr_pending         | QR issued                  | qr_pending      |
//! | connecting/qr_pending         | pairing code issued        | pairing_pending |
//! | any but logged_out            | connection opened          | connected       |
//! | any                           | closed, logged out         | logged_out      |
//! | session state, attempts < max | closed, recoverable        | connecting      |
//! | session state, attempts ≥ max | closed, recoverable        | disconnected    |
//! | connecting                    | connect failed             | disconnected    |

use super::{Instance, InstanceStatus};
use crate::error::InstanceError;
use crate::retry::LinearBackoff;
use crate::transport::DisconnectReason;
use std::time::Duration;

/// Input to the transition table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    InitRequested { force: bool },
    QrIssued { code: String },
    PairingCodeIssued { code: String },
    ConnectionOpened { phone_number: Option<String> },
    ConnectionClosed { reason: DisconnectReason },
    /// The first connect of an init never produced a session.
    ConnectFailed,
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitRequested { .. } => "init_requested",
            Self::QrIssued { .. } => "qr_issued",
            Self::PairingCodeIssued { .. } => "pairing_code_issued",
            Self::ConnectionOpened { .. } => "connection_opened",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::ConnectFailed => "connect_failed",
        }
    }
}

/// Side effect the caller must carry out after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Open a fresh transport session.
    OpenSession,
    /// A QR code is waiting to be scanned.
    QrIssued,
    /// A pairing code is waiting to be entered.
    PairingIssued,
    /// Session is live; start the readiness window.
    Connected,
    /// Credentials were revoked; tear down and remove artifacts.
    LoggedOut,
    /// Reopen the session after `delay`.
    Reconnect { attempt: u32, delay: Duration },
    /// Reconnect budget exhausted.
    GiveUp,
    /// Nothing beyond persisting the new state.
    Idle,
}

/// Apply `trigger` to `instance`.
///
/// On error the instance is left untouched.
pub fn apply(
    instance: &mut Instance,
    trigger: Trigger,
    reconnect: &LinearBackoff,
) -> Result<Effect, InstanceError> {
    use InstanceStatus::*;

    let from = instance.status;
    let invalid = |trigger: &Trigger| InstanceError::InvalidTransition {
        from,
        trigger: trigger.name(),
    };

    let effect = match trigger {
        Trigger::InitRequested { force } => {
            if !force && !matches!(from, Uninitialized | Disconnected | LoggedOut) {
                return Err(invalid(&Trigger::InitRequested { force }));
            }
            instance.status = Connecting;
            instance.phone_number = None;
            instance.qr_code = None;
            instance.pairing_code = None;
            instance.reconnect_attempts = 0;
            Effect::OpenSession
        }

        Trigger::QrIssued { code } => {
            if !matches!(from, Connecting | QrPending) {
                return Err(invalid(&Trigger::QrIssued { code }));
            }
            instance.status = QrPending;
            instance.qr_code = Some(code);
            instance.pairing_code = None;
            Effect::QrIssued
        }

        Trigger::PairingCodeIssued { code } => {
            if !matches!(from, Connecting | QrPending) {
                return Err(invalid(&Trigger::PairingCodeIssued { code }));
            }
            instance.status = PairingPending;
            instance.pairing_code = Some(code);
            instance.qr_code = None;
            Effect::PairingIssued
        }

        Trigger::ConnectionOpened { phone_number } => {
            if from == LoggedOut {
                return Err(invalid(&Trigger::ConnectionOpened { phone_number }));
            }
            instance.status = Connected;
            instance.phone_number = phone_number;
            instance.qr_code = None;
            instance.pairing_code = None;
            instance.reconnect_attempts = 0;
            Effect::Connected
        }

        Trigger::ConnectionClosed {
            reason: DisconnectReason::LoggedOut,
        } => {
            instance.status = LoggedOut;
            instance.phone_number = None;
            instance.qr_code = None;
            instance.pairing_code = None;
            Effect::LoggedOut
        }

        Trigger::ConnectionClosed { reason } => {
            if !from.is_active() {
                return Err(invalid(&Trigger::ConnectionClosed { reason }));
            }
            instance.phone_number = None;
            instance.qr_code = None;
            instance.pairing_code = None;
            if reconnect.allows(instance.reconnect_attempts) {
                instance.reconnect_attempts += 1;
                instance.status = Connecting;
                let attempt = instance.reconnect_attempts;
                Effect::Reconnect {
                    attempt,
                    delay: reconnect.delay_for(attempt),
                }
            } else {
                instance.status = Disconnected;
                Effect::GiveUp
            }
        }

        Trigger::ConnectFailed => {
            if from != Connecting {
                return Err(invalid(&Trigger::ConnectFailed));
            }
            instance.status = Disconnected;
            instance.phone_number = None;
            Effect::Idle
        }
    };

    instance.touch();
    Ok(effect)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> LinearBackoff {
        LinearBackoff::new(Duration::from_secs(5), 5)
    }

    fn connecting() -> Instance {
        let mut instance = Instance::new("inst-1");
        apply(&mut instance, Trigger::InitRequested { force: false }, &backoff()).unwrap();
        instance
    }

    #[test]
    fn test_init_from_uninitialized() {
        let mut instance = Instance::new("inst-1");
        let effect =
            apply(&mut instance, Trigger::InitRequested { force: false }, &backoff()).unwrap();
        assert_eq!(effect, Effect::OpenSession);
        assert_eq!(instance.status(), InstanceStatus::Connecting);
    }

    #[test]
    fn test_init_rejected_while_active_unless_forced() {
        let mut instance = connecting();
        let err = apply(&mut instance, Trigger::InitRequested { force: false }, &backoff())
            .unwrap_err();
        assert!(matches!(err, InstanceError::InvalidTransition { .. }));

        apply(
            &mut instance,
            Trigger::QrIssued { code: "qr".into() },
            &backoff(),
        )
        .unwrap();
        let effect =
            apply(&mut instance, Trigger::InitRequested { force: true }, &backoff()).unwrap();
        assert_eq!(effect, Effect::OpenSession);
        assert_eq!(instance.qr_code(), None);
    }

    #[test]
    fn test_qr_then_pairing_swaps_codes() {
        let mut instance = connecting();
        apply(&mut instance, Trigger::QrIssued { code: "qr".into() }, &backoff()).unwrap();
        assert_eq!(instance.status(), InstanceStatus::QrPending);
        assert_eq!(instance.qr_code(), Some("qr"));

        apply(
            &mut instance,
            Trigger::PairingCodeIssued { code: "ABCD-1234".into() },
            &backoff(),
        )
        .unwrap();
        assert_eq!(instance.status(), InstanceStatus::PairingPending);
        assert_eq!(instance.qr_code(), None);
        assert_eq!(instance.pairing_code(), Some("ABCD-1234"));
    }

    #[test]
    fn test_qr_rejected_when_connected() {
        let mut instance = connecting();
        apply(
            &mut instance,
            Trigger::ConnectionOpened { phone_number: Some("1555".into()) },
            &backoff(),
        )
        .unwrap();
        let before = instance.clone();
        assert!(apply(&mut instance, Trigger::QrIssued { code: "qr".into() }, &backoff()).is_err());
        assert_eq!(instance, before);
    }

    #[test]
    fn test_open_resets_counter_and_codes() {
        let mut instance = connecting();
        apply(&mut instance, Trigger::QrIssued { code: "qr".into() }, &backoff()).unwrap();
        apply(
            &mut instance,
            Trigger::ConnectionClosed { reason: DisconnectReason::Recoverable(515) },
            &backoff(),
        )
        .unwrap();
        assert_eq!(instance.reconnect_attempts(), 1);

        let effect = apply(
            &mut instance,
            Trigger::ConnectionOpened { phone_number: Some("15550001111".into()) },
            &backoff(),
        )
        .unwrap();
        assert_eq!(effect, Effect::Connected);
        assert_eq!(instance.reconnect_attempts(), 0);
        assert_eq!(instance.phone_number(), Some("15550001111"));
        assert_eq!(instance.qr_code(), None);
    }

    #[test]
    fn test_logged_out_is_terminal_for_open() {
        let mut instance = connecting();
        let effect = apply(
            &mut instance,
            Trigger::ConnectionClosed { reason: DisconnectReason::LoggedOut },
            &backoff(),
        )
        .unwrap();
        assert_eq!(effect, Effect::LoggedOut);
        assert!(apply(
            &mut instance,
            Trigger::ConnectionOpened { phone_number: None },
            &backoff()
        )
        .is_err());
    }

    #[test]
    fn test_recoverable_close_backs_off_linearly_then_gives_up() {
        let mut instance = connecting();
        let close = Trigger::ConnectionClosed {
            reason: DisconnectReason::Recoverable(408),
        };

        for attempt in 1..=5 {
            let effect = apply(&mut instance, close.clone(), &backoff()).unwrap();
            assert_eq!(
                effect,
                Effect::Reconnect {
                    attempt,
                    delay: Duration::from_secs(5 * u64::from(attempt)),
                }
            );
            assert_eq!(instance.status(), InstanceStatus::Connecting);
        }

        assert_eq!(apply(&mut instance, close.clone(), &backoff()).unwrap(), Effect::GiveUp);
        assert_eq!(instance.status(), InstanceStatus::Disconnected);
        assert_eq!(instance.reconnect_attempts(), 5);

        // No session left to close
        assert!(apply(&mut instance, close, &backoff()).is_err());
    }

    #[test]
    fn test_phone_number_cleared_when_session_drops() {
        let backoff = LinearBackoff::new(Duration::from_secs(5), 1);
        let mut instance = connecting();
        let opened = Trigger::ConnectionOpened {
            phone_number: Some("15550001111".into()),
        };
        let close = Trigger::ConnectionClosed {
            reason: DisconnectReason::Recoverable(428),
        };

        apply(&mut instance, opened.clone(), &backoff).unwrap();
        apply(&mut instance, close.clone(), &backoff).unwrap();
        assert_eq!(instance.status(), InstanceStatus::Connecting);
        assert_eq!(instance.phone_number(), None);

        apply(&mut instance, opened, &backoff).unwrap();
        assert_eq!(instance.phone_number(), Some("15550001111"));
        apply(&mut instance, close.clone(), &backoff).unwrap();
        assert_eq!(apply(&mut instance, close, &backoff).unwrap(), Effect::GiveUp);
        assert_eq!(instance.status(), InstanceStatus::Disconnected);
        assert_eq!(instance.phone_number(), None);
    }

    #[test]
    fn test_forced_init_clears_phone_number() {
        let mut instance = connecting();
        apply(
            &mut instance,
            Trigger::ConnectionOpened { phone_number: Some("1555".into()) },
            &backoff(),
        )
        .unwrap();
        apply(&mut instance, Trigger::InitRequested { force: true }, &backoff()).unwrap();
        assert_eq!(instance.phone_number(), None);
    }

    #[test]
    fn test_connect_failed_only_from_connecting() {
        let mut instance = connecting();
        assert_eq!(
            apply(&mut instance, Trigger::ConnectFailed, &backoff()).unwrap(),
            Effect::Idle
        );
        assert_eq!(instance.status(), InstanceStatus::Disconnected);
        assert!(apply(&mut instance, Trigger::ConnectFailed, &backoff()).is_err());
    }
}
