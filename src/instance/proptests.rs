//! Property-based tests for the connection transition table
//!
//! Arbitrary trigger sequences, applied the way the manager applies them
//! (rejected triggers leave the instance untouched), must keep:
//! - qrCode and pairingCode never both set, and both unset outside their states
//! - phoneNumber set only while connected
//! - reconnectAttempts never above the configured maximum

use super::state_machine::{apply, Effect, Trigger};
use super::{Instance, InstanceStatus};
use crate::retry::LinearBackoff;
use crate::transport::DisconnectReason;
use proptest::prelude::*;
use std::time::Duration;

fn trigger_strategy() -> impl Strategy<Value = Trigger> {
    prop_oneof![
        any::<bool>().prop_map(|force| Trigger::InitRequested { force }),
        "[a-z0-9]{1,8}".prop_map(|code| Trigger::QrIssued { code }),
        "[A-Z0-9]{8}".prop_map(|code| Trigger::PairingCodeIssued { code }),
        proptest::option::of("[0-9]{6,12}")
            .prop_map(|phone_number| Trigger::ConnectionOpened { phone_number }),
        prop_oneof![Just(401u16), 400u16..600]
            .prop_map(|code| Trigger::ConnectionClosed {
                reason: DisconnectReason::from_code(code)
            }),
        Just(Trigger::ConnectFailed),
    ]
}

proptest! {
    /// Property: QR, pairing codes and phone number are tied to their states
    #[test]
    fn codes_are_exclusive(triggers in prop::collection::vec(trigger_strategy(), 0..64)) {
        let backoff = LinearBackoff::new(Duration::from_secs(5), 5);
        let mut instance = Instance::new("prop");

        for trigger in triggers {
            let _ = apply(&mut instance, trigger, &backoff);

            prop_assert!(!(instance.qr_code().is_some() && instance.pairing_code().is_some()));
            if instance.status() != InstanceStatus::QrPending {
                prop_assert!(instance.qr_code().is_none());
            }
            if instance.status() != InstanceStatus::PairingPending {
                prop_assert!(instance.pairing_code().is_none());
            }
            if instance.status() != InstanceStatus::Connected {
                prop_assert!(instance.phone_number().is_none());
            }
        }
    }

    /// Property: reconnect attempts are bounded and the budget ends in Disconnected
    #[test]
    fn reconnect_attempts_are_bounded(
        max in 0u32..8,
        triggers in prop::collection::vec(trigger_strategy(), 0..64),
    ) {
        let backoff = LinearBackoff::new(Duration::from_secs(5), max);
        let mut instance = Instance::new("prop");

        for trigger in triggers {
            let before = instance.reconnect_attempts();
            match apply(&mut instance, trigger, &backoff) {
                Ok(Effect::Reconnect { attempt, delay }) => {
                    prop_assert!(attempt <= max);
                    prop_assert_eq!(attempt, before + 1);
                    prop_assert_eq!(delay, backoff.delay_for(attempt));
                }
                Ok(Effect::GiveUp) => {
                    prop_assert_eq!(instance.status(), InstanceStatus::Disconnected);
                    prop_assert_eq!(before, instance.reconnect_attempts());
                    prop_assert!(before >= max);
                }
                _ => {}
            }
            prop_assert!(instance.reconnect_attempts() <= max);
        }
    }
}
