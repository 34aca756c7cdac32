//! Option table with one slot per option type.

use tracing::debug;

use super::types::{OptionType, OptionValue};
use crate::core::error::{TcplsError, TcplsResult};
use crate::core::traits::OptionHooks;

/// A stored option payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionSlot {
    /// Option type.
    pub option_type: OptionType,
    /// Encoded payload.
    pub payload: Vec<u8>,
    /// Local effect was applied.
    pub setlocal: bool,
    /// Payload is to be sent to the peer.
    pub settopeer: bool,
}

/// Fixed-size option table.
#[derive(Debug, Default)]
pub struct OptionRegistry {
    slots: [Option<OptionSlot>; OptionType::COUNT],
}

impl OptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `payload` for `option_type`.
    ///
    /// The payload is validated and copied first; with `setlocal` the local
    /// effect is applied before the slot changes. On any failure the slot
    /// keeps its previous payload.
    pub fn set<H: OptionHooks>(
        &mut self,
        option_type: OptionType,
        payload: &[u8],
        setlocal: bool,
        settopeer: bool,
        hooks: &mut H,
    ) -> TcplsResult<()> {
        if option_type.is_stream_control() {
            return Err(TcplsError::OptionNotSettable(option_type));
        }

        let mut owned = Vec::new();
        owned.try_reserve_exact(payload.len())?;
        owned.extend_from_slice(payload);

        if setlocal {
            let value = OptionValue::decode(option_type, owned.clone())?;
            apply_local(&value, hooks)?;
        }

        // The previous payload is released by the assignment.
        self.slots[option_type.index()] = Some(OptionSlot {
            option_type,
            payload: owned,
            setlocal,
            settopeer,
        });
        debug!(option = ?option_type, setlocal, settopeer, "option set");
        Ok(())
    }

    /// Slot of `option_type`, if set.
    pub fn get(&self, option_type: OptionType) -> Option<&OptionSlot> {
        self.slots[option_type.index()].as_ref()
    }

    /// Payload registered for sending to the peer.
    pub fn peer_payload(&self, option_type: OptionType) -> TcplsResult<&[u8]> {
        match self.get(option_type) {
            Some(slot) if slot.settopeer && !slot.payload.is_empty() => Ok(&slot.payload),
            _ => Err(TcplsError::OptionNotFound(option_type)),
        }
    }

    /// Remove the slot of `option_type`.
    pub fn clear(&mut self, option_type: OptionType) -> Option<OptionSlot> {
        self.slots[option_type.index()].take()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over occupied slots in tag order.
    pub fn iter(&self) -> impl Iterator<Item = &OptionSlot> {
        self.slots.iter().flatten()
    }
}

/// Run the local-effect hook of a value.
///
/// Only user timeouts and congestion-control programs have local effects.
pub fn apply_local<H: OptionHooks>(value: &OptionValue, hooks: &mut H) -> TcplsResult<()> {
    match value {
        OptionValue::UserTimeout(timeout) => hooks.apply_user_timeout(*timeout),
        OptionValue::BpfCc(program) => hooks.load_congestion_control(program),
        OptionValue::Multihoming(..)
        | OptionValue::Failover(_)
        | OptionValue::StreamAttach(_)
        | OptionValue::StreamClose(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::NoopHooks;
    use crate::options::UserTimeout;

    #[derive(Default)]
    struct RecordingHooks {
        timeouts: Vec<UserTimeout>,
        programs: Vec<Vec<u8>>,
        fail: bool,
    }

    impl OptionHooks for RecordingHooks {
        fn apply_user_timeout(&mut self, timeout: UserTimeout) -> TcplsResult<()> {
            if self.fail {
                return Err(TcplsError::Config("refused".into()));
            }
            self.timeouts.push(timeout);
            Ok(())
        }

        fn load_congestion_control(&mut self, program: &[u8]) -> TcplsResult<()> {
            if self.fail {
                return Err(TcplsError::Config("refused".into()));
            }
            self.programs.push(program.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_set_and_replace() {
        let mut reg = OptionRegistry::new();
        let mut hooks = NoopHooks;

        reg.set(OptionType::BpfCc, b"first", false, true, &mut hooks)
            .unwrap();
        reg.set(OptionType::BpfCc, b"second", false, true, &mut hooks)
            .unwrap();

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.peer_payload(OptionType::BpfCc).unwrap(), b"second");
    }

    #[test]
    fn test_setlocal_invokes_hook() {
        let mut reg = OptionRegistry::new();
        let mut hooks = RecordingHooks::default();
        let timeout = UserTimeout::seconds(10).unwrap();

        reg.set(OptionType::UserTimeout, &timeout.encode(), true, false, &mut hooks)
            .unwrap();
        reg.set(OptionType::BpfCc, b"prog", true, false, &mut hooks)
            .unwrap();

        assert_eq!(hooks.timeouts, vec![timeout]);
        assert_eq!(hooks.programs, vec![b"prog".to_vec()]);
    }

    #[test]
    fn test_hook_failure_keeps_previous_slot() {
        let mut reg = OptionRegistry::new();
        let mut hooks = RecordingHooks::default();

        reg.set(OptionType::BpfCc, b"old", true, true, &mut hooks)
            .unwrap();
        hooks.fail = true;
        assert!(reg.set(OptionType::BpfCc, b"new", true, true, &mut hooks).is_err());

        assert_eq!(reg.get(OptionType::BpfCc).unwrap().payload, b"old");
    }

    #[test]
    fn test_invalid_local_value_rejected() {
        let mut reg = OptionRegistry::new();
        let err = reg
            .set(OptionType::UserTimeout, &[1, 2, 3], true, false, &mut NoopHooks)
            .unwrap_err();
        assert!(err.is_record_drop());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_peer_payload_requires_settopeer() {
        let mut reg = OptionRegistry::new();
        reg.set(OptionType::Failover, &[1], false, false, &mut NoopHooks)
            .unwrap();

        assert!(matches!(
            reg.peer_payload(OptionType::Failover),
            Err(TcplsError::OptionNotFound(OptionType::Failover))
        ));
        assert!(matches!(
            reg.peer_payload(OptionType::UserTimeout),
            Err(TcplsError::OptionNotFound(_))
        ));
    }

    #[test]
    fn test_stream_control_not_settable() {
        let mut reg = OptionRegistry::new();
        assert!(matches!(
            reg.set(OptionType::StreamAttach, &[0; 4], false, true, &mut NoopHooks),
            Err(TcplsError::OptionNotSettable(OptionType::StreamAttach))
        ));
    }
}
