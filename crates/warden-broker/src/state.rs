use std::sync::atomic::{AtomicU8, Ordering};

use warden_types::{Result, WardenError};

/// The broker's own lifecycle (§4.4): `inactive -> activating -> active ->
/// destroying -> destroyed`, with `destroyed -> activating` permitted via
/// restart. Any other transition is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BrokerState {
    Inactive = 0,
    Activating = 1,
    Active = 2,
    Destroying = 3,
    Destroyed = 4,
}

impl BrokerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => BrokerState::Inactive,
            1 => BrokerState::Activating,
            2 => BrokerState::Active,
            3 => BrokerState::Destroying,
            _ => BrokerState::Destroyed,
        }
    }

    /// Whether moving from `self` to `to` is one of the permitted edges.
    fn allows(self, to: BrokerState) -> bool {
        use BrokerState::*;
        matches!(
            (self, to),
            (Inactive, Activating)
                | (Activating, Active)
                | (Activating, Inactive)
                | (Active, Destroying)
                | (Destroying, Destroyed)
                | (Destroyed, Activating)
        )
    }
}

/// Atomic holder for `BrokerState`, shared between the method callers and
/// the periodic timer / signal-handling tasks.
pub struct SharedBrokerState(AtomicU8);

impl SharedBrokerState {
    pub fn new(initial: BrokerState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> BrokerState {
        BrokerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Performs `from -> to` if `self` is currently `from` and the edge is
    /// permitted; otherwise returns `InvalidState` without changing
    /// anything, so callers never observe a half-applied transition.
    pub fn transition(&self, from: BrokerState, to: BrokerState) -> Result<()> {
        if !from.allows(to) {
            return Err(WardenError::InvalidState(format!(
                "{from:?} -> {to:?} is not a permitted broker transition"
            )));
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                WardenError::InvalidState(format!(
                    "expected broker state {from:?}, found {:?}",
                    BrokerState::from_u8(actual)
                ))
            })
    }

    pub fn require(&self, expected: BrokerState) -> Result<()> {
        let current = self.get();
        if current != expected {
            return Err(WardenError::InvalidState(format!(
                "operation requires broker state {expected:?}, found {current:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle_transitions_succeed() {
        let state = SharedBrokerState::new(BrokerState::Inactive);
        state.transition(BrokerState::Inactive, BrokerState::Activating).unwrap();
        state.transition(BrokerState::Activating, BrokerState::Active).unwrap();
        state.transition(BrokerState::Active, BrokerState::Destroying).unwrap();
        state.transition(BrokerState::Destroying, BrokerState::Destroyed).unwrap();
        assert_eq!(state.get(), BrokerState::Destroyed);
    }

    #[test]
    fn restart_from_destroyed_is_permitted() {
        let state = SharedBrokerState::new(BrokerState::Destroyed);
        state.transition(BrokerState::Destroyed, BrokerState::Activating).unwrap();
        assert_eq!(state.get(), BrokerState::Activating);
    }

    #[test]
    fn destroy_while_activating_is_rejected() {
        let state = SharedBrokerState::new(BrokerState::Activating);
        assert!(state.transition(BrokerState::Activating, BrokerState::Destroying).is_err());
        assert_eq!(state.get(), BrokerState::Activating);
    }

    #[test]
    fn double_destroy_is_rejected() {
        let state = SharedBrokerState::new(BrokerState::Destroyed);
        assert!(state.transition(BrokerState::Destroyed, BrokerState::Destroying).is_err());
    }
}
