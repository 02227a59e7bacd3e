//! Shared shape of a saga transition: the next state value plus the effects
//! the runtime must perform once that state is stored.

use crate::messages::{Anomaly, Effect, Event};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<S> {
    pub state: S,
    pub effects: Vec<Effect>,
}

impl<S> Transition<S> {
    pub fn new(state: S, effects: Vec<Effect>) -> Self {
        Self { state, effects }
    }

    pub fn unchanged(state: S) -> Self {
        Self::new(state, Vec::new())
    }

    pub fn anomaly(state: S, anomaly: Anomaly) -> Self {
        Self::new(state, vec![Effect::Publish(Event::Anomaly(anomaly))])
    }
}

/// Implemented by every per-correlation state value kept in a saga store.
pub trait SagaState {
    /// Once true the store keeps only a tombstone and later messages for
    /// the correlation are dropped.
    fn is_complete(&self) -> bool;
}
