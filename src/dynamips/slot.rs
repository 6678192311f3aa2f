use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::nio::Nio;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Empty,
    Attached,
    Capturing,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid port transition: {0:?} -> {1:?}")]
    InvalidTransition(SlotState, SlotState),
}

/// One `(node, port)` slot. Callers hold the slot's async lock for the whole
/// of a lifecycle operation, so transitions on a slot never interleave.
#[derive(Debug)]
pub struct PortSlot {
    state: SlotState,
    nio: Option<Arc<Nio>>,
}

impl Default for PortSlot {
    fn default() -> Self {
        Self { state: SlotState::Empty, nio: None }
    }
}

impl PortSlot {
    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn nio(&self) -> Option<&Arc<Nio>> {
        self.nio.as_ref()
    }

    pub fn can_transition(&self, to: SlotState) -> bool {
        matches!(
            (self.state, to),
            (SlotState::Empty, SlotState::Attached)
                | (SlotState::Attached, SlotState::Capturing)
                | (SlotState::Capturing, SlotState::Attached)
                | (SlotState::Attached, SlotState::Empty)
                | (SlotState::Capturing, SlotState::Empty)
        )
    }

    fn transition(&mut self, to: SlotState) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::trace!("Port transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }

    pub fn attach(&mut self, nio: Arc<Nio>) -> Result<(), TransitionError> {
        self.transition(SlotState::Attached)?;
        self.nio = Some(nio);
        Ok(())
    }

    pub fn begin_capture(&mut self) -> Result<(), TransitionError> {
        self.transition(SlotState::Capturing)
    }

    pub fn end_capture(&mut self) -> Result<(), TransitionError> {
        self.transition(SlotState::Attached)
    }

    /// Empty the slot and hand back the NIO that was attached.
    pub fn detach(&mut self) -> Result<Arc<Nio>, TransitionError> {
        self.transition(SlotState::Empty)?;
        self.nio
            .take()
            .ok_or(TransitionError::InvalidTransition(SlotState::Empty, SlotState::Empty))
    }
}
