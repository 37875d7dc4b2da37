//! Single-slot handoff between two actions.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use crate::check::CheckResults;
use crate::ticket::Ticket;
use crate::update_info::UpdateInfo;

use super::Action;

/// Values that flow between pipeline stages.
#[derive(Debug, Clone, PartialEq)]
pub enum PipeValue {
    Tickets(Vec<Ticket>),
    CheckResults(CheckResults),
    UpdateInfos(Vec<UpdateInfo>),
    Path(PathBuf),
    ReturnCode(i32),
    Count(usize),
}

/// Holds at most one [`PipeValue`]. Clones share the same slot, so bonding
/// one pipe to two actions connects the producer to the consumer.
///
/// Access is sequenced by the processor: the producer finishes before the
/// consumer starts, so the lock is never contended in practice.
#[derive(Debug, Clone, Default)]
pub struct ActionPipe {
    slot: Arc<Mutex<Option<PipeValue>>>,
}

impl ActionPipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(value: PipeValue) -> Self {
        let pipe = Self::new();
        pipe.set_contents(Some(value));
        pipe
    }

    pub fn contents(&self) -> Option<PipeValue> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_contents(&self, value: Option<PipeValue>) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Attach this pipe as `from`'s output and `to`'s input.
    pub fn bond(&self, from: &mut dyn Action, to: &mut dyn Action) {
        from.set_out_pipe(Some(self.clone()));
        to.set_in_pipe(Some(self.clone()));
    }

    /// Allocate a fresh pipe and bond `from` to `to` with it.
    pub fn bond_new(from: &mut dyn Action, to: &mut dyn Action) -> ActionPipe {
        let pipe = ActionPipe::new();
        pipe.bond(from, to);
        pipe
    }

    pub fn update_infos(&self) -> Option<Vec<UpdateInfo>> {
        match self.contents()? {
            PipeValue::UpdateInfos(infos) => Some(infos),
            PipeValue::CheckResults(results) => Some(results.update_infos),
            _ => None,
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        match self.contents()? {
            PipeValue::Path(path) => Some(path),
            _ => None,
        }
    }

    pub fn return_code(&self) -> Option<i32> {
        match self.contents()? {
            PipeValue::ReturnCode(code) => Some(code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::testing::{journal, ScriptedAction};

    #[test]
    fn empty_until_set() {
        let pipe = ActionPipe::new();
        assert!(pipe.is_empty());
        pipe.set_contents(Some(PipeValue::Count(3)));
        assert_eq!(pipe.contents(), Some(PipeValue::Count(3)));
        pipe.set_contents(None);
        assert!(pipe.is_empty());
    }

    #[test]
    fn bond_connects_output_to_input() {
        let j = journal();
        let mut producer = ScriptedAction::ok("a", &j);
        let mut consumer = ScriptedAction::ok("b", &j);
        let pipe = ActionPipe::bond_new(&mut producer, &mut consumer);

        producer.out_pipe().set_contents(Some(PipeValue::ReturnCode(66)));
        assert_eq!(consumer.in_pipe().return_code(), Some(66));
        assert_eq!(pipe.return_code(), Some(66));
    }

    #[test]
    fn resetting_pipe_detaches_it() {
        let j = journal();
        let mut producer = ScriptedAction::ok("a", &j);
        let mut consumer = ScriptedAction::ok("b", &j);
        ActionPipe::bond_new(&mut producer, &mut consumer);

        consumer.set_in_pipe(None);
        producer.out_pipe().set_contents(Some(PipeValue::Count(1)));
        assert!(consumer.in_pipe().is_empty());
    }

    #[test]
    fn typed_accessors_reject_other_variants() {
        let pipe = ActionPipe::with_contents(PipeValue::Count(1));
        assert_eq!(pipe.path(), None);
        assert_eq!(pipe.update_infos(), None);
    }
}
