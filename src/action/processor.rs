//! FIFO scheduler that runs one action at a time.
//!
//! `start_processing` drives the queue until it is empty: it pops the head,
//! awaits the action's `perform`, records the result, and moves on. Actions
//! enqueued while the processor runs (including by the running action
//! itself) are appended and run after everything already queued, so there
//! is a single total order of execution and never two actions at once.
//!
//! `stop_processing` may be called from anywhere, including a delegate
//! callback. The current action's `perform` future is dropped and the action
//! receives `terminate`; queued actions stay queued.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio_util::sync::CancellationToken;

use super::{Action, ActionContext, ActionId};

/// Observer of processor events. Every method defaults to a no-op.
///
/// Held weakly by the processor: whoever installs a delegate keeps it alive.
pub trait ProcessorDelegate: Send + Sync {
    fn processing_started(&self, _processor: &ActionProcessor) {}

    fn processing_done(&self, _processor: &ActionProcessor) {}

    fn processing_stopped(&self, _processor: &ActionProcessor) {}

    fn enqueued_action(&self, _processor: &ActionProcessor, _id: ActionId, _action: &dyn Action) {}

    fn starting_action(&self, _processor: &ActionProcessor, _id: ActionId, _action: &dyn Action) {}

    fn running_action(&self, _processor: &ActionProcessor, _id: ActionId, _progress: f32) {}

    fn finished_action(
        &self,
        _processor: &ActionProcessor,
        _id: ActionId,
        _action: &dyn Action,
        _successful: bool,
    ) {
    }
}

/// An action that ran to completion, kept until the owner collects it.
pub struct FinishedAction {
    pub id: ActionId,
    pub action: Box<dyn Action>,
    pub successful: bool,
}

struct Queued {
    id: ActionId,
    action: Box<dyn Action>,
}

/// The action currently being performed. Dropping it before completion,
/// either through `stop_processing` or because the processing future itself
/// was dropped by an outer processor, sends `terminate`.
struct Running {
    id: ActionId,
    action: Option<Box<dyn Action>>,
}

impl Drop for Running {
    fn drop(&mut self) {
        if let Some(action) = self.action.as_mut() {
            tracing::info!(action = action.name(), id = %self.id, "terminating action");
            action.terminate();
        }
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<Queued>,
    current: Option<ActionId>,
    processing: bool,
    completed: usize,
    enqueued: usize,
    next_id: u64,
    cancel: CancellationToken,
    finished: Vec<FinishedAction>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    delegate: Mutex<Option<Weak<dyn ProcessorDelegate>>>,
}

/// Cheap, cloneable handle to a processor. Clones refer to the same queue.
#[derive(Clone, Default)]
pub struct ActionProcessor {
    inner: Arc<Inner>,
}

impl ActionProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delegate(delegate: Weak<dyn ProcessorDelegate>) -> Self {
        let processor = Self::new();
        processor.set_delegate(Some(delegate));
        processor
    }

    pub fn set_delegate(&self, delegate: Option<Weak<dyn ProcessorDelegate>>) {
        *self
            .inner
            .delegate
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delegate;
    }

    pub fn delegate(&self) -> Option<Arc<dyn ProcessorDelegate>> {
        self.inner
            .delegate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, f: impl FnOnce(&dyn ProcessorDelegate)) {
        if let Some(delegate) = self.delegate() {
            f(delegate.as_ref());
        }
    }

    /// Append an action to the queue and take ownership of it.
    pub fn enqueue_action(&self, action: Box<dyn Action>) -> ActionId {
        let (id, processing) = {
            let mut st = self.state();
            st.next_id += 1;
            st.enqueued += 1;
            (ActionId(st.next_id), st.processing)
        };
        tracing::debug!(action = action.name(), %id, "enqueued action");
        if processing {
            self.notify(|d| d.enqueued_action(self, id, action.as_ref()));
        }
        self.state().queue.push_back(Queued { id, action });
        id
    }

    /// Names of the actions still waiting in the queue, in run order.
    pub fn actions(&self) -> Vec<String> {
        self.state()
            .queue
            .iter()
            .map(|q| q.action.name().to_string())
            .collect()
    }

    pub fn is_processing(&self) -> bool {
        self.state().processing
    }

    pub fn current_action(&self) -> Option<ActionId> {
        self.state().current
    }

    pub fn actions_completed(&self) -> usize {
        self.state().completed
    }

    /// Total number of actions ever enqueued on this processor.
    pub fn actions_enqueued(&self) -> usize {
        self.state().enqueued
    }

    /// Completed over enqueued, recomputed as more actions arrive.
    pub fn progress(&self) -> f32 {
        let st = self.state();
        if st.enqueued == 0 {
            0.0
        } else {
            st.completed as f32 / st.enqueued as f32
        }
    }

    /// Collect the actions that finished since the last call, in run order.
    pub fn take_finished(&self) -> Vec<FinishedAction> {
        std::mem::take(&mut self.state().finished)
    }

    /// Run queued actions until the queue is empty or processing is stopped.
    ///
    /// Returns immediately when the queue is empty or this processor is
    /// already processing.
    pub async fn start_processing(&self) {
        let token = {
            let mut st = self.state();
            if st.processing || st.queue.is_empty() {
                return;
            }
            st.processing = true;
            st.cancel = CancellationToken::new();
            st.cancel.clone()
        };
        tracing::debug!(queued = self.actions().len(), "processing started");
        self.notify(|d| d.processing_started(self));

        loop {
            let next = {
                let mut st = self.state();
                if !st.processing || token.is_cancelled() {
                    return;
                }
                let next = st.queue.pop_front();
                match &next {
                    Some(q) => st.current = Some(q.id),
                    None => st.processing = false,
                }
                next
            };

            let Some(Queued { id, mut action }) = next else {
                tracing::debug!(completed = self.actions_completed(), "processing done");
                self.notify(|d| d.processing_done(self));
                return;
            };

            tracing::debug!(action = action.name(), %id, "starting action");
            self.notify(|d| d.starting_action(self, id, action.as_ref()));

            let cx = ActionContext::new(self.clone(), id);
            let mut running = Running {
                id,
                action: Some(action),
            };
            let outcome = match running.action.as_deref_mut() {
                Some(action) => tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    ok = action.perform(&cx) => Some(ok),
                },
                None => None,
            };

            // Returning with the action still in `running` terminates it.
            let Some(successful) = outcome else {
                return;
            };
            let Some(action) = running.action.take() else {
                return;
            };
            self.finished_processing(id, action, successful);
        }
    }

    fn finished_processing(&self, id: ActionId, action: Box<dyn Action>, successful: bool) {
        {
            let mut st = self.state();
            st.completed += 1;
            if st.current == Some(id) {
                st.current = None;
            }
        }
        if successful {
            tracing::debug!(action = action.name(), %id, "action finished");
        } else {
            tracing::warn!(action = action.name(), %id, "action failed");
        }
        self.notify(|d| d.finished_action(self, id, action.as_ref(), successful));
        self.state().finished.push(FinishedAction {
            id,
            action,
            successful,
        });
    }

    /// Passthrough of an action's own progress report to the delegate.
    pub fn running_action(&self, id: ActionId, progress: f32) {
        self.notify(|d| d.running_action(self, id, progress));
    }

    /// Halt processing. The current action, if any, is terminated without
    /// a completion signal. Does nothing when idle.
    pub fn stop_processing(&self) {
        {
            let mut st = self.state();
            if !st.processing {
                return;
            }
            st.processing = false;
            st.current = None;
            st.cancel.cancel();
        }
        tracing::info!("processing stopped");
        self.notify(|d| d.processing_stopped(self));
    }
}
