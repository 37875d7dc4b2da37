//! A fixed, fail-fast sequence of actions performed as one.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;

use super::{Action, ActionContext, ActionId, ActionProcessor, Pipes, ProcessorDelegate};
use crate::error::EngineError;

/// Relays sub-processor events to the composite's owner.
#[derive(Default)]
struct SequenceObserver {
    outer: Mutex<Option<(ActionContext, usize)>>,
}

impl SequenceObserver {
    fn attach(&self, cx: &ActionContext, total: usize) {
        *self.outer.lock().unwrap_or_else(PoisonError::into_inner) = Some((cx.clone(), total));
    }

    fn detach(&self) {
        *self.outer.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn report(&self, sub: &ActionProcessor, partial: f32) {
        let outer = self
            .outer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some((cx, total)) = outer {
            let done = sub.actions_completed() as f32 + partial;
            cx.report_progress(done / total.max(1) as f32);
        }
    }
}

impl ProcessorDelegate for SequenceObserver {
    fn running_action(&self, processor: &ActionProcessor, _id: ActionId, progress: f32) {
        self.report(processor, progress);
    }

    fn finished_action(
        &self,
        processor: &ActionProcessor,
        id: ActionId,
        action: &dyn Action,
        successful: bool,
    ) {
        if successful {
            self.report(processor, 0.0);
        } else {
            tracing::debug!(action = action.name(), %id, "sub-action failed, abandoning sequence");
            processor.stop_processing();
        }
    }
}

/// Runs `[a1..an]` in order on a private processor. The first failure
/// abandons the rest and fails the composite.
pub struct CompositeAction {
    name: String,
    pipes: Pipes,
    names: Vec<String>,
    pending: Vec<Box<dyn Action>>,
    completed: Vec<Box<dyn Action>>,
    sub: ActionProcessor,
    observer: Arc<SequenceObserver>,
}

impl CompositeAction {
    pub fn new(name: impl Into<String>, actions: Vec<Box<dyn Action>>) -> Result<Self, EngineError> {
        let name = name.into();
        if actions.is_empty() {
            return Err(EngineError::Validation {
                message: format!("composite action '{name}' needs at least one sub-action"),
            });
        }
        Ok(Self::from_nonempty(name, actions))
    }

    pub(crate) fn from_nonempty(name: String, actions: Vec<Box<dyn Action>>) -> Self {
        let observer = Arc::new(SequenceObserver::default());
        let weak: Weak<dyn ProcessorDelegate> = Arc::downgrade(&observer) as Weak<dyn ProcessorDelegate>;
        Self {
            name,
            pipes: Pipes::default(),
            names: actions.iter().map(|a| a.name().to_string()).collect(),
            pending: actions,
            completed: Vec::new(),
            sub: ActionProcessor::with_delegate(weak),
            observer,
        }
    }

    /// Names of every sub-action, in run order.
    pub fn action_names(&self) -> &[String] {
        &self.names
    }

    /// The prefix of sub-actions that finished successfully.
    pub fn completed_actions(&self) -> &[Box<dyn Action>] {
        &self.completed
    }

    pub fn completed_successfully(&self) -> bool {
        self.completed.len() == self.names.len()
    }
}

#[async_trait]
impl Action for CompositeAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn pipes(&self) -> &Pipes {
        &self.pipes
    }

    fn pipes_mut(&mut self) -> &mut Pipes {
        &mut self.pipes
    }

    async fn perform(&mut self, cx: &ActionContext) -> bool {
        if self.pending.is_empty() {
            tracing::warn!(action = %self.name, "composite action has already run");
            return false;
        }

        self.observer.attach(cx, self.names.len());
        for action in self.pending.drain(..) {
            self.sub.enqueue_action(action);
        }
        self.sub.start_processing().await;
        self.observer.detach();

        for finished in self.sub.take_finished() {
            if !finished.successful {
                break;
            }
            self.completed.push(finished.action);
        }

        let ok = self.completed_successfully();
        if ok {
            let last = self.completed.last().and_then(|a| a.out_pipe().contents());
            self.pipes.output.set_contents(last);
        } else {
            tracing::debug!(
                action = %self.name,
                completed = self.completed.len(),
                total = self.names.len(),
                "composite action failed"
            );
        }
        ok
    }

    fn terminate(&mut self) {
        self.sub.stop_processing();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
