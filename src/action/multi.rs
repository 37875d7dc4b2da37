//! Loosely coupled fan-out of independent sub-actions.

use std::any::Any;

use async_trait::async_trait;

use super::{Action, ActionContext, ActionProcessor, FinishedAction, Pipes};

/// Runs a variable set of sub-actions on a private processor. One failing
/// sub-action never stops its siblings.
///
/// Used on its own it succeeds regardless of sub-action outcomes. Stage
/// actions embed it and compute their own success from
/// [`MultiAction::run_sub_actions`].
pub struct MultiAction {
    name: String,
    pipes: Pipes,
    sub: ActionProcessor,
    processed: usize,
}

impl MultiAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipes: Pipes::default(),
            sub: ActionProcessor::new(),
            processed: 0,
        }
    }

    pub fn with_actions(name: impl Into<String>, actions: Vec<Box<dyn Action>>) -> Self {
        let multi = Self::new(name);
        for action in actions {
            multi.sub.enqueue_action(action);
        }
        multi
    }

    pub fn sub_processor(&self) -> &ActionProcessor {
        &self.sub
    }

    pub fn subactions_processed(&self) -> usize {
        self.processed
    }

    /// Drain the sub-processor and hand back everything that finished.
    pub async fn run_sub_actions(&mut self) -> Vec<FinishedAction> {
        self.sub.start_processing().await;
        let finished = self.sub.take_finished();
        self.processed += finished.len();
        tracing::debug!(
            action = %self.name,
            processed = finished.len(),
            succeeded = finished.iter().filter(|f| f.successful).count(),
            "sub-actions processed"
        );
        finished
    }
}

#[async_trait]
impl Action for MultiAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn pipes(&self) -> &Pipes {
        &self.pipes
    }

    fn pipes_mut(&mut self) -> &mut Pipes {
        &mut self.pipes
    }

    async fn perform(&mut self, _cx: &ActionContext) -> bool {
        self.run_sub_actions().await;
        true
    }

    fn terminate(&mut self) {
        self.sub.stop_processing();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::testing::{entries, journal, ScriptedAction};

    #[tokio::test]
    async fn succeeds_despite_sub_failures() {
        let j = journal();
        let multi = MultiAction::with_actions(
            "fanout",
            vec![
                ScriptedAction::failing("a", &j).boxed(),
                ScriptedAction::ok("b", &j).boxed(),
                ScriptedAction::failing("c", &j).boxed(),
            ],
        );

        let processor = ActionProcessor::new();
        processor.enqueue_action(Box::new(multi));
        processor.start_processing().await;

        let finished = processor.take_finished();
        assert!(finished[0].successful);
        let multi = finished[0]
            .action
            .as_any()
            .downcast_ref::<MultiAction>()
            .unwrap();
        assert_eq!(multi.subactions_processed(), 3);
        assert_eq!(entries(&j), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn empty_multi_succeeds() {
        let processor = ActionProcessor::new();
        processor.enqueue_action(Box::new(MultiAction::new("nothing")));
        processor.start_processing().await;
        assert!(processor.take_finished()[0].successful);
    }
}
