//! Units of work and the scheduler that runs them.
//!
//! An [`Action`] reads its input from one [`ActionPipe`], does some
//! (possibly asynchronous) work, writes its result to another pipe, and
//! reports a single success flag when `perform` returns. Actions run one at
//! a time on an [`ActionProcessor`]; [`CompositeAction`] and [`MultiAction`]
//! nest a private processor to run sub-actions as a single unit.

pub mod composite;
pub mod multi;
pub mod pipe;
pub mod processor;

use std::any::Any;
use std::fmt;

use async_trait::async_trait;

pub use composite::CompositeAction;
pub use multi::MultiAction;
pub use pipe::{ActionPipe, PipeValue};
pub use processor::{ActionProcessor, FinishedAction, ProcessorDelegate};

/// Identity assigned to an action when a processor takes ownership of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub(crate) u64);

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The input and output pipes of one action.
#[derive(Debug, Clone, Default)]
pub struct Pipes {
    pub input: ActionPipe,
    pub output: ActionPipe,
}

/// A unit of work scheduled by an [`ActionProcessor`].
///
/// `perform` returns the completion signal: it resolves exactly once, on
/// every exit path, with `true` for success. Implementations must convert
/// collaborator errors into `false` instead of propagating them.
///
/// When the owning processor is stopped the `perform` future is dropped and
/// `terminate` is called. A terminated action has no completion signal.
#[async_trait]
pub trait Action: Send + 'static {
    fn name(&self) -> &str;

    fn pipes(&self) -> &Pipes;

    fn pipes_mut(&mut self) -> &mut Pipes;

    fn in_pipe(&self) -> &ActionPipe {
        &self.pipes().input
    }

    fn out_pipe(&self) -> &ActionPipe {
        &self.pipes().output
    }

    /// Passing `None` resets the input to a fresh empty pipe.
    fn set_in_pipe(&mut self, pipe: Option<ActionPipe>) {
        self.pipes_mut().input = pipe.unwrap_or_default();
    }

    /// Passing `None` resets the output to a fresh empty pipe.
    fn set_out_pipe(&mut self, pipe: Option<ActionPipe>) {
        self.pipes_mut().output = pipe.unwrap_or_default();
    }

    async fn perform(&mut self, cx: &ActionContext) -> bool;

    fn terminate(&mut self) {}

    fn as_any(&self) -> &dyn Any;
}

/// Handle given to a running action: who owns it and how to report progress.
#[derive(Clone)]
pub struct ActionContext {
    processor: ActionProcessor,
    id: ActionId,
}

impl ActionContext {
    pub(crate) fn new(processor: ActionProcessor, id: ActionId) -> Self {
        Self { processor, id }
    }

    /// The processor that owns this action for the current run.
    pub fn processor(&self) -> &ActionProcessor {
        &self.processor
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    /// True while this action is its processor's current action.
    pub fn is_running(&self) -> bool {
        self.processor.current_action() == Some(self.id)
    }

    /// Report fractional progress (0.0 to 1.0) to the processor's delegate.
    pub fn report_progress(&self, progress: f32) {
        self.processor.running_action(self.id, progress.clamp(0.0, 1.0));
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    /// Shared, ordered record of what test actions did.
    pub type Journal = Arc<Mutex<Vec<String>>>;

    pub fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    pub fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    /// Records its name when performed and completes with a fixed result.
    pub struct ScriptedAction {
        name: String,
        pipes: Pipes,
        succeed: bool,
        output: Option<PipeValue>,
        delay: Option<Duration>,
        journal: Journal,
    }

    impl ScriptedAction {
        pub fn ok(name: &str, journal: &Journal) -> Self {
            Self {
                name: name.into(),
                pipes: Pipes::default(),
                succeed: true,
                output: None,
                delay: None,
                journal: journal.clone(),
            }
        }

        pub fn failing(name: &str, journal: &Journal) -> Self {
            Self {
                succeed: false,
                ..Self::ok(name, journal)
            }
        }

        pub fn with_output(mut self, value: PipeValue) -> Self {
            self.output = Some(value);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn boxed(self) -> Box<dyn Action> {
            Box::new(self)
        }
    }

    #[async_trait]
    impl Action for ScriptedAction {
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
            assert!(cx.is_running());
            self.journal.lock().unwrap().push(self.name.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.output.is_some() {
                self.pipes.output.set_contents(self.output.clone());
            }
            self.succeed
        }

        fn terminate(&mut self) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("terminated {}", self.name));
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }
}
