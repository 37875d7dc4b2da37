//! The decision stages after a check: prefetch, then prompt or silent
//! update.
//!
//! Each stage asks the engine delegate which of the available updates to act
//! on and runs one sub-action per selected update. Sub-action failures are
//! reported through the engine delegate and never fail the stage itself.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;

use crate::action::{
    Action, ActionContext, ActionId, ActionProcessor, MultiAction, PipeValue, Pipes,
    ProcessorDelegate,
};
use crate::command_runner::CommandRunner;
use crate::download::DownloadAction;
use crate::engine::EngineContext;
use crate::update::{download_path, UpdateAction};
use crate::update_info::UpdateInfo;

/// What distinguishes one decision stage from another.
pub trait MultiUpdatePolicy: Send + Sync + 'static {
    const NAME: &'static str;

    /// Ask the engine delegate which updates this stage should act on.
    fn select(engine: &EngineContext, available: Vec<UpdateInfo>) -> Vec<UpdateInfo>;

    fn build(
        engine: &Arc<EngineContext>,
        runner: &Arc<dyn CommandRunner>,
        info: UpdateInfo,
    ) -> Box<dyn Action>;

    /// The stage's output once its sub-actions have run.
    fn output(available: Vec<UpdateInfo>, enqueued: usize) -> PipeValue;
}

/// Downloads selected updates ahead of time and passes the full list on.
pub struct Prefetch;

/// Installs the updates the delegate allows without asking the user.
pub struct Silent;

/// Installs the updates the user agreed to.
pub struct Prompt;

impl MultiUpdatePolicy for Prefetch {
    const NAME: &'static str = "prefetch";

    fn select(engine: &EngineContext, available: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        engine.should_prefetch(available)
    }

    fn build(
        engine: &Arc<EngineContext>,
        _runner: &Arc<dyn CommandRunner>,
        info: UpdateInfo,
    ) -> Box<dyn Action> {
        let settings = engine.settings();
        Box::new(
            DownloadAction::new(
                info.codebase_url.clone(),
                info.size,
                info.hash.clone(),
                download_path(&settings.download_dir, &info),
                settings.fetcher.clone(),
            )
            .with_stats(engine.stats()),
        )
    }

    fn output(available: Vec<UpdateInfo>, _enqueued: usize) -> PipeValue {
        PipeValue::UpdateInfos(available)
    }
}

impl MultiUpdatePolicy for Silent {
    const NAME: &'static str = "silent update";

    fn select(engine: &EngineContext, available: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        engine.should_silently_update(available)
    }

    fn build(
        engine: &Arc<EngineContext>,
        runner: &Arc<dyn CommandRunner>,
        info: UpdateInfo,
    ) -> Box<dyn Action> {
        Box::new(UpdateAction::for_engine(info, engine, runner.clone()))
    }

    fn output(_available: Vec<UpdateInfo>, enqueued: usize) -> PipeValue {
        PipeValue::Count(enqueued)
    }
}

impl MultiUpdatePolicy for Prompt {
    const NAME: &'static str = "prompt update";

    fn select(engine: &EngineContext, available: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        engine.should_update(available)
    }

    fn build(
        engine: &Arc<EngineContext>,
        runner: &Arc<dyn CommandRunner>,
        info: UpdateInfo,
    ) -> Box<dyn Action> {
        Box::new(UpdateAction::for_engine(info, engine, runner.clone()))
    }

    fn output(_available: Vec<UpdateInfo>, enqueued: usize) -> PipeValue {
        PipeValue::Count(enqueued)
    }
}

pub type PrefetchAction = MultiUpdateAction<Prefetch>;
pub type SilentUpdateAction = MultiUpdateAction<Silent>;
pub type PromptAction = MultiUpdateAction<Prompt>;

/// Turns sub-processor events about [`UpdateAction`]s into engine delegate
/// callbacks.
struct UpdateForwarder {
    engine: Arc<EngineContext>,
    running: Mutex<HashMap<ActionId, UpdateInfo>>,
}

impl ProcessorDelegate for UpdateForwarder {
    fn starting_action(&self, _processor: &ActionProcessor, id: ActionId, action: &dyn Action) {
        let Some(update) = action.as_any().downcast_ref::<UpdateAction>() else {
            return;
        };
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, update.update_info().clone());
        self.engine.update_starting(update.update_info());
    }

    fn running_action(&self, _processor: &ActionProcessor, id: ActionId, progress: f32) {
        let info = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        if let Some(info) = info {
            self.engine.update_running(&info, progress);
        }
    }

    fn finished_action(
        &self,
        _processor: &ActionProcessor,
        id: ActionId,
        action: &dyn Action,
        successful: bool,
    ) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(update) = action.as_any().downcast_ref::<UpdateAction>() {
            self.engine
                .update_finished(update.update_info(), successful, update.wants_reboot());
        }
    }
}

pub struct MultiUpdateAction<P: MultiUpdatePolicy> {
    multi: MultiAction,
    engine: Arc<EngineContext>,
    _forwarder: Arc<UpdateForwarder>,
    _policy: PhantomData<fn() -> P>,
}

impl<P: MultiUpdatePolicy> MultiUpdateAction<P> {
    pub fn new(engine: Arc<EngineContext>) -> Self {
        let multi = MultiAction::new(P::NAME);
        let forwarder = Arc::new(UpdateForwarder {
            engine: engine.clone(),
            running: Mutex::new(HashMap::new()),
        });
        let weak: Weak<dyn ProcessorDelegate> = Arc::downgrade(&forwarder) as Weak<dyn ProcessorDelegate>;
        multi.sub_processor().set_delegate(Some(weak));
        Self {
            multi,
            engine,
            _forwarder: forwarder,
            _policy: PhantomData,
        }
    }

    pub fn subactions_processed(&self) -> usize {
        self.multi.subactions_processed()
    }
}

#[async_trait]
impl<P: MultiUpdatePolicy> Action for MultiUpdateAction<P> {
    fn name(&self) -> &str {
        self.multi.name()
    }

    fn pipes(&self) -> &Pipes {
        self.multi.pipes()
    }

    fn pipes_mut(&mut self) -> &mut Pipes {
        self.multi.pipes_mut()
    }

    async fn perform(&mut self, _cx: &ActionContext) -> bool {
        let available = self.in_pipe().update_infos().unwrap_or_default();
        let selected = if available.is_empty() {
            Vec::new()
        } else {
            P::select(&self.engine, available.clone())
        };
        tracing::info!(
            stage = P::NAME,
            available = available.len(),
            selected = selected.len(),
            "update stage"
        );

        let enqueued = selected.len();
        if enqueued > 0 {
            let runner = self.engine.command_runner();
            for info in selected {
                self.multi
                    .sub_processor()
                    .enqueue_action(P::build(&self.engine, &runner, info));
            }
            self.multi.run_sub_actions().await;
        }

        self.out_pipe()
            .set_contents(Some(P::output(available, enqueued)));
        true
    }

    fn terminate(&mut self) {
        self.multi.terminate();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
