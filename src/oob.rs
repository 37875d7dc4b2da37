use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::action::{Action, ActionContext, PipeValue, Pipes};
use crate::engine::EngineContext;

/// Hands a check's out-of-band data to the engine delegate and passes the
/// update list on to the next stage.
pub struct OutOfBandDataAction {
    pipes: Pipes,
    engine: Arc<EngineContext>,
}

impl OutOfBandDataAction {
    pub fn new(engine: Arc<EngineContext>) -> Self {
        Self {
            pipes: Pipes::default(),
            engine,
        }
    }
}

#[async_trait]
impl Action for OutOfBandDataAction {
    fn name(&self) -> &str {
        "out-of-band data"
    }

    fn pipes(&self) -> &Pipes {
        &self.pipes
    }

    fn pipes_mut(&mut self) -> &mut Pipes {
        &mut self.pipes
    }

    async fn perform(&mut self, _cx: &ActionContext) -> bool {
        let (infos, oob) = match self.pipes.input.contents() {
            Some(PipeValue::CheckResults(results)) => (results.update_infos, results.out_of_band),
            Some(PipeValue::UpdateInfos(infos)) => (infos, Default::default()),
            _ => (Vec::new(), Default::default()),
        };
        if !oob.is_empty() {
            tracing::debug!(servers = oob.len(), "forwarding out-of-band data");
            self.engine.out_of_band_data(&oob);
        }
        self.pipes
            .output
            .set_contents(Some(PipeValue::UpdateInfos(infos)));
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Mutex, Weak};

    use super::*;
    use crate::action::{ActionPipe, ActionProcessor};
    use crate::check::CheckResults;
    use crate::engine::{EngineDelegate, EngineSettings};
    use crate::fetch::testing::FakeFetcher;
    use crate::server::OobData;
    use crate::update_info::UpdateInfo;

    #[derive(Default)]
    struct Collector(Mutex<Vec<BTreeMap<String, OobData>>>);

    impl EngineDelegate for Collector {
        fn has_out_of_band_data(&self, _: &EngineContext, data: &BTreeMap<String, OobData>) {
            self.0.lock().unwrap().push(data.clone());
        }
    }

    async fn run(input: PipeValue) -> (Vec<BTreeMap<String, OobData>>, Option<PipeValue>) {
        let collector = Arc::new(Collector::default());
        let weak: Weak<dyn EngineDelegate> = Arc::downgrade(&collector) as Weak<dyn EngineDelegate>;
        let settings = EngineSettings::new("/tmp", Arc::new(FakeFetcher::new()));
        let engine = Arc::new(EngineContext::new(settings).with_delegate(weak));

        let mut action = OutOfBandDataAction::new(engine);
        action.set_in_pipe(Some(ActionPipe::with_contents(input)));
        let out = action.out_pipe().clone();
        let processor = ActionProcessor::new();
        processor.enqueue_action(Box::new(action));
        processor.start_processing().await;

        let seen = collector.0.lock().unwrap().clone();
        (seen, out.contents())
    }

    #[tokio::test]
    async fn forwards_oob_and_passes_updates_through() {
        let mut results = CheckResults::default();
        results.update_infos.push(UpdateInfo::new("app", "u", 1, "h"));
        let mut oob = OobData::new();
        oob.insert("notice".into(), "hi".into());
        results.out_of_band.insert("https://updates".into(), oob);

        let (seen, out) = run(PipeValue::CheckResults(results.clone())).await;
        assert_eq!(seen, vec![results.out_of_band]);
        assert_eq!(out, Some(PipeValue::UpdateInfos(results.update_infos)));
    }

    #[tokio::test]
    async fn empty_oob_is_not_reported() {
        let (seen, out) = run(PipeValue::CheckResults(CheckResults::default())).await;
        assert!(seen.is_empty());
        assert_eq!(out, Some(PipeValue::UpdateInfos(Vec::new())));
    }
}
