//! Top-level orchestration of an update run.
//!
//! A run builds the pipeline
//!
//! ```text
//! Check -> OutOfBandData -> Prefetch -> Prompt | Silent
//! ```
//!
//! bonds the stages with pipes and drives it on the engine's processor. The
//! last stage is `Prompt` for user-initiated runs and `Silent` otherwise.
//! Policy decisions and progress reporting go through [`EngineDelegate`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::action::{Action, ActionId, ActionPipe, ActionProcessor, ProcessorDelegate};
use crate::check::CheckAction;
use crate::command_runner::{CommandRunner, TaskCommandRunner};
use crate::disk_image;
use crate::error::EngineError;
use crate::fetch::Fetcher;
use crate::install::{InstallSettings, DEFAULT_SCRIPT_PREFIX};
use crate::multi_update::{PrefetchAction, PromptAction, SilentUpdateAction};
use crate::oob::OutOfBandDataAction;
use crate::params::EngineParams;
use crate::server::{OobData, ServerFactory};
use crate::stats::{self, StatKey, StatsCollection};
use crate::ticket::Ticket;
use crate::ticket_store::TicketStore;
use crate::update_info::UpdateInfo;

/// Policy and reporting hooks. Every hook is optional: the defaults do
/// nothing, report no stats, and approve every update.
pub trait EngineDelegate: Send + Sync {
    fn engine_started(&self, _engine: &EngineContext) {}

    /// Out-of-band data from the check, keyed by server URL. Only called
    /// when there is some.
    fn has_out_of_band_data(&self, _engine: &EngineContext, _data: &BTreeMap<String, OobData>) {}

    fn server_data(&self, _engine: &EngineContext, _product_id: &str, _key: &str, _value: &str) {}

    /// Usage stats to send to the server for this product.
    fn stats_for_product_id(
        &self,
        _engine: &EngineContext,
        _product_id: &str,
    ) -> Option<BTreeMap<String, String>> {
        None
    }

    fn should_prefetch_products(
        &self,
        _engine: &EngineContext,
        products: Vec<UpdateInfo>,
    ) -> Vec<UpdateInfo> {
        products
    }

    fn should_silently_update_products(
        &self,
        _engine: &EngineContext,
        products: Vec<UpdateInfo>,
    ) -> Vec<UpdateInfo> {
        products
    }

    /// Asked on user-initiated runs, typically by prompting.
    fn should_update_products(
        &self,
        _engine: &EngineContext,
        products: Vec<UpdateInfo>,
    ) -> Vec<UpdateInfo> {
        products
    }

    fn command_runner(&self, _engine: &EngineContext) -> Option<Arc<dyn CommandRunner>> {
        None
    }

    fn starting_update(&self, _engine: &EngineContext, _update: &UpdateInfo) {}

    fn running_update(&self, _engine: &EngineContext, _update: &UpdateInfo, _progress: f32) {}

    fn finished_update(
        &self,
        _engine: &EngineContext,
        _update: &UpdateInfo,
        _was_success: bool,
        _wants_reboot: bool,
    ) {
    }

    fn engine_finished(&self, _engine: &EngineContext, _was_success: bool) {}
}

/// Where payloads go, how they are fetched and installed, and which server
/// protocol checks speak.
#[derive(Clone)]
pub struct EngineSettings {
    pub download_dir: PathBuf,
    pub fetcher: Arc<dyn Fetcher>,
    pub install: InstallSettings,
    /// `None` uses [`crate::server::default_factory`].
    pub server_factory: Option<Arc<dyn ServerFactory>>,
}

impl EngineSettings {
    pub fn new(download_dir: impl Into<PathBuf>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            download_dir: download_dir.into(),
            fetcher,
            install: InstallSettings {
                script_prefix: DEFAULT_SCRIPT_PREFIX.into(),
                mounter: disk_image::default_mounter(),
                script_log_dir: None,
            },
            server_factory: None,
        }
    }
}

/// State shared by the engine and every action of its runs.
pub struct EngineContext {
    params: Mutex<EngineParams>,
    settings: EngineSettings,
    delegate: Option<Weak<dyn EngineDelegate>>,
    stats: Option<Arc<StatsCollection>>,
    was_successful: AtomicBool,
}

impl EngineContext {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            params: Mutex::new(EngineParams::default()),
            settings,
            delegate: None,
            stats: None,
            was_successful: AtomicBool::new(true),
        }
    }

    pub fn with_params(self, params: EngineParams) -> Self {
        *self.lock_params() = params;
        self
    }

    pub fn with_delegate(mut self, delegate: Weak<dyn EngineDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn with_stats(mut self, stats: Arc<StatsCollection>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn lock_params(&self) -> MutexGuard<'_, EngineParams> {
        self.params.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn params(&self) -> EngineParams {
        self.lock_params().clone()
    }

    /// Replace the parameters used by the next run.
    pub fn set_params(&self, params: EngineParams) {
        *self.lock_params() = params;
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn stats(&self) -> Option<Arc<StatsCollection>> {
        self.stats.clone()
    }

    pub(crate) fn record(&self, key: StatKey) {
        if let Some(stats) = &self.stats {
            stats.increment(key);
        }
    }

    /// Whether nothing has failed since the current (or last) run began.
    pub fn was_successful(&self) -> bool {
        self.was_successful.load(Ordering::SeqCst)
    }

    fn mark_failed(&self) {
        self.was_successful.store(false, Ordering::SeqCst);
    }

    pub fn delegate(&self) -> Option<Arc<dyn EngineDelegate>> {
        self.delegate.as_ref().and_then(Weak::upgrade)
    }

    // ── Delegate forwarding with pass-through defaults ───

    pub(crate) fn should_prefetch(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        match self.delegate() {
            Some(d) => d.should_prefetch_products(self, products),
            None => products,
        }
    }

    pub(crate) fn should_silently_update(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        match self.delegate() {
            Some(d) => d.should_silently_update_products(self, products),
            None => products,
        }
    }

    pub(crate) fn should_update(&self, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
        match self.delegate() {
            Some(d) => d.should_update_products(self, products),
            None => products,
        }
    }

    pub(crate) fn command_runner(&self) -> Arc<dyn CommandRunner> {
        self.delegate()
            .and_then(|d| d.command_runner(self))
            .unwrap_or_else(|| Arc::new(TaskCommandRunner))
    }

    pub(crate) fn out_of_band_data(&self, data: &BTreeMap<String, OobData>) {
        if let Some(d) = self.delegate() {
            d.has_out_of_band_data(self, data);
        }
    }

    pub(crate) fn server_data(&self, product_id: &str, key: &str, value: &str) {
        if let Some(d) = self.delegate() {
            d.server_data(self, product_id, key, value);
        }
    }

    pub(crate) fn update_starting(&self, update: &UpdateInfo) {
        tracing::info!(product_id = %update.product_id, "starting update");
        if let Some(d) = self.delegate() {
            d.starting_update(self, update);
        }
    }

    pub(crate) fn update_running(&self, update: &UpdateInfo, progress: f32) {
        if let Some(d) = self.delegate() {
            d.running_update(self, update, progress);
        }
    }

    pub(crate) fn update_finished(&self, update: &UpdateInfo, successful: bool, wants_reboot: bool) {
        if successful {
            tracing::info!(product_id = %update.product_id, wants_reboot, "update finished");
        } else {
            tracing::warn!(product_id = %update.product_id, "update failed");
            self.mark_failed();
        }
        if let Some(d) = self.delegate() {
            d.finished_update(self, update, successful, wants_reboot);
        }
    }
}

/// Watches the top-level processor on behalf of the engine.
struct RunObserver {
    context: Arc<EngineContext>,
}

impl ProcessorDelegate for RunObserver {
    fn processing_started(&self, _processor: &ActionProcessor) {
        if let Some(d) = self.context.delegate() {
            d.engine_started(&self.context);
        }
    }

    fn finished_action(
        &self,
        _processor: &ActionProcessor,
        id: ActionId,
        action: &dyn Action,
        successful: bool,
    ) {
        if !successful {
            tracing::warn!(stage = action.name(), %id, "pipeline stage failed");
            self.context.mark_failed();
        }
    }

    fn processing_done(&self, _processor: &ActionProcessor) {
        let success = self.context.was_successful();
        tracing::info!(success, "update run finished");
        if let Some(d) = self.context.delegate() {
            d.engine_finished(&self.context, success);
        }
    }

    fn processing_stopped(&self, _processor: &ActionProcessor) {
        tracing::info!("update run stopped");
        self.context.mark_failed();
        if let Some(d) = self.context.delegate() {
            d.engine_finished(&self.context, false);
        }
    }
}

/// Owns the ticket store and the processor that runs update pipelines.
/// At most one run is active at a time.
pub struct Engine {
    context: Arc<EngineContext>,
    store: Arc<dyn TicketStore>,
    processor: Mutex<ActionProcessor>,
    observer: Arc<RunObserver>,
    running: AtomicBool,
}

/// Held for the whole of a run, awaits included. Clears the flag on drop.
struct RunClaim<'a>(&'a AtomicBool);

impl<'a> RunClaim<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunClaim(flag))
    }
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Engine {
    pub fn new(store: Arc<dyn TicketStore>, context: EngineContext) -> Self {
        let context = Arc::new(context);
        let observer = Arc::new(RunObserver {
            context: context.clone(),
        });
        let processor = Self::new_processor(&observer);
        Self {
            context,
            store,
            processor: Mutex::new(processor),
            observer,
            running: AtomicBool::new(false),
        }
    }

    fn new_processor(observer: &Arc<RunObserver>) -> ActionProcessor {
        let weak: Weak<dyn ProcessorDelegate> = Arc::downgrade(observer) as Weak<dyn ProcessorDelegate>;
        ActionProcessor::with_delegate(weak)
    }

    fn processor(&self) -> ActionProcessor {
        self.processor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn store(&self) -> &Arc<dyn TicketStore> {
        &self.store
    }

    pub fn is_updating(&self) -> bool {
        self.running.load(Ordering::SeqCst) || self.processor().is_processing()
    }

    /// Check and update every installed product. Returns when the run
    /// finishes or is stopped; ignored while another run is active.
    pub async fn update_all_products(&self) -> Result<(), EngineError> {
        let tickets = self.store.tickets()?;
        self.run(tickets).await
    }

    /// Check and update one product.
    pub async fn update_product_with_product_id(&self, product_id: &str) -> Result<(), EngineError> {
        let ticket = self
            .store
            .ticket_for_product_id(product_id)?
            .ok_or_else(|| EngineError::TicketNotFound {
                product_id: product_id.to_string(),
            })?;
        self.run(vec![ticket]).await
    }

    /// Stop the active run, if any, and start over with an empty processor.
    pub fn stop_and_reset(&self) {
        let old = {
            let mut processor = self.processor.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *processor, Self::new_processor(&self.observer))
        };
        old.stop_processing();
    }

    async fn installed(tickets: Vec<Ticket>) -> Vec<Ticket> {
        let mut valid = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            if ticket.existence_checker().exists().await {
                valid.push(ticket);
            } else {
                tracing::info!(product_id = ticket.product_id(), "product not installed, skipping");
            }
        }
        valid
    }

    /// Existence checks and ticket file reads, done once before the pipeline
    /// starts.
    async fn resolve(tickets: Vec<Ticket>) -> Result<Vec<Ticket>, EngineError> {
        let tickets = Self::installed(tickets).await;
        tokio::task::spawn_blocking(move || tickets.iter().map(Ticket::resolved).collect::<Vec<_>>())
            .await
            .map_err(|source| EngineError::Task {
                context: "reading ticket files".into(),
                source,
            })
    }

    async fn run(&self, tickets: Vec<Ticket>) -> Result<(), EngineError> {
        let claim = RunClaim::acquire(&self.running).filter(|_| !self.processor().is_processing());
        let Some(_claim) = claim else {
            tracing::warn!("update already in progress, ignoring request");
            return Ok(());
        };
        let context = &self.context;
        context.was_successful.store(true, Ordering::SeqCst);

        if let Some(counters) = context.stats() {
            counters.set(StatKey::global(stats::TICKETS), tickets.len() as i64);
        }
        let tickets = Self::resolve(tickets).await?;
        if let Some(counters) = context.stats() {
            counters.set(StatKey::global(stats::VALID_TICKETS), tickets.len() as i64);
        }

        let mut params = context.params();
        if let Some(delegate) = context.delegate() {
            for ticket in &tickets {
                if let Some(product_stats) = delegate.stats_for_product_id(context, ticket.product_id()) {
                    params.product_stats.insert(ticket.key(), product_stats);
                }
            }
        }
        context.set_params(params.clone());
        tracing::info!(tickets = tickets.len(), user_initiated = params.user_initiated, "starting update run");

        let mut stages: Vec<Box<dyn Action>> = vec![
            Box::new(CheckAction::new(Some(tickets), params.clone(), Some(context.clone()))),
            Box::new(OutOfBandDataAction::new(context.clone())),
            Box::new(PrefetchAction::new(context.clone())),
        ];
        if params.user_initiated {
            stages.push(Box::new(PromptAction::new(context.clone())));
        } else {
            stages.push(Box::new(SilentUpdateAction::new(context.clone())));
        }
        for i in 1..stages.len() {
            let (head, tail) = stages.split_at_mut(i);
            ActionPipe::bond_new(&mut *head[i - 1], &mut *tail[0]);
        }

        let processor = self.processor();
        for stage in stages {
            processor.enqueue_action(stage);
        }
        processor.start_processing().await;
        // Stage boxes are only needed for their completion signal.
        processor.take_finished();

        if let Some(counters) = context.stats() {
            if let Err(e) = counters.synchronize() {
                tracing::warn!(error = %e, "failed to save stats");
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use base64::Engine as _;
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::disk_image::DiskImageMounter;
    use crate::fetch::testing::FakeFetcher;
    use crate::install::testing::script;
    use crate::server::ManifestServerFactory;
    use crate::ticket::ExistenceChecker;
    use crate::ticket_store::MemoryTicketStore;

    const MANIFEST_URL: &str = "https://updates.example.com/manifest.json";
    const PAYLOAD_URL: &str = "https://dl.example.com/app-2.0.dmg";
    const PAYLOAD: &[u8] = b"disk image bytes";

    /// Every image "mounts" at the same directory of test scripts.
    struct FixedMounter(PathBuf);

    impl DiskImageMounter for FixedMounter {
        fn mount(&self, _image: &Path) -> Result<PathBuf, EngineError> {
            Ok(self.0.clone())
        }

        fn unmount(&self, _mount_point: &Path) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        decline_silent: bool,
    }

    impl Recorder {
        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EngineDelegate for Recorder {
        fn engine_started(&self, _: &EngineContext) {
            self.push("started");
        }

        fn has_out_of_band_data(&self, _: &EngineContext, data: &BTreeMap<String, OobData>) {
            self.push(format!("oob {}", data.len()));
        }

        fn server_data(&self, _: &EngineContext, product_id: &str, key: &str, value: &str) {
            self.push(format!("server data {product_id} {key}={value}"));
        }

        fn stats_for_product_id(&self, _: &EngineContext, product_id: &str) -> Option<BTreeMap<String, String>> {
            let mut stats = BTreeMap::new();
            stats.insert("launches".to_string(), format!("{}-3", product_id.len()));
            Some(stats)
        }

        fn should_prefetch_products(&self, _: &EngineContext, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
            self.push(format!("prefetch? {}", products.len()));
            products
        }

        fn should_silently_update_products(&self, _: &EngineContext, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
            self.push(format!("silent? {}", products.len()));
            if self.decline_silent { Vec::new() } else { products }
        }

        fn should_update_products(&self, _: &EngineContext, products: Vec<UpdateInfo>) -> Vec<UpdateInfo> {
            self.push(format!("prompt? {}", products.len()));
            products
        }

        fn starting_update(&self, _: &EngineContext, update: &UpdateInfo) {
            self.push(format!("starting {}", update.product_id));
        }

        fn finished_update(&self, _: &EngineContext, update: &UpdateInfo, ok: bool, reboot: bool) {
            self.push(format!("finished {} ok={ok} reboot={reboot}", update.product_id));
        }

        fn engine_finished(&self, _: &EngineContext, ok: bool) {
            self.push(format!("engine finished {ok}"));
        }
    }

    struct Harness {
        engine: Arc<Engine>,
        recorder: Arc<Recorder>,
        _scripts: tempfile::TempDir,
        _cache: tempfile::TempDir,
    }

    fn manifest() -> String {
        let hash = base64::engine::general_purpose::STANDARD.encode(Sha256::digest(PAYLOAD));
        format!(
            r#"{{
                "rules": [{{"product_id": "com.example.app", "version": "2.0",
                            "codebase": "{PAYLOAD_URL}", "hash": "{hash}", "size": {}}}],
                "server_data": {{"com.example.app": {{"channel": "stable"}}}},
                "out_of_band": {{"notice": "hi"}}
            }}"#,
            PAYLOAD.len()
        )
    }

    fn harness(install_body: &str, params: EngineParams, recorder: Recorder, fetcher: FakeFetcher) -> Harness {
        let tickets = vec![
            Ticket::new("com.example.app", "1.0", ExistenceChecker::AlwaysTrue, MANIFEST_URL),
            Ticket::new("com.example.gone", "1.0", ExistenceChecker::AlwaysFalse, MANIFEST_URL),
        ];
        harness_with(install_body, params, recorder, Arc::new(fetcher), tickets)
    }

    fn harness_with(
        install_body: &str,
        params: EngineParams,
        recorder: Recorder,
        fetcher: Arc<FakeFetcher>,
        tickets: Vec<Ticket>,
    ) -> Harness {
        let scripts = tempfile::tempdir().unwrap();
        script(scripts.path(), ".engine_install", install_body);
        let cache = tempfile::tempdir().unwrap();

        let mut settings = EngineSettings::new(cache.path(), fetcher);
        settings.install.mounter = Arc::new(FixedMounter(scripts.path().to_path_buf()));
        settings.server_factory = Some(Arc::new(ManifestServerFactory));

        let store = Arc::new(MemoryTicketStore::with_tickets(tickets));

        let recorder = Arc::new(recorder);
        let weak: Weak<dyn EngineDelegate> = Arc::downgrade(&recorder) as Weak<dyn EngineDelegate>;
        let context = EngineContext::new(settings)
            .with_params(params)
            .with_delegate(weak)
            .with_stats(Arc::new(StatsCollection::in_memory()));
        Harness {
            engine: Arc::new(Engine::new(store, context)),
            recorder,
            _scripts: scripts,
            _cache: cache,
        }
    }

    fn serving_fetcher() -> FakeFetcher {
        FakeFetcher::new()
            .serve(MANIFEST_URL, manifest())
            .serve(PAYLOAD_URL, PAYLOAD.to_vec())
    }

    #[tokio::test]
    async fn silent_run_installs_and_reports() {
        let h = harness("exit 66", EngineParams::default(), Recorder::default(), serving_fetcher());

        h.engine.update_all_products().await.unwrap();

        assert_eq!(
            h.recorder.events(),
            vec![
                "started",
                "server data com.example.app channel=stable",
                "oob 1",
                "prefetch? 1",
                "silent? 1",
                "starting com.example.app",
                "finished com.example.app ok=true reboot=true",
                "engine finished true",
            ]
        );
        assert!(!h.engine.is_updating());
        assert!(h.engine.context().was_successful());

        let counters = h.engine.context().stats().unwrap();
        assert_eq!(counters.get(&StatKey::global(stats::TICKETS)), Some(2));
        assert_eq!(counters.get(&StatKey::global(stats::VALID_TICKETS)), Some(1));
        assert_eq!(
            counters.get(&StatKey::product("com.example.app", stats::INSTALL_RC)),
            Some(66)
        );
        // Prefetch downloaded, so the update itself hit the cache.
        assert_eq!(counters.get(&StatKey::global(stats::DOWNLOAD_CACHE_HITS)), Some(1));

        let params = h.engine.context().params();
        assert!(params.product_stats.contains_key("com.example.app"));
        assert!(!params.product_stats.contains_key("com.example.gone"));
    }

    #[tokio::test]
    async fn user_initiated_run_asks_to_update() {
        let params = EngineParams {
            user_initiated: true,
            ..Default::default()
        };
        let h = harness("exit 0", params, Recorder::default(), serving_fetcher());

        h.engine.update_all_products().await.unwrap();

        let events = h.recorder.events();
        assert!(events.contains(&"prompt? 1".to_string()));
        assert!(!events.iter().any(|e| e.starts_with("silent?")));
        assert_eq!(events.last().unwrap(), "engine finished true");
    }

    #[tokio::test]
    async fn declined_updates_install_nothing() {
        let recorder = Recorder {
            decline_silent: true,
            ..Default::default()
        };
        let h = harness("exit 0", EngineParams::default(), recorder, serving_fetcher());

        h.engine.update_all_products().await.unwrap();

        let events = h.recorder.events();
        assert!(!events.iter().any(|e| e.starts_with("starting")));
        assert_eq!(events.last().unwrap(), "engine finished true");
    }

    #[tokio::test]
    async fn failed_install_fails_the_run() {
        let h = harness("exit 5", EngineParams::default(), Recorder::default(), serving_fetcher());

        h.engine.update_all_products().await.unwrap();

        let events = h.recorder.events();
        assert!(events.contains(&"finished com.example.app ok=false reboot=false".to_string()));
        assert_eq!(events.last().unwrap(), "engine finished false");
        assert!(!h.engine.context().was_successful());
    }

    #[tokio::test]
    async fn unreachable_server_fails_the_run() {
        let h = harness("exit 0", EngineParams::default(), Recorder::default(), FakeFetcher::new());

        h.engine.update_all_products().await.unwrap();

        assert_eq!(h.recorder.events().last().unwrap(), "engine finished false");
    }

    #[tokio::test]
    async fn single_product_runs_need_a_ticket() {
        let h = harness("exit 0", EngineParams::default(), Recorder::default(), serving_fetcher());

        let err = h.engine.update_product_with_product_id("com.example.nope").await.unwrap_err();
        assert!(matches!(err, EngineError::TicketNotFound { .. }));

        h.engine.update_product_with_product_id("COM.EXAMPLE.APP").await.unwrap();
        assert_eq!(h.recorder.events().last().unwrap(), "engine finished true");
    }

    #[tokio::test]
    async fn stop_and_reset_when_idle_is_a_noop() {
        let h = harness("exit 0", EngineParams::default(), Recorder::default(), serving_fetcher());
        h.engine.stop_and_reset();
        h.engine.stop_and_reset();
        assert!(!h.engine.is_updating());
        assert!(h.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn stop_and_reset_aborts_an_active_run() {
        let h = harness("sleep 30", EngineParams::default(), Recorder::default(), serving_fetcher());

        let engine = h.engine.clone();
        let run = tokio::spawn(async move { engine.update_all_products().await });
        while !h.recorder.events().iter().any(|e| e.starts_with("starting")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.engine.is_updating());

        // A second request while running is ignored.
        h.engine.update_all_products().await.unwrap();

        h.engine.stop_and_reset();
        run.await.unwrap().unwrap();

        assert!(!h.engine.is_updating());
        assert_eq!(h.recorder.events().last().unwrap(), "engine finished false");
    }

    #[tokio::test]
    async fn concurrent_run_requests_install_once() {
        let installed = tempfile::tempdir().unwrap();
        let tickets = vec![Ticket::new(
            "com.example.app",
            "1.0",
            ExistenceChecker::Path(installed.path().to_path_buf()),
            MANIFEST_URL,
        )];
        let h = harness_with("exit 0", EngineParams::default(), Recorder::default(), Arc::new(serving_fetcher()), tickets);

        let (first, second) = tokio::join!(h.engine.update_all_products(), h.engine.update_all_products());
        first.unwrap();
        second.unwrap();

        let events = h.recorder.events();
        let count = |wanted: &str| events.iter().filter(|e| *e == wanted).count();
        assert_eq!(count("starting com.example.app"), 1, "{events:?}");
        assert_eq!(count("engine finished true"), 1, "{events:?}");
        assert!(!h.engine.is_updating());

        // The claim is released, so a later request runs normally.
        h.engine.update_all_products().await.unwrap();
        assert_eq!(h.recorder.events().iter().filter(|e| *e == "engine finished true").count(), 2);
    }

    #[tokio::test]
    async fn ticket_files_are_read_before_the_check() {
        let installed = tempfile::tempdir().unwrap();
        let info = installed.path().join("info.json");
        std::fs::write(&info, r#"{"CFBundleVersion": "2.0"}"#).unwrap();
        let tickets = vec![Ticket::new(
            "com.example.app",
            "1.0",
            ExistenceChecker::Path(installed.path().to_path_buf()),
            MANIFEST_URL,
        )
        .with_version_path(&info, "CFBundleVersion")];
        let h = harness_with("exit 0", EngineParams::default(), Recorder::default(), Arc::new(serving_fetcher()), tickets);

        h.engine.update_all_products().await.unwrap();

        // The file says 2.0 is already installed, so nothing updates.
        let events = h.recorder.events();
        assert!(!events.iter().any(|e| e.starts_with("starting")), "{events:?}");
        assert_eq!(events.last().unwrap(), "engine finished true");
    }

    #[tokio::test]
    async fn delegate_stats_and_params_reach_the_server() {
        let params = EngineParams {
            os_version: Some("14.2".into()),
            ..Default::default()
        };
        let fetcher = Arc::new(serving_fetcher());
        let tickets = vec![Ticket::new("com.example.app", "1.0", ExistenceChecker::AlwaysTrue, MANIFEST_URL)
            .with_tag("beta")];
        let h = harness_with("exit 0", params, Recorder::default(), fetcher.clone(), tickets);

        h.engine.update_all_products().await.unwrap();

        let posted = fetcher.posted();
        assert_eq!(posted.len(), 1, "{posted:?}");
        // "com.example.app" is 15 characters long.
        assert!(posted[0].contains("15-3"), "{}", posted[0]);
        assert!(posted[0].contains("14.2"), "{}", posted[0]);
        assert!(posted[0].contains("beta"), "{}", posted[0]);
    }
}
