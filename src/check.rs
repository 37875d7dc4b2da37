//! Update checks: one sub-check per distinct server URL.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::action::{Action, ActionContext, MultiAction, PipeValue, Pipes};
use crate::engine::EngineContext;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::params::EngineParams;
use crate::server::{self, OobData, Server, ServerFactory};
use crate::stats::{self, StatKey};
use crate::ticket::{tickets_by_server_url, Ticket};
use crate::update_info::UpdateInfo;

/// Aggregated output of a check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckResults {
    pub update_infos: Vec<UpdateInfo>,
    /// Out-of-band data keyed by the server URL that sent it.
    pub out_of_band: BTreeMap<String, OobData>,
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

// ── Per-server sub-check ─────────────────────────────────

/// Asks one server about its tickets.
pub struct ServerCheckAction {
    name: String,
    pipes: Pipes,
    server: Box<dyn Server>,
    tickets: Vec<Ticket>,
    fetcher: Arc<dyn Fetcher>,
    results: CheckResults,
}

impl ServerCheckAction {
    pub fn new(server: Box<dyn Server>, tickets: Vec<Ticket>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            name: format!("check {}", server.url()),
            pipes: Pipes::default(),
            server,
            tickets,
            fetcher,
            results: CheckResults::default(),
        }
    }

    pub fn server_url(&self) -> &str {
        self.server.url()
    }

    pub fn tickets(&self) -> &[Ticket] {
        &self.tickets
    }

    /// What the server offered; empty until the check succeeds.
    pub fn results(&self) -> &CheckResults {
        &self.results
    }

    fn attach_ticket(&self, mut info: UpdateInfo) -> UpdateInfo {
        if info.ticket.is_none() {
            info.ticket = self
                .tickets
                .iter()
                .find(|t| t.product_id().eq_ignore_ascii_case(&info.product_id))
                .cloned();
        }
        info
    }
}

#[async_trait]
impl Action for ServerCheckAction {
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
        let requests = self.server.requests_for_tickets(&self.tickets);
        let total = requests.len();
        let mut results = CheckResults::default();

        for (i, request) in requests.iter().enumerate() {
            let response = match self.fetcher.fetch(request).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(url = %request.url, error = %e, "update check failed");
                    return false;
                }
            };
            let parsed = match self.server.update_infos_for_response(&response) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(url = %request.url, error = %e, "unusable server response");
                    return false;
                }
            };
            for info in parsed.update_infos {
                results.update_infos.push(self.attach_ticket(info));
            }
            if let Some(oob) = parsed.out_of_band {
                results
                    .out_of_band
                    .entry(self.server.url().to_string())
                    .or_default()
                    .extend(oob);
            }
            cx.report_progress((i + 1) as f32 / total as f32);
        }

        tracing::info!(
            server = %self.server.url(),
            tickets = self.tickets.len(),
            updates = results.update_infos.len(),
            "server check finished"
        );
        self.pipes
            .output
            .set_contents(Some(PipeValue::CheckResults(results.clone())));
        self.results = results;
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Fan-out check ────────────────────────────────────────

/// Checks every ticket's server. Succeeds when any server answered, or
/// when there was nothing to check.
///
/// Tickets come from the constructor or, failing that, the input pipe.
pub struct CheckAction {
    multi: MultiAction,
    tickets: Option<Vec<Ticket>>,
    params: EngineParams,
    engine: Option<Arc<EngineContext>>,
    factory: Option<Arc<dyn ServerFactory>>,
    fetcher: Option<Arc<dyn Fetcher>>,
}

impl CheckAction {
    pub fn new(
        tickets: Option<Vec<Ticket>>,
        params: EngineParams,
        engine: Option<Arc<EngineContext>>,
    ) -> Self {
        Self {
            multi: MultiAction::new("check"),
            tickets,
            params,
            engine,
            factory: None,
            fetcher: None,
        }
    }

    pub fn with_server_factory(mut self, factory: Arc<dyn ServerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn subactions_processed(&self) -> usize {
        self.multi.subactions_processed()
    }

    fn input_tickets(&self) -> Vec<Ticket> {
        if let Some(tickets) = &self.tickets {
            return tickets.clone();
        }
        match self.in_pipe().contents() {
            Some(PipeValue::Tickets(tickets)) => tickets,
            _ => Vec::new(),
        }
    }

    fn server_factory(&self) -> Arc<dyn ServerFactory> {
        self.factory
            .clone()
            .or_else(|| self.engine.as_ref().and_then(|e| e.settings().server_factory.clone()))
            .unwrap_or_else(server::default_factory)
    }

    fn resolve_fetcher(&self) -> Option<Arc<dyn Fetcher>> {
        if let Some(fetcher) = &self.fetcher {
            return Some(fetcher.clone());
        }
        if let Some(engine) = &self.engine {
            return Some(engine.settings().fetcher.clone());
        }
        match HttpFetcher::new(DEFAULT_TIMEOUT) {
            Ok(fetcher) => Some(Arc::new(fetcher)),
            Err(e) => {
                tracing::warn!(error = %e, "no transport for update check");
                None
            }
        }
    }
}

#[async_trait]
impl Action for CheckAction {
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
        let tickets = self.input_tickets();
        if tickets.is_empty() {
            tracing::info!("no tickets to check");
            self.out_pipe()
                .set_contents(Some(PipeValue::CheckResults(CheckResults::default())));
            return true;
        }

        let Some(fetcher) = self.resolve_fetcher() else {
            return false;
        };
        let factory = self.server_factory();
        for (url, group) in tickets_by_server_url(&tickets) {
            let server = factory.create(&url, &self.params, self.engine.clone());
            self.multi
                .sub_processor()
                .enqueue_action(Box::new(ServerCheckAction::new(server, group, fetcher.clone())));
        }

        let mut results = CheckResults::default();
        let mut succeeded = 0usize;
        for finished in self.multi.run_sub_actions().await {
            if let Some(engine) = &self.engine {
                engine.record(StatKey::global(stats::CHECKS));
                if !finished.successful {
                    engine.record(StatKey::global(stats::FAILED_CHECKS));
                }
            }
            if !finished.successful {
                continue;
            }
            let Some(check) = finished.action.as_any().downcast_ref::<ServerCheckAction>() else {
                continue;
            };
            succeeded += 1;
            results
                .update_infos
                .extend(check.results().update_infos.iter().cloned());
            for (url, oob) in &check.results().out_of_band {
                results.out_of_band.entry(url.clone()).or_default().extend(oob.clone());
            }
        }

        if succeeded == 0 {
            tracing::warn!(servers = self.multi.subactions_processed(), "every update check failed");
            return false;
        }
        tracing::info!(
            servers = self.multi.subactions_processed(),
            succeeded,
            updates = results.update_infos.len(),
            "update check complete"
        );
        self.out_pipe().set_contents(Some(PipeValue::CheckResults(results)));
        true
    }

    fn terminate(&mut self) {
        self.multi.terminate();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
