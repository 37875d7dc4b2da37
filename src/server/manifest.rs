//! JSON manifest server: the server URL names a document of update rules.
//!
//! The check is a POST of the run parameters and one record per ticket:
//!
//! ```json
//! {
//!   "machine_id": "m-1", "user_guid": null, "os_version": "14.2",
//!   "identity": null, "is_machine": false, "update_check_tag": null,
//!   "server_info": {},
//!   "tickets": [
//!     { "product_id": "com.example.app", "version": "1.0", "tag": "beta",
//!       "brand": null, "trusted_tester_token": null,
//!       "stats": { "launches": "12" }, "active": {} }
//!   ]
//! }
//! ```
//!
//! and the response is the manifest:
//!
//! ```json
//! {
//!   "rules": [
//!     { "product_id": "com.example.app", "version": "2.0",
//!       "codebase": "https://dl.example.com/app-2.0.dmg",
//!       "hash": "<base64 sha256>", "size": 1234 }
//!   ],
//!   "server_data": { "com.example.app": { "channel": "stable" } },
//!   "out_of_band": { "message": "maintenance window tonight" }
//! }
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use facet::Facet;

use super::{OobData, Server, ServerFactory, ServerResults};
use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::fetch::{FetchRequest, FetchResponse};
use crate::params::EngineParams;
use crate::ticket::Ticket;
use crate::update_info::UpdateInfo;

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct Manifest {
    #[facet(default)]
    rules: Vec<Rule>,
    #[facet(default)]
    server_data: BTreeMap<String, BTreeMap<String, String>>,
    out_of_band: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct Rule {
    product_id: String,
    #[facet(default)]
    version: String,
    codebase: String,
    #[facet(default)]
    hash: String,
    #[facet(default)]
    size: u64,
    more_info_url: Option<String>,
    display_version: Option<String>,
    localization_bundle: Option<String>,
    #[facet(default)]
    prompt: bool,
    #[facet(default)]
    requires_reboot: bool,
    #[facet(default)]
    extra: BTreeMap<String, String>,
}

#[derive(Debug, Facet)]
struct CheckRequest {
    machine_id: Option<String>,
    user_guid: Option<String>,
    os_version: Option<String>,
    identity: Option<String>,
    is_machine: bool,
    update_check_tag: Option<String>,
    server_info: BTreeMap<String, String>,
    tickets: Vec<TicketRecord>,
}

#[derive(Debug, Facet)]
struct TicketRecord {
    product_id: String,
    version: String,
    tag: Option<String>,
    brand: Option<String>,
    trusted_tester_token: Option<String>,
    stats: BTreeMap<String, String>,
    active: BTreeMap<String, String>,
}

/// Compare dotted versions numerically; missing or non-numeric components
/// count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .split('.')
            .map(|part| part.trim().parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn host_of(url: &str) -> Option<&str> {
    let rest = url.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = authority.rsplit('@').next()?;
    let host = host.split(':').next()?;
    Some(host).filter(|h| !h.is_empty())
}

pub struct ManifestServer {
    url: String,
    params: EngineParams,
    engine: Option<Arc<EngineContext>>,
    tickets: Vec<Ticket>,
}

impl ManifestServer {
    pub fn new(url: impl Into<String>, params: EngineParams, engine: Option<Arc<EngineContext>>) -> Self {
        Self {
            url: url.into(),
            params,
            engine,
            tickets: Vec::new(),
        }
    }

    fn ticket_for(&self, product_id: &str) -> Option<&Ticket> {
        self.tickets
            .iter()
            .find(|t| t.product_id().eq_ignore_ascii_case(product_id))
    }

    fn check_request(&self, tickets: &[Ticket]) -> CheckRequest {
        let params = &self.params;
        let per_product = |map: &BTreeMap<String, BTreeMap<String, String>>, ticket: &Ticket| {
            map.get(&ticket.key()).cloned().unwrap_or_default()
        };
        CheckRequest {
            machine_id: params.machine_id.clone(),
            user_guid: params.user_guid.clone(),
            os_version: params.os_version.clone(),
            identity: params.identity.clone(),
            is_machine: params.is_machine,
            update_check_tag: params.update_check_tag.clone(),
            server_info: params.server_info.get(&self.url).cloned().unwrap_or_default(),
            tickets: tickets
                .iter()
                .map(|ticket| TicketRecord {
                    product_id: ticket.product_id().to_string(),
                    version: ticket.determine_version(),
                    tag: ticket.determine_tag(),
                    brand: ticket.determine_brand(),
                    trusted_tester_token: ticket.trusted_tester_token().map(str::to_string),
                    stats: per_product(&params.product_stats, ticket),
                    active: per_product(&params.product_active_info, ticket),
                })
                .collect(),
        }
    }

    fn codebase_allowed(&self, codebase: &str) -> bool {
        if codebase.starts_with("file://") {
            return self.params.allowed_subdomains.is_empty();
        }
        host_of(codebase).is_some_and(|host| self.params.host_allowed(host))
    }
}

impl Server for ManifestServer {
    fn url(&self) -> &str {
        &self.url
    }

    fn requests_for_tickets(&mut self, tickets: &[Ticket]) -> Vec<FetchRequest> {
        self.tickets = tickets.to_vec();
        if tickets.is_empty() {
            return Vec::new();
        }
        let mut request = match facet_json::to_string(&self.check_request(tickets)) {
            Ok(body) => {
                let mut request = FetchRequest::post(&self.url, body);
                request
                    .headers
                    .push(("Content-Type".into(), "application/json".into()));
                request
            }
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "could not encode check request, sending a bare GET");
                FetchRequest::get(&self.url)
            }
        };
        if let Some(tag) = &self.params.update_check_tag {
            request.headers.push(("X-Update-Check-Tag".into(), tag.clone()));
        }
        if let Some(machine_id) = &self.params.machine_id {
            request.headers.push(("X-Machine-Id".into(), machine_id.clone()));
        }
        vec![request]
    }

    fn update_infos_for_response(
        &self,
        response: &FetchResponse,
    ) -> Result<ServerResults, EngineError> {
        if !response.is_success() {
            return Err(EngineError::ServerResponse {
                url: response.url.clone(),
                message: format!("HTTP status {}", response.status),
            });
        }
        let text = std::str::from_utf8(&response.body).map_err(|e| EngineError::ServerResponse {
            url: response.url.clone(),
            message: e.to_string(),
        })?;
        let manifest: Manifest =
            facet_json::from_str(text).map_err(|e| EngineError::ServerResponse {
                url: response.url.clone(),
                message: e.to_string(),
            })?;

        if let Some(engine) = &self.engine {
            for (product_id, values) in &manifest.server_data {
                if self.ticket_for(product_id).is_none() {
                    continue;
                }
                for (key, value) in values {
                    engine.server_data(product_id, key, value);
                }
            }
        }

        let mut update_infos = Vec::new();
        for rule in manifest.rules {
            let Some(ticket) = self.ticket_for(&rule.product_id) else {
                continue;
            };
            let installed = ticket.determine_version();
            if compare_versions(&installed, &rule.version) != Ordering::Less {
                tracing::debug!(
                    product_id = %rule.product_id,
                    installed = %installed,
                    offered = %rule.version,
                    "product is up to date"
                );
                continue;
            }
            if !self.codebase_allowed(&rule.codebase) {
                tracing::warn!(
                    product_id = %rule.product_id,
                    codebase = %rule.codebase,
                    "codebase host not in allowed subdomains, ignoring rule"
                );
                continue;
            }
            update_infos.push(UpdateInfo {
                product_id: ticket.product_id().to_string(),
                codebase_url: rule.codebase,
                size: rule.size,
                hash: rule.hash,
                more_info_url: rule.more_info_url,
                prompt_user: rule.prompt,
                requires_reboot: rule.requires_reboot,
                display_version: rule.display_version,
                version: Some(rule.version).filter(|v| !v.is_empty()),
                localization_bundle: rule.localization_bundle,
                extra: rule.extra,
                ticket: Some(ticket.clone()),
            });
        }

        let out_of_band: Option<OobData> = manifest.out_of_band.filter(|oob| !oob.is_empty());
        Ok(ServerResults {
            update_infos,
            out_of_band,
        })
    }
}

/// Builds a [`ManifestServer`] per server URL.
pub struct ManifestServerFactory;

impl ServerFactory for ManifestServerFactory {
    fn create(
        &self,
        url: &str,
        params: &EngineParams,
        engine: Option<Arc<EngineContext>>,
    ) -> Box<dyn Server> {
        Box::new(ManifestServer::new(url, params.clone(), engine))
    }
}
