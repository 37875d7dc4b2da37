//! Update-server protocol seam.
//!
//! A [`Server`] turns tickets into requests and responses into
//! [`UpdateInfo`]s. Which implementation a check uses comes from the
//! [`ServerFactory`] in the engine settings, falling back to the
//! process-wide default (a [`ManifestServerFactory`] unless replaced).

pub mod manifest;

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use crate::engine::EngineContext;
use crate::error::EngineError;
use crate::fetch::{FetchRequest, FetchResponse};
use crate::params::EngineParams;
use crate::ticket::Ticket;
use crate::update_info::UpdateInfo;

pub use manifest::{ManifestServer, ManifestServerFactory};

/// Server-supplied metadata not tied to any one update.
pub type OobData = BTreeMap<String, String>;

/// What one server response yielded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerResults {
    pub update_infos: Vec<UpdateInfo>,
    pub out_of_band: Option<OobData>,
}

pub trait Server: Send + Sync {
    fn url(&self) -> &str;

    /// Requests covering `tickets`. The server remembers the tickets so it
    /// can interpret the responses.
    fn requests_for_tickets(&mut self, tickets: &[Ticket]) -> Vec<FetchRequest>;

    fn update_infos_for_response(
        &self,
        response: &FetchResponse,
    ) -> Result<ServerResults, EngineError>;
}

pub trait ServerFactory: Send + Sync {
    fn create(
        &self,
        url: &str,
        params: &EngineParams,
        engine: Option<Arc<EngineContext>>,
    ) -> Box<dyn Server>;
}

impl<F> ServerFactory for F
where
    F: Fn(&str, &EngineParams, Option<Arc<EngineContext>>) -> Box<dyn Server> + Send + Sync,
{
    fn create(
        &self,
        url: &str,
        params: &EngineParams,
        engine: Option<Arc<EngineContext>>,
    ) -> Box<dyn Server> {
        self(url, params, engine)
    }
}

static DEFAULT_FACTORY: LazyLock<RwLock<Option<Arc<dyn ServerFactory>>>> =
    LazyLock::new(|| RwLock::new(None));

/// The factory used when nothing more specific is configured.
pub fn default_factory() -> Arc<dyn ServerFactory> {
    DEFAULT_FACTORY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .unwrap_or_else(|| Arc::new(ManifestServerFactory))
}

/// Replace the process-wide default; `None` restores [`ManifestServerFactory`].
/// Set this before starting a run.
pub fn set_default_factory(factory: Option<Arc<dyn ServerFactory>>) {
    *DEFAULT_FACTORY
        .write()
        .unwrap_or_else(PoisonError::into_inner) = factory;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Answers every response with a fixed result. Requests go to the
    /// server URL itself.
    pub struct CannedServer {
        url: String,
        results: Result<ServerResults, String>,
    }

    impl CannedServer {
        pub fn boxed(url: &str, results: Result<ServerResults, String>) -> Box<dyn Server> {
            Box::new(Self {
                url: url.to_string(),
                results,
            })
        }
    }

    impl Server for CannedServer {
        fn url(&self) -> &str {
            &self.url
        }

        fn requests_for_tickets(&mut self, _tickets: &[Ticket]) -> Vec<FetchRequest> {
            vec![FetchRequest::get(&self.url)]
        }

        fn update_infos_for_response(
            &self,
            _response: &FetchResponse,
        ) -> Result<ServerResults, EngineError> {
            self.results.clone().map_err(|message| EngineError::ServerResponse {
                url: self.url.clone(),
                message,
            })
        }
    }
}
