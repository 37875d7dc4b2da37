use std::collections::BTreeMap;

/// Run-wide parameters handed to servers and stage actions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineParams {
    pub machine_id: Option<String>,
    pub user_guid: Option<String>,
    pub os_version: Option<String>,
    pub update_check_tag: Option<String>,
    /// Machine-wide install rather than per-user.
    pub is_machine: bool,
    /// The run was requested by a user, so updates may prompt.
    pub user_initiated: bool,
    pub identity: Option<String>,
    /// When non-empty, codebase hosts must equal or end in one of these.
    pub allowed_subdomains: Vec<String>,
    /// Per-product stats gathered from the delegate before a run, keyed by
    /// lowercased product id.
    pub product_stats: BTreeMap<String, BTreeMap<String, String>>,
    /// Per-product active-use info, keyed by lowercased product id.
    pub product_active_info: BTreeMap<String, BTreeMap<String, String>>,
    /// Opaque per-server cache, keyed by server URL.
    pub server_info: BTreeMap<String, BTreeMap<String, String>>,
}

impl EngineParams {
    /// True when `host` is acceptable under [`allowed_subdomains`](Self::allowed_subdomains).
    pub fn host_allowed(&self, host: &str) -> bool {
        if self.allowed_subdomains.is_empty() {
            return true;
        }
        let host = host.to_ascii_lowercase();
        self.allowed_subdomains.iter().any(|allowed| {
            let allowed = allowed.trim_start_matches('.').to_ascii_lowercase();
            host == allowed || host.ends_with(&format!(".{allowed}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_allows_everything() {
        assert!(EngineParams::default().host_allowed("anything.example"));
    }

    #[test]
    fn allow_list_matches_suffixes_on_label_boundaries() {
        let params = EngineParams {
            allowed_subdomains: vec![".example.com".into()],
            ..Default::default()
        };
        assert!(params.host_allowed("example.com"));
        assert!(params.host_allowed("DL.Example.com"));
        assert!(!params.host_allowed("badexample.com"));
        assert!(!params.host_allowed("example.org"));
    }
}
