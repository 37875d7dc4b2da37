use std::collections::BTreeMap;

use crate::ticket::Ticket;

/// One available update as reported by a server, independent of the wire
/// format it arrived in. Lives for a single engine run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateInfo {
    pub product_id: String,
    pub codebase_url: String,
    pub size: u64,
    /// Base64 SHA-256 digest of the payload.
    pub hash: String,
    pub more_info_url: Option<String>,
    pub prompt_user: bool,
    pub requires_reboot: bool,
    pub display_version: Option<String>,
    pub version: Option<String>,
    pub localization_bundle: Option<String>,
    /// Server keys this engine does not interpret; exported to scripts.
    pub extra: BTreeMap<String, String>,
    pub ticket: Option<Ticket>,
}

impl UpdateInfo {
    pub fn new(
        product_id: impl Into<String>,
        codebase_url: impl Into<String>,
        size: u64,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            codebase_url: codebase_url.into(),
            size,
            hash: hash.into(),
            ..Self::default()
        }
    }

    pub fn with_ticket(mut self, ticket: Ticket) -> Self {
        self.ticket = Some(ticket);
        self
    }

    /// The version to show a user: display version, then version, then
    /// nothing.
    pub fn shown_version(&self) -> Option<&str> {
        self.display_version.as_deref().or(self.version.as_deref())
    }

    /// Environment exported to installer scripts: every field as
    /// `KS_<Key>` plus the backing ticket's identity.
    pub fn environment(&self) -> Vec<(String, String)> {
        let yes_no = |b: bool| if b { "YES" } else { "NO" }.to_string();
        let mut env = vec![
            ("KS_ProductID".to_string(), self.product_id.clone()),
            ("KS_Codebase".to_string(), self.codebase_url.clone()),
            ("KS_Size".to_string(), self.size.to_string()),
            ("KS_Hash".to_string(), self.hash.clone()),
            ("KS_Prompt".to_string(), yes_no(self.prompt_user)),
            ("KS_RequireReboot".to_string(), yes_no(self.requires_reboot)),
        ];
        let optional = [
            ("KS_MoreInfoURL", &self.more_info_url),
            ("KS_DisplayVersion", &self.display_version),
            ("KS_Version", &self.version),
            ("KS_LocalizationBundle", &self.localization_bundle),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                env.push((key.to_string(), value.clone()));
            }
        }
        for (key, value) in &self.extra {
            env.push((format!("KS_{key}"), value.clone()));
        }

        if let Some(ticket) = &self.ticket {
            env.push(("KS_TICKET_PRODUCT_ID".into(), ticket.product_id().to_string()));
            env.push(("KS_TICKET_VERSION".into(), ticket.determine_version()));
            env.push(("KS_TICKET_SERVER_URL".into(), ticket.server_url().to_string()));
            if let Some(path) = ticket.existence_checker().path() {
                env.push(("KS_TICKET_XC_PATH".into(), path.display().to_string()));
            }
        }
        env
    }
}
