use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Answers "is this product still installed?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistenceChecker {
    AlwaysTrue,
    AlwaysFalse,
    /// Present when the path exists on disk.
    Path(PathBuf),
    /// Present when Spotlight knows an application bundle with this id.
    Bundle(String),
    /// Present when this Spotlight query returns at least one result.
    Query(String),
}

impl ExistenceChecker {
    pub async fn exists(&self) -> bool {
        match self {
            ExistenceChecker::AlwaysTrue => true,
            ExistenceChecker::AlwaysFalse => false,
            ExistenceChecker::Path(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            ExistenceChecker::Bundle(id) => spotlight_has_results(&bundle_query(id)).await,
            ExistenceChecker::Query(query) => spotlight_has_results(query).await,
        }
    }

    /// The filesystem path this checker inspects, if it has one.
    pub fn path(&self) -> Option<&Path> {
        match self {
            ExistenceChecker::Path(path) => Some(path),
            _ => None,
        }
    }

    /// Short name used by the ticket store and the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            ExistenceChecker::AlwaysTrue => "true",
            ExistenceChecker::AlwaysFalse => "false",
            ExistenceChecker::Path(_) => "path",
            ExistenceChecker::Bundle(_) => "bundle",
            ExistenceChecker::Query(_) => "query",
        }
    }

    /// The checker's argument, empty for the constant variants.
    pub fn value(&self) -> String {
        match self {
            ExistenceChecker::AlwaysTrue | ExistenceChecker::AlwaysFalse => String::new(),
            ExistenceChecker::Path(path) => path.display().to_string(),
            ExistenceChecker::Bundle(v) | ExistenceChecker::Query(v) => v.clone(),
        }
    }

    /// Inverse of [`kind`](Self::kind) + [`value`](Self::value).
    pub fn from_parts(kind: &str, value: &str) -> Option<Self> {
        match kind {
            "true" => Some(ExistenceChecker::AlwaysTrue),
            "false" => Some(ExistenceChecker::AlwaysFalse),
            "path" => Some(ExistenceChecker::Path(PathBuf::from(value))),
            "bundle" => Some(ExistenceChecker::Bundle(value.to_string())),
            "query" => Some(ExistenceChecker::Query(value.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for ExistenceChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExistenceChecker::AlwaysTrue | ExistenceChecker::AlwaysFalse => f.write_str(self.kind()),
            _ => write!(f, "{}:{}", self.kind(), self.value()),
        }
    }
}

/// Spotlight query for a bundle id, with the id quoted as a string literal.
fn bundle_query(id: &str) -> String {
    let mut quoted = String::with_capacity(id.len());
    for c in id.chars() {
        if c == '\\' || c == '\'' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    format!("kMDItemCFBundleIdentifier == '{quoted}'")
}

/// Any spawn failure (no `mdfind` on this platform) counts as absent.
async fn spotlight_has_results(query: &str) -> bool {
    match tokio::process::Command::new("mdfind")
        .arg(query)
        .output()
        .await
    {
        Ok(output) => output.status.success() && !output.stdout.trim_ascii().is_empty(),
        Err(e) => {
            tracing::debug!(query, error = %e, "mdfind unavailable");
            false
        }
    }
}

/// Registration of one installed product with its update server.
///
/// Tickets are values: changing one means storing a replacement.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    product_id: String,
    version: String,
    existence_checker: ExistenceChecker,
    server_url: String,
    creation_date: SystemTime,
    tag: Option<String>,
    tag_path: Option<PathBuf>,
    tag_key: Option<String>,
    brand: Option<String>,
    brand_path: Option<PathBuf>,
    brand_key: Option<String>,
    version_path: Option<PathBuf>,
    version_key: Option<String>,
    trusted_tester_token: Option<String>,
}

impl Ticket {
    pub fn new(
        product_id: impl Into<String>,
        version: impl Into<String>,
        existence_checker: ExistenceChecker,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            version: version.into(),
            existence_checker,
            server_url: server_url.into(),
            creation_date: SystemTime::now(),
            tag: None,
            tag_path: None,
            tag_key: None,
            brand: None,
            brand_path: None,
            brand_key: None,
            version_path: None,
            version_key: None,
            trusted_tester_token: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_tag_path(mut self, path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        self.tag_path = Some(path.into());
        self.tag_key = Some(key.into());
        self
    }

    pub fn with_brand(mut self, path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        self.brand_path = Some(path.into());
        self.brand_key = Some(key.into());
        self
    }

    pub fn with_version_path(mut self, path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        self.version_path = Some(path.into());
        self.version_key = Some(key.into());
        self
    }

    pub fn with_trusted_tester_token(mut self, token: impl Into<String>) -> Self {
        self.trusted_tester_token = Some(token.into());
        self
    }

    pub fn with_creation_date(mut self, date: SystemTime) -> Self {
        self.creation_date = date;
        self
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn existence_checker(&self) -> &ExistenceChecker {
        &self.existence_checker
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn creation_date(&self) -> SystemTime {
        self.creation_date
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn tag_path(&self) -> Option<(&Path, &str)> {
        pair(&self.tag_path, &self.tag_key)
    }

    pub fn brand_path(&self) -> Option<(&Path, &str)> {
        pair(&self.brand_path, &self.brand_key)
    }

    pub fn version_path(&self) -> Option<(&Path, &str)> {
        pair(&self.version_path, &self.version_key)
    }

    pub fn trusted_tester_token(&self) -> Option<&str> {
        self.trusted_tester_token.as_deref()
    }

    /// Store key: product ids are case-insensitive.
    pub fn key(&self) -> String {
        self.product_id.to_lowercase()
    }

    /// The installed version, read from the version file when one is
    /// configured and readable, otherwise the registered version.
    pub fn determine_version(&self) -> String {
        self.version_path()
            .and_then(|(path, key)| lookup(path, key))
            .unwrap_or_else(|| self.version.clone())
    }

    /// The tag from the tag file, falling back to the static tag.
    pub fn determine_tag(&self) -> Option<String> {
        self.tag_path()
            .and_then(|(path, key)| lookup(path, key))
            .or_else(|| self.tag.clone())
    }

    /// The brand code from the brand file, if any.
    pub fn determine_brand(&self) -> Option<String> {
        self.brand_path()
            .and_then(|(path, key)| lookup(path, key))
            .or_else(|| self.brand.clone())
    }

    /// A copy with the version, tag and brand files read once and their
    /// values fixed in place. Later `determine_*` calls touch no files.
    /// Blocking; run it off the async threads.
    pub fn resolved(&self) -> Ticket {
        let mut ticket = self.clone();
        ticket.version = self.determine_version();
        ticket.tag = self.determine_tag();
        ticket.brand = self.determine_brand();
        ticket.version_path = None;
        ticket.version_key = None;
        ticket.tag_path = None;
        ticket.tag_key = None;
        ticket.brand_path = None;
        ticket.brand_key = None;
        ticket
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}) -> {}",
            self.product_id, self.version, self.existence_checker, self.server_url
        )
    }
}

fn pair<'a>(path: &'a Option<PathBuf>, key: &'a Option<String>) -> Option<(&'a Path, &'a str)> {
    Some((path.as_deref()?, key.as_deref()?))
}

/// Read `key` from a flat JSON object of strings. Missing files, bad JSON
/// and missing or empty values all yield `None`.
fn lookup(path: &Path, key: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let values: BTreeMap<String, String> = match facet_json::from_str(&contents) {
        Ok(values) => values,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "unreadable key/value file");
            return None;
        }
    };
    values.get(key).filter(|v| !v.is_empty()).cloned()
}

/// Group tickets by server URL. Groups and the tickets inside them keep the
/// order in which they first appear.
pub fn tickets_by_server_url(tickets: &[Ticket]) -> Vec<(String, Vec<Ticket>)> {
    let mut groups: Vec<(String, Vec<Ticket>)> = Vec::new();
    for ticket in tickets {
        match groups.iter_mut().find(|(url, _)| url == ticket.server_url()) {
            Some((_, group)) => group.push(ticket.clone()),
            None => groups.push((ticket.server_url().to_string(), vec![ticket.clone()])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(id: &str, url: &str) -> Ticket {
        Ticket::new(id, "1.0", ExistenceChecker::AlwaysTrue, url)
    }

    #[test]
    fn groups_by_server_in_first_seen_order() {
        let tickets = vec![
            ticket("a", "https://two"),
            ticket("b", "https://one"),
            ticket("c", "https://two"),
        ];
        let groups = tickets_by_server_url(&tickets);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "https://two");
        let ids: Vec<_> = groups[0].1.iter().map(Ticket::product_id).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(groups[1].0, "https://one");
    }

    #[test]
    fn key_is_lowercase() {
        assert_eq!(ticket("Com.Example.App", "u").key(), "com.example.app");
    }

    #[test]
    fn version_file_overrides_registered_version() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("info.json");
        std::fs::write(&file, r#"{"CFBundleVersion": "2.5", "Tag": "beta"}"#).unwrap();

        let t = ticket("app", "u")
            .with_version_path(&file, "CFBundleVersion")
            .with_tag("stable")
            .with_tag_path(&file, "Tag");
        assert_eq!(t.determine_version(), "2.5");
        assert_eq!(t.determine_tag().as_deref(), Some("beta"));
        assert_eq!(t.determine_brand(), None);
    }

    #[test]
    fn unreadable_files_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let t = ticket("app", "u")
            .with_tag("stable")
            .with_version_path(dir.path().join("missing.json"), "v")
            .with_tag_path(dir.path().join("missing.json"), "t");
        assert_eq!(t.determine_version(), "1.0");
        assert_eq!(t.determine_tag().as_deref(), Some("stable"));
    }

    #[test]
    fn resolved_ticket_no_longer_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("info.json");
        std::fs::write(&file, r#"{"v": "3.1", "t": "canary", "b": "GGLS"}"#).unwrap();

        let t = ticket("app", "u")
            .with_version_path(&file, "v")
            .with_tag_path(&file, "t")
            .with_brand(&file, "b")
            .resolved();
        std::fs::remove_file(&file).unwrap();

        assert_eq!(t.version(), "3.1");
        assert_eq!(t.determine_version(), "3.1");
        assert_eq!(t.determine_tag().as_deref(), Some("canary"));
        assert_eq!(t.determine_brand().as_deref(), Some("GGLS"));
        assert_eq!(t.version_path(), None);
        assert_eq!(t.product_id(), "app");
    }

    #[test]
    fn bundle_query_escapes_quotes() {
        assert_eq!(bundle_query("com.example.app"), "kMDItemCFBundleIdentifier == 'com.example.app'");
        assert_eq!(
            bundle_query(r"it's\odd"),
            r"kMDItemCFBundleIdentifier == 'it\'s\\odd'"
        );
    }

    #[tokio::test]
    async fn path_checker_tracks_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let present = ExistenceChecker::Path(dir.path().to_path_buf());
        let absent = ExistenceChecker::Path(dir.path().join("gone"));
        assert!(present.exists().await);
        assert!(!absent.exists().await);
        assert_eq!(present.path(), Some(dir.path()));
        assert!(!ExistenceChecker::AlwaysFalse.exists().await);
    }

    #[test]
    fn checker_parts_round_trip() {
        let checker = ExistenceChecker::Bundle("com.example.app".into());
        let back = ExistenceChecker::from_parts(checker.kind(), &checker.value());
        assert_eq!(back, Some(checker));
        assert_eq!(ExistenceChecker::from_parts("nope", ""), None);
    }
}
