//! Persistent product id -> ticket mapping.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use facet::Facet;

use crate::error::EngineError;
use crate::ticket::{ExistenceChecker, Ticket};

/// Owner of ticket lifetimes. At most one ticket per lowercased product id.
pub trait TicketStore: Send + Sync {
    /// All tickets, ordered by lowercased product id.
    fn tickets(&self) -> Result<Vec<Ticket>, EngineError>;

    fn ticket_for_product_id(&self, product_id: &str) -> Result<Option<Ticket>, EngineError>;

    /// Create or replace. A replacement keeps the original creation date.
    fn store_ticket(&self, ticket: Ticket) -> Result<(), EngineError>;

    /// Returns whether a ticket was removed.
    fn delete_ticket_for_product_id(&self, product_id: &str) -> Result<bool, EngineError>;

    fn delete_ticket(&self, ticket: &Ticket) -> Result<bool, EngineError> {
        self.delete_ticket_for_product_id(ticket.product_id())
    }

    fn ticket_count(&self) -> Result<usize, EngineError> {
        Ok(self.tickets()?.len())
    }
}

fn replace_preserving_date(map: &mut BTreeMap<String, Ticket>, ticket: Ticket) {
    let key = ticket.key();
    let ticket = match map.get(&key) {
        Some(existing) => ticket.with_creation_date(existing.creation_date()),
        None => ticket,
    };
    map.insert(key, ticket);
}

// ── In-memory store ──────────────────────────────────────

#[derive(Default)]
pub struct MemoryTicketStore {
    tickets: Mutex<BTreeMap<String, Ticket>>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tickets(tickets: impl IntoIterator<Item = Ticket>) -> Self {
        let store = Self::new();
        {
            let mut map = store.lock();
            for ticket in tickets {
                replace_preserving_date(&mut map, ticket);
            }
        }
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Ticket>> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TicketStore for MemoryTicketStore {
    fn tickets(&self) -> Result<Vec<Ticket>, EngineError> {
        Ok(self.lock().values().cloned().collect())
    }

    fn ticket_for_product_id(&self, product_id: &str) -> Result<Option<Ticket>, EngineError> {
        Ok(self.lock().get(&product_id.to_lowercase()).cloned())
    }

    fn store_ticket(&self, ticket: Ticket) -> Result<(), EngineError> {
        replace_preserving_date(&mut self.lock(), ticket);
        Ok(())
    }

    fn delete_ticket_for_product_id(&self, product_id: &str) -> Result<bool, EngineError> {
        Ok(self.lock().remove(&product_id.to_lowercase()).is_some())
    }
}

// ── JSON file store ──────────────────────────────────────

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct StoreDocument {
    #[facet(default)]
    tickets: Vec<TicketRecord>,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct TicketRecord {
    product_id: String,
    version: String,
    #[facet(default)]
    checker: String,
    #[facet(default)]
    checker_value: String,
    server_url: String,
    #[facet(default)]
    creation_date: u64,
    tag: Option<String>,
    tag_path: Option<String>,
    tag_key: Option<String>,
    brand_path: Option<String>,
    brand_key: Option<String>,
    version_path: Option<String>,
    version_key: Option<String>,
    trusted_tester_token: Option<String>,
}

impl TicketRecord {
    fn from_ticket(ticket: &Ticket) -> Self {
        let checker = ticket.existence_checker();
        let split = |pair: Option<(&Path, &str)>| match pair {
            Some((path, key)) => (Some(path.display().to_string()), Some(key.to_string())),
            None => (None, None),
        };
        let (tag_path, tag_key) = split(ticket.tag_path());
        let (brand_path, brand_key) = split(ticket.brand_path());
        let (version_path, version_key) = split(ticket.version_path());
        Self {
            product_id: ticket.product_id().to_string(),
            version: ticket.version().to_string(),
            checker: checker.kind().to_string(),
            checker_value: checker.value(),
            server_url: ticket.server_url().to_string(),
            creation_date: ticket
                .creation_date()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            tag: ticket.tag().map(str::to_string),
            tag_path,
            tag_key,
            brand_path,
            brand_key,
            version_path,
            version_key,
            trusted_tester_token: ticket.trusted_tester_token().map(str::to_string),
        }
    }

    fn into_ticket(self, store: &Path) -> Result<Ticket, EngineError> {
        let checker = ExistenceChecker::from_parts(&self.checker, &self.checker_value)
            .ok_or_else(|| EngineError::TicketStore {
                path: store.display().to_string(),
                message: format!(
                    "ticket '{}' has unknown existence checker '{}'",
                    self.product_id, self.checker
                ),
            })?;
        let mut ticket = Ticket::new(self.product_id, self.version, checker, self.server_url)
            .with_creation_date(UNIX_EPOCH + Duration::from_secs(self.creation_date));
        if let Some(tag) = self.tag {
            ticket = ticket.with_tag(tag);
        }
        if let (Some(path), Some(key)) = (self.tag_path, self.tag_key) {
            ticket = ticket.with_tag_path(path, key);
        }
        if let (Some(path), Some(key)) = (self.brand_path, self.brand_key) {
            ticket = ticket.with_brand(path, key);
        }
        if let (Some(path), Some(key)) = (self.version_path, self.version_key) {
            ticket = ticket.with_version_path(path, key);
        }
        if let Some(token) = self.trusted_tester_token {
            ticket = ticket.with_trusted_tester_token(token);
        }
        Ok(ticket)
    }
}

/// Tickets persisted as one JSON document. Every mutation rewrites the file
/// through a temporary sibling and a rename, so readers never observe a
/// half-written store.
pub struct FileTicketStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileTicketStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn store_error(&self, message: impl Into<String>) -> EngineError {
        EngineError::TicketStore {
            path: self.path.display().to_string(),
            message: message.into(),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, Ticket>, EngineError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(EngineError::io(
                    format!("failed to read ticket store {}", self.path.display()),
                    e,
                ));
            }
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let doc: StoreDocument =
            facet_json::from_str(&contents).map_err(|e| self.store_error(e.to_string()))?;
        let mut map = BTreeMap::new();
        for record in doc.tickets {
            let ticket = record.into_ticket(&self.path)?;
            map.insert(ticket.key(), ticket);
        }
        Ok(map)
    }

    fn save(&self, tickets: &BTreeMap<String, Ticket>) -> Result<(), EngineError> {
        let doc = StoreDocument {
            tickets: tickets.values().map(TicketRecord::from_ticket).collect(),
        };
        let json = facet_json::to_string(&doc).map_err(|e| self.store_error(e.to_string()))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::io(format!("failed to create {}", parent.display()), e)
            })?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| EngineError::io(format!("failed to write {}", tmp.display()), e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            EngineError::io(format!("failed to replace {}", self.path.display()), e)
        })?;
        tracing::debug!(path = %self.path.display(), count = tickets.len(), "ticket store saved");
        Ok(())
    }
}

impl TicketStore for FileTicketStore {
    fn tickets(&self) -> Result<Vec<Ticket>, EngineError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.into_values().collect())
    }

    fn ticket_for_product_id(&self, product_id: &str) -> Result<Option<Ticket>, EngineError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.remove(&product_id.to_lowercase()))
    }

    fn store_ticket(&self, ticket: Ticket) -> Result<(), EngineError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tickets = self.load()?;
        tracing::info!(product_id = ticket.product_id(), "storing ticket");
        replace_preserving_date(&mut tickets, ticket);
        self.save(&tickets)
    }

    fn delete_ticket_for_product_id(&self, product_id: &str) -> Result<bool, EngineError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut tickets = self.load()?;
        if tickets.remove(&product_id.to_lowercase()).is_none() {
            return Ok(false);
        }
        tracing::info!(product_id, "deleting ticket");
        self.save(&tickets)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(id: &str, version: &str) -> Ticket {
        Ticket::new(id, version, ExistenceChecker::AlwaysTrue, "https://updates.example.com")
    }

    fn stores(dir: &Path) -> Vec<Box<dyn TicketStore>> {
        vec![
            Box::new(MemoryTicketStore::new()),
            Box::new(FileTicketStore::new(dir.join("tickets.json"))),
        ]
    }

    #[test]
    fn replacing_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        for store in stores(dir.path()) {
            store.store_ticket(ticket("foo", "1.0")).unwrap();
            store.store_ticket(ticket("Foo", "2.0")).unwrap();
            assert_eq!(store.ticket_count().unwrap(), 1);
            let t = store.ticket_for_product_id("FOO").unwrap().unwrap();
            assert_eq!(t.product_id(), "Foo");
            assert_eq!(t.version(), "2.0");
        }
    }

    #[test]
    fn replacement_keeps_creation_date() {
        let dir = tempfile::tempdir().unwrap();
        let created = UNIX_EPOCH + Duration::from_secs(1_000_000);
        for store in stores(dir.path()) {
            store
                .store_ticket(ticket("app", "1.0").with_creation_date(created))
                .unwrap();
            store.store_ticket(ticket("app", "1.1")).unwrap();
            let t = store.ticket_for_product_id("app").unwrap().unwrap();
            assert_eq!(t.creation_date(), created);
        }
    }

    #[test]
    fn delete_reports_whether_anything_was_removed() {
        let dir = tempfile::tempdir().unwrap();
        for store in stores(dir.path()) {
            let t = ticket("app", "1.0");
            store.store_ticket(t.clone()).unwrap();
            assert!(store.delete_ticket(&t).unwrap());
            assert!(!store.delete_ticket_for_product_id("app").unwrap());
            assert_eq!(store.ticket_count().unwrap(), 0);
        }
    }

    #[test]
    fn file_store_round_trips_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tickets.json");
        let original = Ticket::new(
            "com.example.app",
            "3.1",
            ExistenceChecker::Path("/Applications/Example.app".into()),
            "https://updates.example.com/manifest.json",
        )
        .with_creation_date(UNIX_EPOCH + Duration::from_secs(42))
        .with_tag("beta")
        .with_brand("/tmp/brand.json", "brand")
        .with_trusted_tester_token("tt");

        FileTicketStore::new(&path).store_ticket(original.clone()).unwrap();
        let reloaded = FileTicketStore::new(&path).tickets().unwrap();
        assert_eq!(reloaded, vec![original]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTicketStore::new(dir.path().join("absent.json"));
        assert!(store.tickets().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tickets.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = FileTicketStore::new(&path).tickets().unwrap_err();
        assert!(matches!(err, EngineError::TicketStore { .. }));
    }
}
