use std::path::PathBuf;

const APP_DIR: &str = "update-engine";

/// Runner configuration: `~/.config/update-engine/engine.toml`
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(APP_DIR)
        .join("engine.toml")
}

/// Persistent state: `~/.local/share/update-engine/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(APP_DIR)
}

/// Ticket store document.
pub fn ticket_store_path() -> PathBuf {
    data_dir().join("tickets.json")
}

/// Stats collection document.
pub fn stats_path() -> PathBuf {
    data_dir().join("stats.json")
}

/// Downloaded update payloads: `~/.cache/update-engine/downloads/`
pub fn download_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(APP_DIR)
        .join("downloads")
}

/// Runner log and installer script logs live under here.
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn script_logs_dir() -> PathBuf {
    logs_dir().join("scripts")
}
