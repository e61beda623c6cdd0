use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use chat_driver::BrowserOptions;
use dispatch_core::{DispatchSettings, EngineConfig, Persistence};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub driver_url: String,
    pub driver_request_timeout_secs: u64,
    /// `local` keeps credentials with the driver, `remote` backs them up to
    /// the session database.
    pub auth_mode: String,
    /// When set, contact snapshots go to this JSON file instead of the
    /// database.
    pub contacts_path: Option<String>,
    pub ready_timeout_secs: u64,
    pub settle_delay_ms: u64,
    pub send_interval_ms: u64,
    pub pairing_timeout_secs: u64,
    pub backup_sync_interval_secs: u64,
    pub headless: bool,
    pub chrome_executable_path: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/sessions.db".into(),
            driver_url: "ws://127.0.0.1:9222/driver".into(),
            driver_request_timeout_secs: 60,
            auth_mode: "remote".into(),
            contacts_path: None,
            ready_timeout_secs: 120,
            settle_delay_ms: 3000,
            send_interval_ms: 1000,
            pairing_timeout_secs: 300,
            backup_sync_interval_secs: 300,
            headless: true,
            chrome_executable_path: None,
        }
    }
}

impl Settings {
    /// Engine defaults derived from these settings. Remote persistence uses
    /// `database_url` as the session store.
    pub fn engine_config(&self, database_url: &str) -> EngineConfig {
        let mut engine = if self.auth_mode.eq_ignore_ascii_case("local") {
            EngineConfig::default()
        } else {
            EngineConfig::remote(database_url)
        };
        if let Persistence::Remote {
            backup_sync_interval,
            ..
        } = &mut engine.persistence
        {
            *backup_sync_interval = Duration::from_secs(self.backup_sync_interval_secs);
        }
        engine.browser = BrowserOptions {
            headless: self.headless,
            executable_path: self.chrome_executable_path.clone(),
            ..engine.browser
        };
        engine.ready_timeout = Duration::from_secs(self.ready_timeout_secs);
        engine.settle_delay =
            (self.settle_delay_ms > 0).then(|| Duration::from_millis(self.settle_delay_ms));
        engine.pairing_window = Duration::from_secs(self.pairing_timeout_secs);
        engine.dispatch = DispatchSettings {
            send_interval: Duration::from_millis(self.send_interval_ms),
        };
        engine
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file_settings(&mut settings, &raw);
    }

    apply_env_settings(&mut settings, |key| std::env::var(key).ok());

    settings
}

/// Keys accepted in `server.toml`. Every field is optional so a partial file
/// only overrides what it names.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    driver_url: Option<String>,
    driver_request_timeout_secs: Option<u64>,
    auth_mode: Option<String>,
    contacts_path: Option<String>,
    ready_timeout_secs: Option<u64>,
    settle_delay_ms: Option<u64>,
    send_interval_ms: Option<u64>,
    pairing_timeout_secs: Option<u64>,
    backup_sync_interval_secs: Option<u64>,
    headless: Option<bool>,
    chrome_executable_path: Option<String>,
}

fn apply_file_settings(settings: &mut Settings, raw: &str) {
    let file_cfg = match toml::from_str::<FileSettings>(raw) {
        Ok(file_cfg) => file_cfg,
        Err(err) => {
            warn!(error = %err, "ignoring server.toml: failed to parse");
            return;
        }
    };
    let FileSettings {
        bind_addr,
        database_url,
        driver_url,
        driver_request_timeout_secs,
        auth_mode,
        contacts_path,
        ready_timeout_secs,
        settle_delay_ms,
        send_interval_ms,
        pairing_timeout_secs,
        backup_sync_interval_secs,
        headless,
        chrome_executable_path,
    } = file_cfg;

    if let Some(v) = bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = database_url {
        settings.database_url = v;
    }
    if let Some(v) = driver_url {
        settings.driver_url = v;
    }
    if let Some(v) = auth_mode {
        settings.auth_mode = v;
    }
    if contacts_path.is_some() {
        settings.contacts_path = contacts_path;
    }
    if chrome_executable_path.is_some() {
        settings.chrome_executable_path = chrome_executable_path;
    }
    if let Some(v) = headless {
        settings.headless = v;
    }

    let numeric = [
        (driver_request_timeout_secs, &mut settings.driver_request_timeout_secs),
        (ready_timeout_secs, &mut settings.ready_timeout_secs),
        (settle_delay_ms, &mut settings.settle_delay_ms),
        (send_interval_ms, &mut settings.send_interval_ms),
        (pairing_timeout_secs, &mut settings.pairing_timeout_secs),
        (backup_sync_interval_secs, &mut settings.backup_sync_interval_secs),
    ];
    for (value, target) in numeric {
        if let Some(value) = value {
            *target = value;
        }
    }
}

fn apply_env_settings(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = var("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = var("DRIVER_URL") {
        settings.driver_url = v;
    }
    if let Some(v) = var("APP__DRIVER_URL") {
        settings.driver_url = v;
    }

    if let Some(v) = var("APP__AUTH_MODE") {
        settings.auth_mode = v;
    }
    if let Some(v) = var("APP__CONTACTS_PATH") {
        settings.contacts_path = Some(v);
    }

    if let Some(v) = var("CHROME_EXECUTABLE_PATH") {
        settings.chrome_executable_path = Some(v);
    }
    if let Some(v) = var("APP__CHROME_EXECUTABLE_PATH") {
        settings.chrome_executable_path = Some(v);
    }

    if let Some(parsed) = var("APP__HEADLESS").and_then(|v| v.parse::<bool>().ok()) {
        settings.headless = parsed;
    }

    let numeric = [
        ("APP__DRIVER_REQUEST_TIMEOUT_SECS", &mut settings.driver_request_timeout_secs),
        ("APP__READY_TIMEOUT_SECS", &mut settings.ready_timeout_secs),
        ("APP__SETTLE_DELAY_MS", &mut settings.settle_delay_ms),
        ("APP__SEND_INTERVAL_MS", &mut settings.send_interval_ms),
        ("APP__PAIRING_TIMEOUT_SECS", &mut settings.pairing_timeout_secs),
        ("APP__BACKUP_SYNC_INTERVAL_SECS", &mut settings.backup_sync_interval_secs),
    ];
    for (key, target) in numeric {
        if let Some(parsed) = var(key).and_then(|v| v.parse::<u64>().ok()) {
            *target = parsed;
        }
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
