use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::Contact;
use tracing::info;

use crate::ContactSnapshotStore;

pub const DEFAULT_CONTACTS_FILE: &str = "contacts.json";

/// Contact snapshot kept as a pretty-printed JSON array on disk.
#[derive(Debug, Clone)]
pub struct JsonContactFile {
    path: PathBuf,
}

impl JsonContactFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for JsonContactFile {
    fn default() -> Self {
        Self::new(DEFAULT_CONTACTS_FILE)
    }
}

#[async_trait]
impl ContactSnapshotStore for JsonContactFile {
    async fn save_contacts(&self, contacts: &[Contact]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create '{}'", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(contacts)?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("failed to save contacts to '{}'", self.path.display()))?;
        info!(path = %self.path.display(), count = contacts.len(), "storage: contacts saved");
        Ok(())
    }

    async fn load_contacts(&self) -> Result<Vec<Contact>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to load contacts from '{}'", self.path.display())
                })
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid contacts file '{}'", self.path.display()))
    }
}
