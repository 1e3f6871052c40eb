//! Shared application state handed to every handler.

use crate::{
    models::extension::{Extension, ExtensionSet},
    services::store::DataStore,
};
use chrono::Duration;
use std::sync::Arc;

/// Protocol settings fixed at startup.
#[derive(Debug, Clone)]
pub struct TusSettings {
    /// Path the upload collection is mounted at, without a trailing slash.
    pub base_path: String,
    pub max_size: Option<u64>,
    pub extensions: ExtensionSet,
    /// Retention period for incomplete uploads; `None` disables expiration.
    pub expiration: Option<Duration>,
}

impl TusSettings {
    pub fn new(base_path: &str) -> Self {
        Self {
            base_path: normalize_base_path(base_path),
            max_size: None,
            extensions: ExtensionSet::default(),
            expiration: None,
        }
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }

    /// Replace the enabled extensions. Expiration stays tied to the retention
    /// period and is re-added if one is configured.
    pub fn with_extensions(mut self, extensions: ExtensionSet) -> Self {
        self.extensions = match self.expiration {
            Some(_) => extensions.with(Extension::Expiration),
            None => extensions.without(Extension::Expiration),
        };
        self
    }

    pub fn with_expiration(mut self, retention: Duration) -> Self {
        self.expiration = Some(retention);
        self.extensions = self.extensions.with(Extension::Expiration);
        self
    }

    pub fn supports(&self, extension: Extension) -> bool {
        self.extensions.supports(extension)
    }

    /// Path of the upload resource for `id`.
    pub fn upload_path(&self, id: &str) -> String {
        format!("{}/{}", self.base_path, id)
    }
}

impl Default for TusSettings {
    fn default() -> Self {
        Self::new("/files")
    }
}

/// Leading slash, no trailing slash, `/` collapses to the empty root.
pub fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DataStore>,
    pub settings: Arc<TusSettings>,
}

impl AppState {
    pub fn new(store: Arc<dyn DataStore>, settings: TusSettings) -> Self {
        Self {
            store,
            settings: Arc::new(settings),
        }
    }
}
