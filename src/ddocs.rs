//! Design-document store client.
//!
//! Reads, installs, and removes design documents on a [`Connection`], and
//! exports/imports whole [`DesignDocumentSet`]s as JSON files.
//!
//! # Staging protocol
//!
//! A published design document is never written directly. [`install`]
//! moves it through a staging copy so the view index starts building
//! before the published copy replaces the old one:
//!
//! ```text
//! absent → staging-created → staging-indexed → published → staging-removed
//! ```
//!
//! 1. Upsert `dev_<name>`.
//! 2. Wait [`SETTLE_DELAY`].
//! 3. Query the first view once with `stale=false` to force the index build.
//! 4. Upsert `<name>` with identical content.
//! 5. Remove `dev_<name>`.
//!
//! Installing a name that is already staging-form stops after step 3.
//! No step is retried; the first failure aborts the install.
//!
//! [`install`]: Connection::install_design_document

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use cb_admin_core::models::{is_staging, staging_name, DesignDocument, DesignDocumentSet, ViewDefinition};
use cb_admin_core::store::{Freshness, StoreError, ViewQuery};
use thiserror::Error;

use crate::connection::Connection;

/// Time given to the store to register a new staging index before it is
/// queried.
pub const SETTLE_DELAY: Duration = Duration::from_millis(2000);

/// Key used for the index-forcing query; its result is discarded.
const INDEX_PROBE_KEY: &str = "dummykey";

/// A failed step of the staging protocol.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to create staging copy [{name}]: {source}")]
    StagingCreate { name: String, source: StoreError },

    #[error("failed to fetch staging index [{name}.{view}]: {source}")]
    StagingIndex {
        name: String,
        view: String,
        source: StoreError,
    },

    #[error("failed to create [{name}]: {source}")]
    Publish { name: String, source: StoreError },

    /// The published copy is in place; only the staging copy was left behind.
    #[error("failed to remove staging copy [{name}] (published copy is in place): {source}")]
    StagingCleanup { name: String, source: StoreError },
}

impl InstallError {
    /// `true` when the publish step completed before the failure.
    pub fn is_published(&self) -> bool {
        matches!(self, InstallError::StagingCleanup { .. })
    }
}

/// Errors of the single-view helpers.
#[derive(Debug, Error)]
pub enum ViewError {
    #[error("VIEW_CONFLICT: view [{design_document}.{view}] exists with a different definition")]
    Conflict {
        design_document: String,
        view: String,
    },

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Connection {
    /// Snapshot every design document of the bucket.
    pub async fn get_design_documents(&self) -> Result<DesignDocumentSet, StoreError> {
        self.bucket().get_design_documents().await
    }

    /// Install `doc` under `name` through the staging protocol.
    pub async fn install_design_document(
        &self,
        name: &str,
        doc: &DesignDocument,
    ) -> Result<(), InstallError> {
        let staged = staging_name(name);
        tracing::info!(bucket = self.name(), design_document = name, "creating");

        self.bucket()
            .upsert_design_document(&staged, doc)
            .await
            .map_err(|source| InstallError::StagingCreate {
                name: staged.clone(),
                source,
            })?;
        tracing::debug!(design_document = %staged, "created");

        tokio::time::sleep(SETTLE_DELAY).await;

        if let Some(view) = doc.first_view_name() {
            let probe = ViewQuery::new()
                .key(INDEX_PROBE_KEY)
                .freshness(Freshness::UpdateBefore)
                .full_set(true);
            self.bucket()
                .query_view(&staged, view, &probe)
                .await
                .map_err(|source| {
                    tracing::error!(design_document = %staged, view, error = %source, "index fetch failed");
                    InstallError::StagingIndex {
                        name: staged.clone(),
                        view: view.to_string(),
                        source,
                    }
                })?;
            tracing::debug!(design_document = %staged, view, "fetched");
        }

        if is_staging(name) {
            return Ok(());
        }

        self.bucket()
            .upsert_design_document(name, doc)
            .await
            .map_err(|source| {
                tracing::error!(design_document = name, error = %source, "publish failed");
                InstallError::Publish {
                    name: name.to_string(),
                    source,
                }
            })?;
        tracing::debug!(design_document = name, "created");

        self.bucket()
            .remove_design_document(&staged)
            .await
            .map_err(|source| {
                tracing::error!(design_document = %staged, error = %source, "staging removal failed");
                InstallError::StagingCleanup {
                    name: staged.clone(),
                    source,
                }
            })?;
        tracing::debug!(design_document = %staged, "removed");

        Ok(())
    }

    pub async fn remove_design_document(&self, name: &str) -> Result<(), StoreError> {
        tracing::info!(bucket = self.name(), design_document = name, "removing");
        self.bucket().remove_design_document(name).await
    }

    /// Add `view` to `design_document` without touching its siblings.
    ///
    /// Creating a view that already exists with the same definition is a
    /// no-op; a different definition is a [`ViewError::Conflict`].
    pub async fn create_view(
        &self,
        design_document: &str,
        view: &str,
        definition: &ViewDefinition,
    ) -> Result<(), ViewError> {
        let current = self.get_design_documents().await?.remove(design_document);

        if let Some(existing) = current.as_ref().and_then(|d| d.views.get(view)) {
            if existing == definition {
                tracing::debug!(design_document, view, "view already present");
                return Ok(());
            }
            return Err(ViewError::Conflict {
                design_document: design_document.to_string(),
                view: view.to_string(),
            });
        }

        let mut doc = current.unwrap_or_default();
        doc.views.insert(view.to_string(), definition.clone());
        self.install_design_document(design_document, &doc).await?;
        Ok(())
    }

    /// Set `view` to `definition`, replacing whatever was there.
    pub async fn upgrade_view(
        &self,
        design_document: &str,
        view: &str,
        definition: &ViewDefinition,
    ) -> Result<(), ViewError> {
        let mut doc = self
            .get_design_documents()
            .await?
            .remove(design_document)
            .unwrap_or_default();

        if doc.views.get(view) == Some(definition) {
            return Ok(());
        }

        doc.views.insert(view.to_string(), definition.clone());
        self.install_design_document(design_document, &doc).await?;
        Ok(())
    }

    /// Remove one view. The design document is deleted when no views
    /// remain, otherwise the trimmed document is written back.
    ///
    /// Returns `false` when there was nothing to remove.
    pub async fn remove_view(&self, design_document: &str, view: &str) -> Result<bool, ViewError> {
        let Some(mut doc) = self.get_design_documents().await?.remove(design_document) else {
            return Ok(false);
        };
        if doc.views.remove(view).is_none() {
            return Ok(false);
        }

        if doc.views.is_empty() {
            self.remove_design_document(design_document).await?;
        } else {
            self.bucket()
                .upsert_design_document(design_document, &doc)
                .await?;
        }
        tracing::info!(design_document, view, "view removed");
        Ok(true)
    }
}

/// Write `set` to `path` as pretty-printed JSON.
pub fn export_design_documents(path: &Path, set: &DesignDocumentSet) -> Result<()> {
    let json = serde_json::to_string_pretty(set)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, json)
        .with_context(|| format!("export to [{}] failed", path.display()))?;
    Ok(())
}

/// Read a set previously written by [`export_design_documents`].
pub fn import_design_documents(path: &Path) -> Result<DesignDocumentSet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read design documents file: {}", path.display()))?;
    let set = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse design documents file: {}", path.display()))?;
    Ok(set)
}
