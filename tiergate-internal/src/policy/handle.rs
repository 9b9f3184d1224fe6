use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;

use crate::error::Error;
use crate::policy::catalog::PolicyCatalog;

/// Shared, hot-swappable reference to the active catalog.
///
/// Readers take one `Arc` snapshot per decision, so a reload never shows a request a
/// half-updated table.
#[derive(Clone, Debug)]
pub struct PolicyHandle(Arc<ArcSwap<PolicyCatalog>>);

impl PolicyHandle {
    pub fn new(catalog: PolicyCatalog) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(catalog)))
    }

    pub fn load(&self) -> Arc<PolicyCatalog> {
        self.0.load_full()
    }

    pub fn replace(&self, catalog: PolicyCatalog) {
        self.0.store(Arc::new(catalog));
    }

    /// Parses and validates the file at `path`, then swaps it in.
    /// On any error the previous catalog stays active.
    pub async fn reload_from_path(&self, path: &Path) -> Result<Arc<PolicyCatalog>, Error> {
        let catalog = Arc::new(PolicyCatalog::from_path(path).await?);
        self.0.store(Arc::clone(&catalog));
        tracing::info!(
            path = %path.display(),
            features = catalog.declared_features().count(),
            "Reloaded policy catalog"
        );
        Ok(catalog)
    }
}
