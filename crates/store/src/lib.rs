//! Store implementations for Coachflow.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use coachflow_config::StoreConfig;
use coachflow_core::enrollment::EnrollmentUpdate;
use coachflow_core::error::StoreError;
use coachflow_core::store::Store;
use std::sync::Arc;

/// Open the backend selected by `[store]`.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn Store>, StoreError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let path = config.resolved_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Storage(format!("Cannot create {}: {e}", parent.display()))
                })?;
            }
            let store = SqliteStore::new(&format!("sqlite://{}", path.display())).await?;
            Ok(Arc::new(store))
        }
        other => Err(StoreError::Storage(format!(
            "Store backend '{other}' is not available in this build"
        ))),
    }
}

/// Reject updates that would break enrollment invariants.
pub(crate) fn check_update(expected_step: u32, update: &EnrollmentUpdate) -> Result<(), StoreError> {
    if update.current_step < expected_step {
        return Err(StoreError::QueryFailed(format!(
            "step index cannot decrease ({expected_step} -> {})",
            update.current_step
        )));
    }
    if !update.is_consistent() {
        return Err(StoreError::QueryFailed(format!(
            "next_due_at must be set iff status is active (status = {})",
            update.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_memory_backend() {
        let config = StoreConfig {
            backend: "memory".into(),
            path: None,
        };
        let store = open(&config).await.unwrap();
        assert_eq!(store.name(), "in_memory");
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn open_sqlite_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            backend: "sqlite".into(),
            path: Some(dir.path().join("nested").join("coachflow.db")),
        };
        let store = open(&config).await.unwrap();
        assert_eq!(store.name(), "sqlite");
        assert!(dir.path().join("nested").exists());
    }

    #[tokio::test]
    async fn unknown_backend_is_error() {
        let config = StoreConfig {
            backend: "cassandra".into(),
            path: None,
        };
        assert!(open(&config).await.is_err());
    }
}
