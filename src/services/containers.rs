//! Resolves the containers a run uploads into.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::RunError;
use crate::models::container::{Container, ContainerSpec};
use crate::services::storage_service::StorageBackend;

/// Turn `spec` into an ordered list of existing containers, creating any
/// that are missing. Fails with [`RunError::NoContainers`] rather than
/// returning an empty list.
pub async fn resolve_targets(
    backend: &dyn StorageBackend,
    spec: &ContainerSpec,
    cancel: &CancellationToken,
) -> Result<Vec<Container>, RunError> {
    let names = spec.names();
    if names.is_empty() {
        return Err(RunError::NoContainers);
    }

    match spec {
        ContainerSpec::Generated(count) => info!("Creating {} Containers", count),
        ContainerSpec::Named(names) => info!("Creating Containers named {}", names.join(", ")),
    }

    let mut containers = Vec::with_capacity(names.len());
    for name in names {
        let container = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunError::Cancelled),
            res = backend.ensure_container(&name) => {
                res.map_err(|source| RunError::Container { name: name.clone(), source })?
            }
        };
        containers.push(container);
    }
    Ok(containers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage_service::LocalStore;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Arc;

    async fn store(dir: &std::path::Path) -> LocalStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = LocalStore::new(Arc::new(pool), dir);
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn generated_containers_exist_after_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let cancel = CancellationToken::new();

        let containers = resolve_targets(&store, &ContainerSpec::parse(Some("3"), 5), &cancel)
            .await
            .unwrap();
        assert_eq!(containers.len(), 3);
        for container in &containers {
            let again = store.ensure_container(&container.name).await.unwrap();
            assert_eq!(&again, container);
        }
    }

    #[tokio::test]
    async fn named_containers_keep_first_seen_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let cancel = CancellationToken::new();

        let spec = ContainerSpec::parse(Some("beta, alpha, beta"), 5);
        let names: Vec<String> = resolve_targets(&store, &spec, &cancel)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["beta", "alpha"]);
    }

    #[tokio::test]
    async fn empty_spec_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let cancel = CancellationToken::new();

        let err = resolve_targets(&store, &ContainerSpec::Generated(0), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::NoContainers));
    }

    #[tokio::test]
    async fn invalid_name_surfaces_container_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let cancel = CancellationToken::new();

        let spec = ContainerSpec::Named(vec!["Bad_Name".to_string()]);
        let err = resolve_targets(&store, &spec, &cancel).await.unwrap_err();
        assert!(matches!(err, RunError::Container { ref name, .. } if name == "Bad_Name"));
    }

    #[tokio::test]
    async fn cancelled_before_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = resolve_targets(&store, &ContainerSpec::Generated(2), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Cancelled));
    }
}
