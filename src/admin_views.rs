//! Administrative filter views.
//!
//! All generated views live side by side in one administrative design
//! document (`[admin].design_document`, default `cb_admin`). A view is
//! named after the hash of its map source (see
//! [`cb_admin_core::admin_view`]), so creating the same filter twice
//! reuses the existing view and removing it twice is harmless.

use anyhow::{Context, Result};
use cb_admin_core::admin_view::FilterSpec;
use cb_admin_core::models::staging_name;

use crate::connection::Connection;
use crate::ddocs::ViewError;

/// Install the filter view for `spec` unless it is already present.
/// Returns its view id.
pub async fn create_filter_view(
    conn: &Connection,
    admin_design_document: &str,
    spec: &FilterSpec,
) -> Result<String, ViewError> {
    let view_id = spec.view_id();
    tracing::info!(
        bucket = conn.name(),
        design_document = admin_design_document,
        view = %view_id,
        mode = ?spec.mode(),
        "ensuring filter view"
    );
    conn.create_view(admin_design_document, &view_id, &spec.view_definition())
        .await?;
    Ok(view_id)
}

/// Remove the filter view for `spec`. Returns `false` if it did not exist.
pub async fn remove_filter_view(
    conn: &Connection,
    admin_design_document: &str,
    spec: &FilterSpec,
) -> Result<bool, ViewError> {
    let view_id = spec.view_id();
    conn.remove_view(admin_design_document, &view_id).await
}

/// Drop the whole administrative design document, together with any
/// staging copy a failed install left behind.
pub async fn cleanup_filter_views(conn: &Connection, admin_design_document: &str) -> Result<usize> {
    let mut removed = 0;
    for name in [
        admin_design_document.to_string(),
        staging_name(admin_design_document),
    ] {
        match conn.remove_design_document(&name).await {
            Ok(()) => removed += 1,
            Err(e) if e.is_not_found() => {
                tracing::debug!(design_document = %name, "nothing to clean up");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove [{}]", name));
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use cb_admin_core::admin_view::FilterMode;
    use cb_admin_core::models::{DesignDocument, ViewDefinition};
    use cb_admin_core::store::memory::{InMemoryBucket, Op};
    use cb_admin_core::store::Bucket;
    use std::sync::Arc;

    const ADMIN: &str = "cb_admin";

    fn setup() -> (Arc<InMemoryBucket>, Connection) {
        let bucket = Arc::new(InMemoryBucket::new("b"));
        let conn = Connection::new(bucket.clone(), RetryPolicy::default());
        (bucket, conn)
    }

    #[tokio::test(start_paused = true)]
    async fn create_is_idempotent() {
        let (bucket, conn) = setup();
        let spec = FilterSpec::new(["user::"], FilterMode::Matching);

        let id1 = create_filter_view(&conn, ADMIN, &spec).await.unwrap();
        let installs = bucket.calls(Op::UpsertDesignDocument);
        let id2 = create_filter_view(&conn, ADMIN, &spec).await.unwrap();

        assert_eq!(id1, id2);
        assert_eq!(bucket.calls(Op::UpsertDesignDocument), installs);
        assert!(bucket.design_document(ADMIN).unwrap().views.contains_key(&id1));
    }

    #[tokio::test(start_paused = true)]
    async fn second_filter_reuses_admin_document() {
        let (bucket, conn) = setup();
        let users = FilterSpec::new(["user::"], FilterMode::Matching);
        let others = FilterSpec::new(["user::"], FilterMode::NotMatching);

        let a = create_filter_view(&conn, ADMIN, &users).await.unwrap();
        let b = create_filter_view(&conn, ADMIN, &others).await.unwrap();

        let doc = bucket.design_document(ADMIN).unwrap();
        assert_eq!(doc.views.len(), 2);
        assert!(doc.views.contains_key(&a) && doc.views.contains_key(&b));
    }

    #[tokio::test(start_paused = true)]
    async fn remove_trims_then_deletes() {
        let (bucket, conn) = setup();
        let a = FilterSpec::new(["a"], FilterMode::Matching);
        let b = FilterSpec::new(["b"], FilterMode::Matching);
        create_filter_view(&conn, ADMIN, &a).await.unwrap();
        create_filter_view(&conn, ADMIN, &b).await.unwrap();

        assert!(remove_filter_view(&conn, ADMIN, &a).await.unwrap());
        assert_eq!(bucket.design_document(ADMIN).unwrap().views.len(), 1);

        assert!(remove_filter_view(&conn, ADMIN, &b).await.unwrap());
        assert!(bucket.design_document(ADMIN).is_none());

        assert!(!remove_filter_view(&conn, ADMIN, &b).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_admin_and_stale_staging() {
        let (bucket, conn) = setup();
        create_filter_view(&conn, ADMIN, &FilterSpec::new(["a"], FilterMode::Matching))
            .await
            .unwrap();
        let stale = DesignDocument::new().with_view("v", ViewDefinition::new("m"));
        bucket
            .upsert_design_document("dev_cb_admin", &stale)
            .await
            .unwrap();

        assert_eq!(cleanup_filter_views(&conn, ADMIN).await.unwrap(), 2);
        assert!(bucket.design_document(ADMIN).is_none());
        assert!(bucket.design_document("dev_cb_admin").is_none());

        assert_eq!(cleanup_filter_views(&conn, ADMIN).await.unwrap(), 0);
    }
}
