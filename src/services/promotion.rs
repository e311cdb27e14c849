//! Post-commit object moves.
//!
//! Everything here runs after the pointer swap has committed, so it only
//! touches the object store and is safe to repeat: promotion is keyed off the
//! committed object key alone and skips the copy when the final object is
//! already in place.

use crate::models::staging_key;
use crate::storage::{ObjectStore, StoreError, StoreResult, with_timeout};
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Make `object_key` present in the committed namespace.
///
/// Returns `true` when a copy was made and `false` when the final object
/// already existed.
pub async fn promote(store: &dyn ObjectStore, limit: Duration, object_key: &str) -> StoreResult<bool> {
    if with_timeout(limit, "stat", object_key, store.stat(object_key))
        .await?
        .is_some()
    {
        debug!(object_key, "final object already present, skipping copy");
        return Ok(false);
    }
    let staged = staging_key(object_key);
    with_timeout(limit, "copy", &staged, store.copy(&staged, object_key)).await?;
    Ok(true)
}

/// Delete `keys` concurrently. One failure never cancels the others.
///
/// Returns the keys that could not be deleted.
pub async fn reclaim(store: &dyn ObjectStore, limit: Duration, keys: Vec<String>) -> Vec<String> {
    let deletes = keys.into_iter().map(|key| async move {
        match with_timeout(limit, "delete", &key, store.delete(&key)).await {
            Ok(()) => None,
            Err(err) => {
                warn!(object_key = %key, error = %err, "object left behind after commit");
                Some(key)
            }
        }
    });
    join_all(deletes).await.into_iter().flatten().collect()
}

/// Promote the new object, then reclaim its staged copy and the replaced avatar.
///
/// A promotion failure skips the cleanup so the staged bytes stay available to
/// a later resume. On success the keys that leaked are returned.
pub async fn finish(
    store: Arc<dyn ObjectStore>,
    limit: Duration,
    object_key: String,
    replaced: Option<String>,
) -> Result<Vec<String>, StoreError> {
    promote(store.as_ref(), limit, &object_key).await?;

    let mut leftovers = vec![staging_key(&object_key)];
    leftovers.extend(replaced.filter(|old| *old != object_key));
    Ok(reclaim(store.as_ref(), limit, leftovers).await)
}
