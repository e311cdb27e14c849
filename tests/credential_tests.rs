// Credential issuance: ledger replacement, scoping and failure behaviour.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::memory_store::ANY_KEY;
use common::{Op, TestContext, create_user, pending_for};
use scheduler_avatars::services::avatar_service::AvatarError;
use scheduler_avatars::storage::{SizeRange, StoreError};
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn test_issue_records_one_intent_with_ledger_expiry() {
    let ctx = TestContext::new().await;
    let user = create_user(&ctx.db, "ada@example.com").await;

    let before = Utc::now();
    let credential = ctx.service.issue_upload_credential(user.id).await.unwrap();

    assert!(credential.object_key.starts_with("avatars/"));
    assert!(credential.object_key.ends_with(".webp"));
    assert_eq!(credential.upload_url, "memory://avatars");
    assert_eq!(
        credential.form_fields["key"],
        format!("pending/{}", credential.object_key)
    );

    let rows = pending_for(&ctx.db, user.id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].object_key, credential.object_key);
    // The intent outlives the credential by a wide margin.
    assert!(rows[0].expires_at >= before + ChronoDuration::hours(24));
    assert!(rows[0].expires_at > credential.expires_at);
}

#[tokio::test]
async fn test_credential_is_scoped_to_staging_key_and_size() {
    let ctx = TestContext::new().await;
    let user = create_user(&ctx.db, "ada@example.com").await;

    let credential = ctx.service.issue_upload_credential(user.id).await.unwrap();

    let posts = ctx.store.issued_posts();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].key, format!("pending/{}", credential.object_key));
    assert_eq!(posts[0].ttl, Duration::from_secs(180));
    assert_eq!(
        posts[0].size,
        SizeRange {
            min: 1,
            max: 2 * 1024 * 1024
        }
    );
}

#[tokio::test]
async fn test_reissue_supersedes_prior_intent() {
    let ctx = TestContext::new().await;
    let user = create_user(&ctx.db, "ada@example.com").await;

    let first = ctx.service.issue_upload_credential(user.id).await.unwrap();
    let second = ctx.service.issue_upload_credential(user.id).await.unwrap();
    assert_ne!(first.object_key, second.object_key);

    let rows = pending_for(&ctx.db, user.id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].object_key, second.object_key);
}

#[tokio::test]
async fn test_intents_are_per_user() {
    let ctx = TestContext::new().await;
    let ada = create_user(&ctx.db, "ada@example.com").await;
    let grace = create_user(&ctx.db, "grace@example.com").await;

    ctx.service.issue_upload_credential(ada.id).await.unwrap();
    ctx.service.issue_upload_credential(grace.id).await.unwrap();
    ctx.service.issue_upload_credential(ada.id).await.unwrap();

    assert_eq!(pending_for(&ctx.db, ada.id).await.len(), 1);
    assert_eq!(pending_for(&ctx.db, grace.id).await.len(), 1);
}

#[tokio::test]
async fn test_signing_failure_keeps_prior_intent() {
    let ctx = TestContext::new().await;
    let user = create_user(&ctx.db, "ada@example.com").await;
    let first = ctx.service.issue_upload_credential(user.id).await.unwrap();

    ctx.store.fail(Op::PresignPost, ANY_KEY);
    let err = ctx.service.issue_upload_credential(user.id).await.unwrap_err();
    assert!(matches!(err, AvatarError::Storage(_)), "got {err:?}");

    let rows = pending_for(&ctx.db, user.id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].object_key, first.object_key);
}

#[tokio::test]
async fn test_issue_for_unknown_user() {
    let ctx = TestContext::new().await;
    let ghost = Uuid::new_v4();

    let err = ctx.service.issue_upload_credential(ghost).await.unwrap_err();
    assert!(matches!(err, AvatarError::UserNotFound(id) if id == ghost));
    assert!(pending_for(&ctx.db, ghost).await.is_empty());
}

#[tokio::test]
async fn test_slow_signing_times_out() {
    let ctx = TestContext::new().await;
    let user = create_user(&ctx.db, "ada@example.com").await;
    ctx.store.delay(Op::PresignPost, Duration::from_secs(2));

    let err = ctx.service.issue_upload_credential(user.id).await.unwrap_err();
    assert!(matches!(
        err,
        AvatarError::Storage(StoreError::Timeout {
            op: "presign_post_policy",
            ..
        })
    ));
    assert!(pending_for(&ctx.db, user.id).await.is_empty());
}
