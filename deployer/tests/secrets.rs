mod common;

use common::*;
use gmsa_deployer::aws::secrets::put_secret;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_new_secret_is_reported_as_created() {
    let secrets = MockSecrets::default();
    let created = put_secret(&secrets, "gmsa-config", r#"{"stack_name":"stack"}"#)
        .await
        .unwrap();
    assert!(created);
    assert_eq!(
        secrets.value("gmsa-config").as_deref(),
        Some(r#"{"stack_name":"stack"}"#)
    );
    assert_eq!(secrets.put_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_existing_secret_is_updated_not_claimed() {
    let secrets = MockSecrets::with_secret("gmsa-config", "owned elsewhere");
    let created = put_secret(&secrets, "gmsa-config", "new value").await.unwrap();
    assert!(!created);
    assert_eq!(secrets.value("gmsa-config").as_deref(), Some("new value"));
    assert_eq!(secrets.put_calls.load(Ordering::SeqCst), 1);
}
