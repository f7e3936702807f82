mod common;

use common::*;
use gmsa_deployer::aws::{
    ecr::{ensure_repository, login_credentials},
    Error,
};
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_creates_missing_repository() {
    let registry = MockRegistry::new(CreateOutcome::Created);
    let (uri, created) = ensure_repository(&registry, "sample").await.unwrap();
    assert_eq!(uri, REPOSITORY_URI);
    assert!(created);
    assert_eq!(registry.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.describe_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_existing_repository_proceeds_to_describe() {
    let registry = MockRegistry::new(CreateOutcome::AlreadyExists);
    let (uri, created) = ensure_repository(&registry, "sample").await.unwrap();
    assert_eq!(uri, REPOSITORY_URI);
    assert!(!created);
    assert_eq!(registry.describe_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_other_create_errors_propagate() {
    let registry = MockRegistry::new(CreateOutcome::Invalid);
    let err = ensure_repository(&registry, "Not Valid").await.unwrap_err();
    assert!(matches!(err, Error::AwsEcr(_)));
    assert_eq!(registry.describe_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_login_credentials() {
    let registry = MockRegistry::new(CreateOutcome::Created);
    let login = login_credentials(&registry).await.unwrap();
    assert_eq!(login.username, "AWS");
    assert_eq!(login.password, "registry-password");
    assert_eq!(
        login.endpoint,
        "https://123456789012.dkr.ecr.us-west-2.amazonaws.com"
    );
}
