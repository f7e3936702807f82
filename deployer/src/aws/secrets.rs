//! AWS Secrets Manager SDK function wrappers

use crate::aws::{utils::ignore_not_found, Error};
use aws_sdk_secretsmanager::{
    operation::create_secret::CreateSecretError, Client as SecretsManagerClient,
};
use std::future::Future;
use tracing::info;

/// Secrets Manager operations used to store the stack configuration.
pub trait SecretApi: Send + Sync {
    /// Creates a secret (failing with the raw service error if it already exists).
    fn create_secret(
        &self,
        name: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), CreateSecretError>> + Send;

    /// Adds a new version to an existing secret.
    fn put_secret_value(
        &self,
        name: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

impl SecretApi for SecretsManagerClient {
    async fn create_secret(&self, name: &str, value: &str) -> Result<(), CreateSecretError> {
        self.create_secret()
            .name(name)
            .secret_string(value)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| err.into_service_error())
    }

    async fn put_secret_value(&self, name: &str, value: &str) -> Result<(), Error> {
        self.put_secret_value()
            .secret_id(name)
            .secret_string(value)
            .send()
            .await
            .map_err(aws_sdk_secretsmanager::Error::from)?;
        Ok(())
    }
}

/// Stores `value` under `name`, adding a new version if the secret already exists.
///
/// Returns `true` if the secret was created by this call.
pub async fn put_secret(api: &impl SecretApi, name: &str, value: &str) -> Result<bool, Error> {
    match api.create_secret(name, value).await {
        Ok(()) => {
            info!(secret = name, "created secret");
            Ok(true)
        }
        Err(CreateSecretError::ResourceExistsException(_)) => {
            api.put_secret_value(name, value).await?;
            info!(secret = name, "updated existing secret");
            Ok(false)
        }
        Err(err) => Err(aws_sdk_secretsmanager::Error::from(err).into()),
    }
}

/// Deletes a secret immediately (without a recovery window)
pub async fn delete_secret(client: &SecretsManagerClient, name: &str) -> Result<(), Error> {
    let result = client
        .delete_secret()
        .secret_id(name)
        .force_delete_without_recovery(true)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_secretsmanager::Error::from(err)));
    ignore_not_found(result)?;
    Ok(())
}
