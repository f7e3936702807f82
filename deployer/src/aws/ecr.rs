//! AWS ECR SDK function wrappers and container image publishing
//!
//! Images are built, tagged, and pushed with the `docker` CLI.

use crate::aws::{utils::ignore_not_found, Error};
use aws_sdk_ecr::{operation::create_repository::CreateRepositoryError, Client as EcrClient};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::{future::Future, path::Path, process::Stdio};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::info;

/// Container tool used to build and push images
const DOCKER: &str = "docker";

/// Credentials for a registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryLogin {
    pub username: String,
    pub password: String,
    pub endpoint: String,
}

/// ECR operations used to publish an image.
pub trait RegistryApi: Send + Sync {
    /// Creates a repository (failing with the raw service error if it already exists).
    fn create_repository(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<(), CreateRepositoryError>> + Send;

    /// Returns the URI of an existing repository.
    fn repository_uri(&self, name: &str) -> impl Future<Output = Result<String, Error>> + Send;

    /// Returns the encoded authorization token and proxy endpoint of the registry.
    fn authorization(&self) -> impl Future<Output = Result<(String, String), Error>> + Send;
}

impl RegistryApi for EcrClient {
    async fn create_repository(&self, name: &str) -> Result<(), CreateRepositoryError> {
        self.create_repository()
            .repository_name(name)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| err.into_service_error())
    }

    async fn repository_uri(&self, name: &str) -> Result<String, Error> {
        let resp = self
            .describe_repositories()
            .repository_names(name)
            .send()
            .await
            .map_err(aws_sdk_ecr::Error::from)?;
        resp.repositories()
            .first()
            .and_then(|repository| repository.repository_uri())
            .map(str::to_string)
            .ok_or_else(|| Error::RepositoryNotFound(name.to_string()))
    }

    async fn authorization(&self) -> Result<(String, String), Error> {
        let resp = self
            .get_authorization_token()
            .send()
            .await
            .map_err(aws_sdk_ecr::Error::from)?;
        let data = resp
            .authorization_data()
            .first()
            .ok_or(Error::AuthorizationUnavailable)?;
        match (data.authorization_token(), data.proxy_endpoint()) {
            (Some(token), Some(endpoint)) => Ok((token.to_string(), endpoint.to_string())),
            _ => Err(Error::AuthorizationUnavailable),
        }
    }
}

/// Creates a repository if it does not exist.
///
/// Returns the repository URI and whether the repository was created.
pub async fn ensure_repository(
    api: &impl RegistryApi,
    name: &str,
) -> Result<(String, bool), Error> {
    let created = match api.create_repository(name).await {
        Ok(()) => {
            info!(repository = name, "created repository");
            true
        }
        Err(CreateRepositoryError::RepositoryAlreadyExistsException(_)) => {
            info!(repository = name, "repository already exists");
            false
        }
        Err(err) => return Err(aws_sdk_ecr::Error::from(err).into()),
    };
    let uri = api.repository_uri(name).await?;
    Ok((uri, created))
}

/// Decodes a registry authorization token (`base64(username:password)`)
pub fn decode_token(token: &str, endpoint: &str) -> Result<RegistryLogin, Error> {
    let decoded = String::from_utf8(BASE64.decode(token)?)?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or(Error::InvalidAuthorizationToken)?;
    Ok(RegistryLogin {
        username: username.to_string(),
        password: password.to_string(),
        endpoint: endpoint.to_string(),
    })
}

/// Fetches and decodes registry credentials
pub async fn login_credentials(api: &impl RegistryApi) -> Result<RegistryLogin, Error> {
    let (token, endpoint) = api.authorization().await?;
    decode_token(&token, &endpoint)
}

/// Runs `docker` with `args`, optionally writing `stdin`
async fn docker(args: &[&str], stdin: Option<&str>) -> Result<(), Error> {
    let mut command = Command::new(DOCKER);
    command.args(args);
    if stdin.is_some() {
        command.stdin(Stdio::piped());
    }
    let mut child = command.spawn()?;
    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input.as_bytes()).await?;
        }
    }
    let status = child.wait().await?;
    if !status.success() {
        return Err(Error::ToolFailed {
            tool: DOCKER,
            reason: format!("`docker {}` exited with {status}", args[0]),
        });
    }
    Ok(())
}

/// Builds `dockerfile` and pushes it as `tag` to the repository at `repository_uri`.
///
/// Returns the image URI. The Dockerfile's parent directory is the build context.
pub async fn build_and_push(
    api: &impl RegistryApi,
    dockerfile: &Path,
    repository_uri: &str,
    tag: &str,
) -> Result<String, Error> {
    let image_uri = format!("{repository_uri}:{tag}");
    let login = login_credentials(api).await?;

    let context = dockerfile
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let dockerfile = dockerfile.to_string_lossy();
    let context = context.to_string_lossy();
    docker(&["build", "-f", &dockerfile, "-t", &image_uri, &context], None).await?;
    info!(image = image_uri.as_str(), "built image");

    docker(
        &[
            "login",
            "--username",
            &login.username,
            "--password-stdin",
            &login.endpoint,
        ],
        Some(&login.password),
    )
    .await?;
    docker(&["push", &image_uri], None).await?;
    info!(image = image_uri.as_str(), "pushed image");
    Ok(image_uri)
}

/// Deletes a repository and every image in it
pub async fn delete_repository(client: &EcrClient, name: &str) -> Result<(), Error> {
    let result = client
        .delete_repository()
        .repository_name(name)
        .force(true)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_ecr::Error::from(err)));
    ignore_not_found(result)?;
    Ok(())
}
