//! AWS Directory Service SDK function wrappers

use crate::aws::{
    template::netbios_name,
    utils::{ignore_not_found, wait_for},
    Error,
};
use aws_sdk_directory::{
    types::{DirectoryDescription, DirectoryEdition, DirectoryStage, DirectoryVpcSettings},
    Client as DirectoryClient,
};
use std::future::Future;
use tracing::info;

/// Directory Service operations used to locate a directory.
pub trait DirectoryApi: Send + Sync {
    /// Returns every directory in the account and region.
    fn directories(&self) -> impl Future<Output = Result<Vec<DirectoryDescription>, Error>> + Send;

    /// Returns the directory with `id`, if it exists.
    fn directory(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<DirectoryDescription>, Error>> + Send;
}

impl DirectoryApi for DirectoryClient {
    async fn directories(&self) -> Result<Vec<DirectoryDescription>, Error> {
        let mut directories = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let resp = self
                .describe_directories()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(aws_sdk_directory::Error::from)?;
            directories.extend(resp.directory_descriptions().iter().cloned());
            match resp.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => return Ok(directories),
            }
        }
    }

    async fn directory(&self, id: &str) -> Result<Option<DirectoryDescription>, Error> {
        let result = self
            .describe_directories()
            .directory_ids(id)
            .send()
            .await
            .map_err(|err| Error::from(aws_sdk_directory::Error::from(err)));
        Ok(ignore_not_found(result)?
            .and_then(|resp| resp.directory_descriptions().first().cloned()))
    }
}

/// Finds a directory by exact name and returns its ID and security group.
pub async fn find_directory_security_group(
    api: &impl DirectoryApi,
    name: &str,
) -> Result<(String, String), Error> {
    let directory_id = api
        .directories()
        .await?
        .iter()
        .find(|directory| directory.name() == Some(name))
        .and_then(|directory| directory.directory_id().map(str::to_string))
        .ok_or_else(|| Error::DirectoryNotFound(name.to_string()))?;
    info!(directory_id, "found directory");

    let details = api
        .directory(&directory_id)
        .await?
        .ok_or_else(|| Error::DirectoryNotFound(name.to_string()))?;
    let security_group_id = details
        .vpc_settings()
        .and_then(|settings| settings.security_group_id())
        .ok_or_else(|| Error::DirectoryMissingSecurityGroup(directory_id.clone()))?
        .to_string();
    Ok((directory_id, security_group_id))
}

/// Classifies a directory's stage: `Some(true)` once active, `Some(false)` while converging.
///
/// Returns an error for stages the directory cannot recover from.
pub fn directory_ready(directory: &DirectoryDescription) -> Result<bool, Error> {
    match directory.stage() {
        Some(DirectoryStage::Active) => Ok(true),
        Some(
            stage @ (DirectoryStage::Failed
            | DirectoryStage::Inoperable
            | DirectoryStage::RestoreFailed
            | DirectoryStage::Deleted),
        ) => Err(Error::DirectoryFailed {
            id: directory.directory_id().unwrap_or_default().to_string(),
            stage: stage.as_str().to_string(),
        }),
        _ => Ok(false),
    }
}

/// Returns the two DNS addresses the directory's domain controllers listen on.
pub fn dns_addresses(directory: &DirectoryDescription) -> Result<[String; 2], Error> {
    match directory.dns_ip_addrs() {
        [first, second, ..] => Ok([first.clone(), second.clone()]),
        _ => Err(Error::DirectoryDnsUnavailable(
            directory.directory_id().unwrap_or_default().to_string(),
        )),
    }
}

/// Creates an AWS Managed Microsoft AD (Standard edition) spanning `subnet_ids`
///
/// The NetBIOS (short) name is the first label of `name`.
pub async fn create_microsoft_ad(
    client: &DirectoryClient,
    name: &str,
    password: &str,
    vpc_id: &str,
    subnet_ids: &[String],
) -> Result<String, Error> {
    let settings = DirectoryVpcSettings::builder()
        .vpc_id(vpc_id)
        .set_subnet_ids(Some(subnet_ids.to_vec()))
        .build()?;
    let resp = client
        .create_microsoft_ad()
        .name(name)
        .short_name(netbios_name(name))
        .password(password)
        .edition(DirectoryEdition::Standard)
        .vpc_settings(settings)
        .send()
        .await
        .map_err(aws_sdk_directory::Error::from)?;
    resp.directory_id()
        .map(str::to_string)
        .ok_or(Error::MissingField("DirectoryId"))
}

/// Waits for a directory to become active and returns its description
pub async fn wait_for_directory_active(
    api: &impl DirectoryApi,
    directory_id: &str,
) -> Result<DirectoryDescription, Error> {
    let directory = wait_for(
        &format!("directory {directory_id} to become active"),
        move || async move {
            let Some(directory) = api.directory(directory_id).await? else {
                return Ok(None);
            };
            Ok(directory_ready(&directory)?.then_some(directory))
        },
    )
    .await?;
    info!(directory_id, "directory active");
    Ok(directory)
}

/// Deletes a directory and waits until it is gone
pub async fn delete_directory(client: &DirectoryClient, directory_id: &str) -> Result<(), Error> {
    let result = client
        .delete_directory()
        .directory_id(directory_id)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_directory::Error::from(err)));
    if ignore_not_found(result)?.is_none() {
        return Ok(());
    }
    wait_for(
        &format!("directory {directory_id} to delete"),
        move || async move {
            let gone = match client.directory(directory_id).await? {
                None => true,
                Some(directory) => directory.stage() == Some(&DirectoryStage::Deleted),
            };
            Ok(gone.then_some(()))
        },
    )
    .await?;
    info!(directory_id, "directory deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(stage: DirectoryStage, ips: &[&str]) -> DirectoryDescription {
        DirectoryDescription::builder()
            .directory_id("d-1234567890")
            .name("contoso.com")
            .stage(stage)
            .set_dns_ip_addrs(Some(ips.iter().map(|ip| ip.to_string()).collect()))
            .build()
    }

    #[test]
    fn test_directory_ready() {
        assert!(directory_ready(&directory(DirectoryStage::Active, &[])).unwrap());
        assert!(!directory_ready(&directory(DirectoryStage::Creating, &[])).unwrap());
        assert!(!directory_ready(&directory(DirectoryStage::Requested, &[])).unwrap());
        let err = directory_ready(&directory(DirectoryStage::Failed, &[])).unwrap_err();
        assert!(matches!(err, Error::DirectoryFailed { stage, .. } if stage == "Failed"));
    }

    #[test]
    fn test_dns_addresses() {
        let ips = dns_addresses(&directory(
            DirectoryStage::Active,
            &["10.0.0.10", "10.0.1.10"],
        ))
        .unwrap();
        assert_eq!(ips, ["10.0.0.10".to_string(), "10.0.1.10".to_string()]);

        let err = dns_addresses(&directory(DirectoryStage::Active, &["10.0.0.10"])).unwrap_err();
        assert!(matches!(err, Error::DirectoryDnsUnavailable(id) if id == "d-1234567890"));
    }
}
