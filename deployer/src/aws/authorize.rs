//! `authorize` subcommand for `aws`

use crate::aws::{
    check_deployment, deployer_directory,
    directory::{find_directory_security_group, DirectoryApi},
    ec2::InstanceApi,
    process_env, Clients, Config, Error,
};
use aws_config::Region;
use std::path::PathBuf;
use tracing::info;

/// Allows all traffic from the directory's security group into the security group of the first
/// running instance tagged `instance_name`.
pub async fn add_directory_ingress(
    directories: &impl DirectoryApi,
    instances: &impl InstanceApi,
    directory_name: &str,
    instance_name: &str,
) -> Result<(), Error> {
    let (directory_id, directory_sg) =
        find_directory_security_group(directories, directory_name).await?;
    info!(
        directory = directory_id.as_str(),
        security_group = directory_sg.as_str(),
        "found directory security group"
    );

    let running = instances.running_instances(instance_name).await?;
    let instance = running
        .first()
        .ok_or_else(|| Error::InstanceNotFound(instance_name.to_string()))?;
    let instance_id = instance.instance_id().unwrap_or_default();
    let instance_sg = instance
        .security_groups()
        .first()
        .and_then(|group| group.group_id())
        .ok_or_else(|| Error::NoSecurityGroups(instance_id.to_string()))?;

    let added = instances
        .authorize_ingress_from_group(instance_sg, &directory_sg)
        .await?;
    if added {
        info!(
            instance = instance_id,
            security_group = instance_sg,
            source = directory_sg.as_str(),
            "added inbound rule"
        );
    } else {
        info!(
            instance = instance_id,
            security_group = instance_sg,
            source = directory_sg.as_str(),
            "inbound rule already exists"
        );
    }
    Ok(())
}

/// Adds the directory's security group to the inbound rules of the ECS host (or `instance`)
pub async fn authorize(config: &PathBuf, instance: Option<String>) -> Result<(), Error> {
    let config = Config::load(config)?;
    let stack = config.stack_name.as_str();
    check_deployment(&deployer_directory(Some(stack)), stack);

    let region = config.region(process_env)?;
    let clients = Clients::new(Region::new(region)).await;
    let instance = instance.unwrap_or_else(|| config.auto_scaling_instance_name());
    info!(stack, instance = instance.as_str(), "authorizing directory traffic");
    add_directory_ingress(
        &clients.directory,
        &clients.ec2,
        &config.directory_name,
        &instance,
    )
    .await
}
