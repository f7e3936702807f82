//! `destroy` subcommand for `aws`

use crate::aws::{
    autoscaling, deployer_directory, directory, ec2, ecr, ecs, iam, resolver, secrets, ssm,
    Clients, Config, Error, Metadata, DESTROYED_FILE_NAME,
};
use aws_config::Region;
use std::{fs::File, path::PathBuf};
use tracing::info;

/// Tears down every resource recorded for a stack, in reverse dependency order.
///
/// The stack is named directly or by its configuration file. Resources that no longer exist are
/// skipped, so a partially created (or partially destroyed) stack can always be cleaned up.
pub async fn destroy(config: Option<&PathBuf>, stack: Option<&str>) -> Result<(), Error> {
    let stack = match (stack, config) {
        (Some(stack), _) => stack.to_string(),
        (None, Some(config)) => Config::load(config)?.stack_name,
        (None, None) => return Err(Error::InvalidConfig("no stack provided".into())),
    };
    let stack_directory = deployer_directory(Some(&stack));
    if !stack_directory.exists() {
        return Err(Error::DeploymentDoesNotExist(stack));
    }
    if stack_directory.join(DESTROYED_FILE_NAME).exists() {
        return Err(Error::DeploymentAlreadyDestroyed(stack));
    }
    let metadata = Metadata::load(&stack_directory)?;
    info!(
        stack = stack.as_str(),
        region = metadata.region.as_str(),
        created_at = metadata.created_at,
        "loaded deployment metadata"
    );
    let clients = Clients::new(Region::new(metadata.region.clone())).await;

    // Configuration secret
    if let Some(secret_name) = &metadata.secret_name {
        secrets::delete_secret(&clients.secrets, secret_name).await?;
        info!(secret = secret_name.as_str(), "deleted secret");
    }

    // ECS
    if let Some(arn) = &metadata.task_definition_arn {
        ecs::deregister_task_definition(&clients.ecs, arn).await?;
        info!(task_definition = arn.as_str(), "deregistered task definition");
    }
    if let Some(cluster) = &metadata.cluster {
        ecs::clear_cluster_capacity_providers(&clients.ecs, cluster).await?;
    }
    if let Some(capacity_provider) = &metadata.capacity_provider {
        ecs::delete_capacity_provider(&clients.ecs, capacity_provider).await?;
        info!(capacity_provider = capacity_provider.as_str(), "deleted capacity provider");
    }
    if let Some(group) = &metadata.auto_scaling_group {
        autoscaling::delete_auto_scaling_group(&clients.autoscaling, group).await?;
    }
    if let Some(template_id) = &metadata.launch_template_id {
        ec2::delete_launch_template(&clients.ec2, template_id).await?;
        info!(launch_template = template_id.as_str(), "deleted launch template");
    }
    if let Some(cluster) = &metadata.cluster {
        ecs::delete_cluster(&clients.ecs, cluster).await?;
        info!(cluster = cluster.as_str(), "deleted cluster");
    }
    if let Some(repository) = &metadata.repository {
        ecr::delete_repository(&clients.ecr, repository).await?;
        info!(repository = repository.as_str(), "deleted repository");
    }

    // Windows administration instance and domain join
    if let Some(instance_id) = &metadata.windows_instance_id {
        ec2::terminate_instance(&clients.ec2, instance_id).await?;
    }
    if let Some(association_id) = &metadata.association_id {
        ssm::delete_association(&clients.ssm, association_id).await?;
        info!(association = association_id.as_str(), "deleted domain join association");
    }

    // DNS forwarding
    if let (Some(rule_id), Some(vpc_id)) = (&metadata.resolver_rule_id, &metadata.vpc_id) {
        if metadata.resolver_association_id.is_some() {
            resolver::disassociate_rule(&clients.resolver, rule_id, vpc_id).await?;
            info!(rule = rule_id.as_str(), "disassociated resolver rule");
        }
    }
    if let Some(rule_id) = &metadata.resolver_rule_id {
        resolver::delete_rule(&clients.resolver, rule_id).await?;
        info!(rule = rule_id.as_str(), "deleted resolver rule");
    }
    if let Some(endpoint_id) = &metadata.resolver_endpoint_id {
        resolver::delete_endpoint(&clients.resolver, endpoint_id).await?;
        info!(endpoint = endpoint_id.as_str(), "deleted resolver endpoint");
    }

    // Directory
    if let Some(directory_id) = &metadata.directory_id {
        directory::delete_directory(&clients.directory, directory_id).await?;
        info!(directory = directory_id.as_str(), "deleted directory");
    }

    // IAM
    for profile in &metadata.instance_profiles {
        iam::delete_instance_profile(&clients.iam, profile).await?;
    }
    for role in &metadata.roles {
        iam::delete_role(&clients.iam, role).await?;
    }

    // Network
    if let Some(sg_id) = &metadata.security_group_id {
        ec2::delete_security_group(&clients.ec2, sg_id).await?;
        info!(security_group = sg_id.as_str(), "deleted security group");
    }
    for subnet_id in &metadata.subnet_ids {
        ec2::delete_subnet(&clients.ec2, subnet_id).await?;
        info!(subnet = subnet_id.as_str(), "deleted subnet");
    }
    if let Some(route_table_id) = &metadata.route_table_id {
        ec2::delete_route_table(&clients.ec2, route_table_id).await?;
        info!(route_table = route_table_id.as_str(), "deleted route table");
    }
    if let (Some(igw_id), Some(vpc_id)) = (&metadata.internet_gateway_id, &metadata.vpc_id) {
        ec2::delete_igw(&clients.ec2, igw_id, vpc_id).await?;
        info!(igw = igw_id.as_str(), "deleted internet gateway");
    }
    if let Some(vpc_id) = &metadata.vpc_id {
        ec2::delete_vpc(&clients.ec2, vpc_id).await?;
        info!(vpc = vpc_id.as_str(), "deleted VPC");
    }

    // Mark deployment as destroyed
    File::create(stack_directory.join(DESTROYED_FILE_NAME))?;
    info!(stack = stack.as_str(), "deployment destroyed");
    Ok(())
}
