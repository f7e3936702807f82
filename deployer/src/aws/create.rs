//! `create` subcommand for `aws`

use crate::aws::{
    autoscaling, deployer_directory, directory, ec2, ecr, ecs,
    iam::{self, RoleSpec},
    process_env, resolver, secrets, ssm,
    template::{linux_user_data, WINDOWS_USER_DATA},
    utils::now,
    Clients, Config, Error, Metadata, AUTO_SCALING_GROUP_NAME, CAPACITY_PROVIDER_NAME,
    CREATED_FILE_NAME,
};
use aws_config::Region;
use std::{
    fs::File,
    path::{Path, PathBuf},
};
use tracing::info;

/// CIDR block of the stack VPC
const VPC_CIDR: &str = "10.0.0.0/16";

/// Instance type of the Windows administration instance
const WINDOWS_INSTANCE_TYPE: &str = "t3.xlarge";

/// Instance type of the ECS hosts
const ECS_INSTANCE_TYPE: &str = "t3.xlarge";

/// Creates a role, records it, then attaches its policies. Returns the role ARN.
async fn create_role(
    clients: &Clients,
    metadata: &mut Metadata,
    directory: &Path,
    spec: &RoleSpec<'_>,
) -> Result<String, Error> {
    let arn = iam::create_role(&clients.iam, spec).await?;
    metadata.record(directory, |m| m.roles.push(spec.name.to_string()))?;
    iam::attach_role_policies(&clients.iam, spec).await?;
    Ok(arn)
}

/// Creates a role and an instance profile of the same name for EC2 instances
async fn create_instance_role(
    clients: &Clients,
    metadata: &mut Metadata,
    directory: &Path,
    name: &str,
    policies: &[&str],
) -> Result<(), Error> {
    let spec = RoleSpec {
        name,
        principal: iam::EC2_PRINCIPAL,
        managed_policies: policies,
        inline_policy: None,
    };
    create_role(clients, metadata, directory, &spec).await?;

    iam::create_instance_profile(&clients.iam, name).await?;
    metadata.record(directory, |m| m.instance_profiles.push(name.to_string()))?;
    iam::add_role_to_instance_profile(&clients.iam, name, name).await
}

/// Provisions every resource of the stack described by the configuration at `config`
pub async fn create(config: &PathBuf) -> Result<(), Error> {
    // Load configuration from JSON file
    let config = Config::load(config)?;
    let stack = config.stack_name.as_str();
    let region = config.region(process_env)?;
    let bucket = config.bucket_name(process_env)?;
    info!(stack, region = region.as_str(), "loaded configuration");

    // Refuse to reuse the state of a previous attempt
    let stack_directory = deployer_directory(Some(stack));
    if stack_directory.exists() {
        return Err(Error::CreationAttempted(stack.to_string()));
    }
    std::fs::create_dir_all(&stack_directory)?;
    info!(path = ?stack_directory, "created stack directory");

    // Persist deployment metadata early to enable `destroy` on failure
    let mut metadata = Metadata {
        stack_name: stack.to_string(),
        region: region.clone(),
        created_at: now(),
        ..Default::default()
    };
    metadata.persist(&stack_directory)?;
    let clients = Clients::new(Region::new(region)).await;

    // Network
    let zones = ec2::find_availability_zones(&clients.ec2).await?;
    info!(?zones, "found availability zones");
    let vpc_id = ec2::create_vpc(&clients.ec2, VPC_CIDR, stack).await?;
    metadata.record(&stack_directory, |m| m.vpc_id = Some(vpc_id.clone()))?;
    ec2::enable_vpc_dns(&clients.ec2, &vpc_id).await?;
    info!(vpc = vpc_id.as_str(), "created VPC");

    let igw_id = ec2::create_internet_gateway(&clients.ec2, stack).await?;
    metadata.record(&stack_directory, |m| {
        m.internet_gateway_id = Some(igw_id.clone())
    })?;
    ec2::attach_internet_gateway(&clients.ec2, &igw_id, &vpc_id).await?;
    info!(igw = igw_id.as_str(), vpc = vpc_id.as_str(), "created and attached IGW");

    let route_table_id = ec2::create_route_table(&clients.ec2, &vpc_id, stack).await?;
    metadata.record(&stack_directory, |m| {
        m.route_table_id = Some(route_table_id.clone())
    })?;
    ec2::add_default_route(&clients.ec2, &route_table_id, &igw_id).await?;
    info!(route_table = route_table_id.as_str(), "created route table");

    for (idx, az) in zones.iter().enumerate() {
        let cidr = format!("10.0.{idx}.0/24");
        let name = format!("{stack}-subnet-{}", idx + 1);
        let subnet_id =
            ec2::create_subnet(&clients.ec2, &vpc_id, &cidr, az, &name, stack).await?;
        metadata.record(&stack_directory, |m| m.subnet_ids.push(subnet_id.clone()))?;
        ec2::make_subnet_public(&clients.ec2, &subnet_id, &route_table_id).await?;
        info!(subnet = subnet_id.as_str(), az = az.as_str(), "created subnet");
    }
    let subnet_ids = metadata.subnet_ids.clone();

    let sg_id = ec2::create_security_group(&clients.ec2, &vpc_id, stack).await?;
    metadata.record(&stack_directory, |m| {
        m.security_group_id = Some(sg_id.clone())
    })?;
    ec2::authorize_stack_ingress(&clients.ec2, &sg_id, &config.prefix_list).await?;
    info!(security_group = sg_id.as_str(), "created security group");

    // Directory
    let directory_id = directory::create_microsoft_ad(
        &clients.directory,
        &config.directory_name,
        &config.domain_admin_password,
        &vpc_id,
        &subnet_ids,
    )
    .await?;
    metadata.directory_id = Some(directory_id.clone());
    metadata.persist(&stack_directory)?;
    info!(
        directory = directory_id.as_str(),
        name = config.directory_name.as_str(),
        "requested directory"
    );
    let description =
        directory::wait_for_directory_active(&clients.directory, &directory_id).await?;
    let dns_ips = directory::dns_addresses(&description)?;
    info!(?dns_ips, "directory DNS available");

    // DNS forwarding to the directory
    let endpoint_id =
        resolver::create_outbound_endpoint(&clients.resolver, &subnet_ids, &sg_id).await?;
    metadata.record(&stack_directory, |m| {
        m.resolver_endpoint_id = Some(endpoint_id.clone())
    })?;
    resolver::wait_for_endpoint(&clients.resolver, &endpoint_id).await?;

    let rule_id = resolver::create_forward_rule(
        &clients.resolver,
        &config.directory_name,
        &endpoint_id,
        &dns_ips,
    )
    .await?;
    metadata.record(&stack_directory, |m| m.resolver_rule_id = Some(rule_id.clone()))?;
    resolver::wait_for_rule(&clients.resolver, &rule_id).await?;

    let rule_association_id = resolver::associate_rule(
        &clients.resolver,
        &rule_id,
        &vpc_id,
        &format!("{stack}-resolver-rule-association"),
    )
    .await?;
    metadata.record(&stack_directory, |m| {
        m.resolver_association_id = Some(rule_association_id.clone())
    })?;
    resolver::wait_for_rule_association(&clients.resolver, &rule_association_id).await?;

    // Domain join for the Windows instance
    let association_id = ssm::create_join_domain_association(
        &clients.ssm,
        &config.windows_instance_tag,
        &config.directory_name,
        &directory_id,
    )
    .await?;
    metadata.association_id = Some(association_id);
    metadata.persist(&stack_directory)?;

    // Windows administration instance
    let windows_role = format!("{stack}-WindowsInstanceRole");
    create_instance_role(
        &clients,
        &mut metadata,
        &stack_directory,
        &windows_role,
        iam::WINDOWS_INSTANCE_POLICIES,
    )
    .await?;
    let windows_ami = ssm::get_parameter(&clients.ssm, ssm::WINDOWS_AMI_PARAMETER).await?;
    info!(ami = windows_ami.as_str(), "found Windows AMI");
    let windows_instance_id = ec2::launch_instance(
        &clients.ec2,
        &ec2::InstanceRequest {
            image_id: &windows_ami,
            instance_type: WINDOWS_INSTANCE_TYPE,
            key_name: &config.key_pair_name,
            subnet_id: &subnet_ids[0],
            security_group_id: &sg_id,
            instance_profile: &windows_role,
            user_data: WINDOWS_USER_DATA,
            name: &config.windows_instance_tag,
            stack,
        },
    )
    .await?;
    metadata.windows_instance_id = Some(windows_instance_id.clone());
    metadata.persist(&stack_directory)?;
    ec2::wait_for_instance_running(&clients.ec2, &windows_instance_id).await?;

    // ECS cluster
    ecs::create_cluster(&clients.ecs, &config.ecs_cluster_name).await?;
    metadata.cluster = Some(config.ecs_cluster_name.clone());
    metadata.persist(&stack_directory)?;

    let ecs_role = format!("{stack}-EcsInstanceRole");
    create_instance_role(
        &clients,
        &mut metadata,
        &stack_directory,
        &ecs_role,
        iam::ECS_INSTANCE_POLICIES,
    )
    .await?;
    let ecs_ami = ssm::get_parameter(&clients.ssm, ssm::ECS_AMI_PARAMETER).await?;
    info!(ami = ecs_ami.as_str(), "found ECS-optimized AMI");
    let user_data = linux_user_data(&bucket, &config.rpm_file, &config.ecs_cluster_name);
    let launch_template_id = ec2::create_launch_template(
        &clients.ec2,
        &format!("{stack}-ecs-launch-template"),
        &ecs_ami,
        ECS_INSTANCE_TYPE,
        &config.key_pair_name,
        &ecs_role,
        &sg_id,
        &user_data,
    )
    .await?;
    metadata.launch_template_id = Some(launch_template_id.clone());
    metadata.persist(&stack_directory)?;
    info!(launch_template = launch_template_id.as_str(), "created launch template");

    let group_name = format!("{stack}-{AUTO_SCALING_GROUP_NAME}");
    autoscaling::create_auto_scaling_group(
        &clients.autoscaling,
        &group_name,
        &launch_template_id,
        &subnet_ids,
        &config.auto_scaling_instance_name(),
    )
    .await?;
    metadata.record(&stack_directory, |m| {
        m.auto_scaling_group = Some(group_name.clone())
    })?;
    let group_arn = autoscaling::group_arn(&clients.autoscaling, &group_name).await?;

    let capacity_provider = format!("{stack}-{CAPACITY_PROVIDER_NAME}");
    ecs::create_capacity_provider(&clients.ecs, &capacity_provider, &group_arn).await?;
    metadata.capacity_provider = Some(capacity_provider.clone());
    metadata.persist(&stack_directory)?;
    ecs::set_cluster_capacity_provider(&clients.ecs, &config.ecs_cluster_name, &capacity_provider)
        .await?;

    // Container image
    if let Some(image) = &config.image {
        let (repository_uri, created) =
            ecr::ensure_repository(&clients.ecr, &image.repository).await?;
        if created {
            metadata.record(&stack_directory, |m| {
                m.repository = Some(image.repository.clone())
            })?;
        }
        let image_uri =
            ecr::build_and_push(&clients.ecr, &image.dockerfile, &repository_uri, &image.tag)
                .await?;
        metadata.record(&stack_directory, |m| m.image_uri = Some(image_uri))?;
    }

    // Task definition
    let task_role = format!("{stack}-ECSTaskExecutionRolegMSA");
    let task_role_arn = create_role(
        &clients,
        &mut metadata,
        &stack_directory,
        &RoleSpec {
            name: &task_role,
            principal: iam::ECS_TASKS_PRINCIPAL,
            managed_policies: iam::TASK_POLICIES,
            inline_policy: Some((iam::SSM_MESSAGES_POLICY_NAME, iam::ssm_messages_policy())),
        },
    )
    .await?;

    let image = metadata.image_uri.as_deref().unwrap_or(ecs::CONTAINER_IMAGE);
    let task_definition_arn = ecs::register_task_definition(
        &clients.ecs,
        &config.task_definition_template_name,
        &task_role_arn,
        image,
    )
    .await?;
    metadata.task_definition_arn = Some(task_definition_arn);
    metadata.persist(&stack_directory)?;

    // Configuration secret
    if let Some(secret_name) = &config.secret_name {
        let value = serde_json::to_string(&config)?;
        if secrets::put_secret(&clients.secrets, secret_name, &value).await? {
            metadata.record(&stack_directory, |m| {
                m.secret_name = Some(secret_name.clone())
            })?;
        }
    }

    // Mark deployment as complete
    File::create(stack_directory.join(CREATED_FILE_NAME))?;
    info!(
        stack,
        directory = directory_id.as_str(),
        windows_instance = windows_instance_id.as_str(),
        cluster = config.ecs_cluster_name.as_str(),
        "deployment complete"
    );
    Ok(())
}
