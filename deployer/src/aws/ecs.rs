//! AWS ECS SDK function wrappers

use crate::aws::{utils::ignore_not_found, Error};
use aws_sdk_ecs::{
    types::{
        AutoScalingGroupProvider, CapacityProviderStrategyItem, ClusterSetting,
        ClusterSettingName, Compatibility, ContainerDefinition, ManagedScaling,
        ManagedScalingStatus, ManagedTerminationProtection, NetworkMode,
    },
    Client as EcsClient,
};
use tracing::info;

/// Image run by the task definition
pub const CONTAINER_IMAGE: &str = "nginx:latest";

/// Name of the container in the task definition
pub const CONTAINER_NAME: &str = "MyContainer";

/// Task CPU units
const TASK_CPU: &str = "1024";

/// Task memory (MiB)
const TASK_MEMORY: &str = "2048";

/// Soft memory limit of the container (MiB)
const CONTAINER_MEMORY_RESERVATION: i32 = 128;

/// Seconds to wait for container dependencies before giving up
const CONTAINER_START_TIMEOUT: i32 = 120;

/// Seconds to wait before the container is killed on stop
const CONTAINER_STOP_TIMEOUT: i32 = 60;

/// Target utilization of the capacity provider's managed scaling
const TARGET_CAPACITY: i32 = 100;

/// Creates a cluster with container insights enabled and returns its ARN
pub async fn create_cluster(client: &EcsClient, name: &str) -> Result<String, Error> {
    let resp = client
        .create_cluster()
        .cluster_name(name)
        .settings(
            ClusterSetting::builder()
                .name(ClusterSettingName::ContainerInsights)
                .value("enabled")
                .build(),
        )
        .send()
        .await
        .map_err(aws_sdk_ecs::Error::from)?;
    let arn = resp
        .cluster()
        .and_then(|cluster| cluster.cluster_arn())
        .ok_or(Error::MissingField("ClusterArn"))?
        .to_string();
    info!(cluster = name, "created cluster");
    Ok(arn)
}

/// Creates a capacity provider backed by an Auto Scaling group
pub async fn create_capacity_provider(
    client: &EcsClient,
    name: &str,
    auto_scaling_group_arn: &str,
) -> Result<(), Error> {
    client
        .create_capacity_provider()
        .name(name)
        .auto_scaling_group_provider(
            AutoScalingGroupProvider::builder()
                .auto_scaling_group_arn(auto_scaling_group_arn)
                .managed_scaling(
                    ManagedScaling::builder()
                        .status(ManagedScalingStatus::Enabled)
                        .target_capacity(TARGET_CAPACITY)
                        .build(),
                )
                .managed_termination_protection(ManagedTerminationProtection::Disabled)
                .build()?,
        )
        .send()
        .await
        .map_err(aws_sdk_ecs::Error::from)?;
    info!(capacity_provider = name, "created capacity provider");
    Ok(())
}

/// Makes `capacity_provider` the only (and default) provider of `cluster`
pub async fn set_cluster_capacity_provider(
    client: &EcsClient,
    cluster: &str,
    capacity_provider: &str,
) -> Result<(), Error> {
    client
        .put_cluster_capacity_providers()
        .cluster(cluster)
        .capacity_providers(capacity_provider)
        .default_capacity_provider_strategy(
            CapacityProviderStrategyItem::builder()
                .capacity_provider(capacity_provider)
                .weight(1)
                .build()?,
        )
        .send()
        .await
        .map_err(aws_sdk_ecs::Error::from)?;
    info!(cluster, capacity_provider, "attached capacity provider");
    Ok(())
}

/// Registers the task definition and returns its ARN
pub async fn register_task_definition(
    client: &EcsClient,
    family: &str,
    task_role_arn: &str,
    image: &str,
) -> Result<String, Error> {
    let resp = client
        .register_task_definition()
        .family(family)
        .requires_compatibilities(Compatibility::Ec2)
        .requires_compatibilities(Compatibility::Fargate)
        .network_mode(NetworkMode::Awsvpc)
        .cpu(TASK_CPU)
        .memory(TASK_MEMORY)
        .task_role_arn(task_role_arn)
        .execution_role_arn(task_role_arn)
        .container_definitions(
            ContainerDefinition::builder()
                .name(CONTAINER_NAME)
                .image(image)
                .essential(true)
                .memory_reservation(CONTAINER_MEMORY_RESERVATION)
                .start_timeout(CONTAINER_START_TIMEOUT)
                .stop_timeout(CONTAINER_STOP_TIMEOUT)
                .build(),
        )
        .send()
        .await
        .map_err(aws_sdk_ecs::Error::from)?;
    let arn = resp
        .task_definition()
        .and_then(|definition| definition.task_definition_arn())
        .ok_or(Error::MissingField("TaskDefinitionArn"))?
        .to_string();
    info!(task_definition = arn.as_str(), "registered task definition");
    Ok(arn)
}

/// Detaches every capacity provider from a cluster
pub async fn clear_cluster_capacity_providers(client: &EcsClient, cluster: &str) -> Result<(), Error> {
    let result = client
        .put_cluster_capacity_providers()
        .cluster(cluster)
        .set_capacity_providers(Some(Vec::new()))
        .set_default_capacity_provider_strategy(Some(Vec::new()))
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_ecs::Error::from(err)));
    ignore_not_found(result)?;
    Ok(())
}

/// Deletes a capacity provider
pub async fn delete_capacity_provider(client: &EcsClient, name: &str) -> Result<(), Error> {
    let result = client
        .delete_capacity_provider()
        .capacity_provider(name)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_ecs::Error::from(err)));
    ignore_not_found(result)?;
    Ok(())
}

/// Deregisters a task definition revision
pub async fn deregister_task_definition(client: &EcsClient, arn: &str) -> Result<(), Error> {
    let result = client
        .deregister_task_definition()
        .task_definition(arn)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_ecs::Error::from(err)));
    ignore_not_found(result)?;
    Ok(())
}

/// Deletes a cluster
pub async fn delete_cluster(client: &EcsClient, cluster: &str) -> Result<(), Error> {
    let result = client
        .delete_cluster()
        .cluster(cluster)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_ecs::Error::from(err)));
    ignore_not_found(result)?;
    Ok(())
}
