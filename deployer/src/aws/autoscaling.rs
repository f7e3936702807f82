//! AWS Auto Scaling SDK function wrappers

use crate::aws::{
    utils::{ignore_not_found, wait_for},
    Error,
};
use aws_sdk_autoscaling::{
    types::{AutoScalingGroup, LaunchTemplateSpecification, Tag},
    Client as AutoScalingClient,
};
use tracing::info;

/// Launch template version used by the group
const LATEST_VERSION: &str = "$Latest";

/// Describes a group by name (or `None` if it does not exist)
async fn describe_group(
    client: &AutoScalingClient,
    name: &str,
) -> Result<Option<AutoScalingGroup>, Error> {
    let resp = client
        .describe_auto_scaling_groups()
        .auto_scaling_group_names(name)
        .send()
        .await
        .map_err(aws_sdk_autoscaling::Error::from)?;
    Ok(resp.auto_scaling_groups().first().cloned())
}

/// Creates a single-instance group from a launch template.
///
/// Instances inherit the `Name` tag `instance_name`.
pub async fn create_auto_scaling_group(
    client: &AutoScalingClient,
    name: &str,
    launch_template_id: &str,
    subnet_ids: &[String],
    instance_name: &str,
) -> Result<(), Error> {
    client
        .create_auto_scaling_group()
        .auto_scaling_group_name(name)
        .launch_template(
            LaunchTemplateSpecification::builder()
                .launch_template_id(launch_template_id)
                .version(LATEST_VERSION)
                .build(),
        )
        .min_size(1)
        .max_size(1)
        .desired_capacity(1)
        .vpc_zone_identifier(subnet_ids.join(","))
        .tags(
            Tag::builder()
                .resource_id(name)
                .resource_type("auto-scaling-group")
                .key("Name")
                .value(instance_name)
                .propagate_at_launch(true)
                .build()?,
        )
        .send()
        .await
        .map_err(aws_sdk_autoscaling::Error::from)?;
    info!(group = name, "created auto scaling group");
    Ok(())
}

/// Returns the ARN of an existing group
pub async fn group_arn(client: &AutoScalingClient, name: &str) -> Result<String, Error> {
    let group = describe_group(client, name)
        .await?
        .ok_or(Error::MissingField("AutoScalingGroup"))?;
    group
        .auto_scaling_group_arn()
        .map(str::to_string)
        .ok_or(Error::MissingField("AutoScalingGroupARN"))
}

/// Deletes a group along with its instances and waits until it is gone
pub async fn delete_auto_scaling_group(client: &AutoScalingClient, name: &str) -> Result<(), Error> {
    let result = client
        .delete_auto_scaling_group()
        .auto_scaling_group_name(name)
        .force_delete(true)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_autoscaling::Error::from(err)));
    if ignore_not_found(result)?.is_none() {
        return Ok(());
    }
    wait_for(&format!("auto scaling group {name} deletion"), move || async move {
        Ok(describe_group(client, name).await?.is_none().then_some(()))
    })
    .await?;
    info!(group = name, "deleted auto scaling group");
    Ok(())
}
