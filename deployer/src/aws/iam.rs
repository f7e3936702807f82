//! AWS IAM SDK function wrappers
//!
//! Roles are created with AWS managed policies only (plus one inline policy for ECS Exec).

use crate::aws::{utils::ignore_not_found, Error};
use aws_sdk_iam::Client as IamClient;
use futures::future::try_join_all;
use serde_json::json;
use tracing::info;

/// Prefix of AWS managed policy ARNs
const MANAGED_POLICY_PREFIX: &str = "arn:aws:iam::aws:policy/";

/// Managed policies attached to the Windows administration instance
pub const WINDOWS_INSTANCE_POLICIES: &[&str] = &[
    "AmazonS3FullAccess",
    "AmazonSSMDirectoryServiceAccess",
    "AWSDirectoryServiceFullAccess",
    "SecretsManagerReadWrite",
    "AmazonSSMManagedInstanceCore",
];

/// Managed policies attached to the ECS container instances
pub const ECS_INSTANCE_POLICIES: &[&str] = &[
    "service-role/AmazonEC2ContainerServiceforEC2Role",
    "AmazonECS_FullAccess",
    "SecretsManagerReadWrite",
    "AmazonSSMFullAccess",
    "AmazonS3FullAccess",
    "AWSDirectoryServiceFullAccess",
];

/// Managed policies attached to the ECS task (and task execution) role
pub const TASK_POLICIES: &[&str] = &[
    "SecretsManagerReadWrite",
    "AmazonS3FullAccess",
    "AWSDirectoryServiceFullAccess",
    "AmazonSSMFullAccess",
    "AmazonECS_FullAccess",
    "AmazonEC2ContainerRegistryFullAccess",
    "AmazonElasticContainerRegistryPublicFullAccess",
];

/// Name of the inline policy granting the SSM message channels used by ECS Exec
pub const SSM_MESSAGES_POLICY_NAME: &str = "ssm-messages";

/// Principal for roles assumed by EC2 instances
pub const EC2_PRINCIPAL: &str = "ec2.amazonaws.com";

/// Principal for roles assumed by ECS tasks
pub const ECS_TASKS_PRINCIPAL: &str = "ecs-tasks.amazonaws.com";

/// Definition of a role to create.
pub struct RoleSpec<'a> {
    pub name: &'a str,
    pub principal: &'a str,
    pub managed_policies: &'a [&'a str],
    pub inline_policy: Option<(&'a str, String)>,
}

/// Returns the ARN of an AWS managed policy
pub fn managed_policy_arn(name: &str) -> String {
    format!("{MANAGED_POLICY_PREFIX}{name}")
}

/// Trust policy allowing `principal` to assume a role
pub fn assume_role_policy(principal: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": principal },
            "Action": "sts:AssumeRole"
        }]
    })
    .to_string()
}

/// Policy allowing the SSM message channels used by ECS Exec
pub fn ssm_messages_policy() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": [
                "ssmmessages:CreateControlChannel",
                "ssmmessages:CreateDataChannel",
                "ssmmessages:OpenControlChannel",
                "ssmmessages:OpenDataChannel"
            ],
            "Resource": "*"
        }]
    })
    .to_string()
}

/// Creates a role assumable by `spec.principal` and returns its ARN
///
/// Policies are attached separately by [attach_role_policies].
pub async fn create_role(client: &IamClient, spec: &RoleSpec<'_>) -> Result<String, Error> {
    let resp = client
        .create_role()
        .role_name(spec.name)
        .assume_role_policy_document(assume_role_policy(spec.principal))
        .send()
        .await
        .map_err(aws_sdk_iam::Error::from)?;
    let arn = resp
        .role()
        .map(|role| role.arn().to_string())
        .ok_or(Error::MissingField("Role"))?;
    info!(role = spec.name, arn, "created role");
    Ok(arn)
}

/// Attaches the managed policies and the inline policy of `spec` to its role
pub async fn attach_role_policies(client: &IamClient, spec: &RoleSpec<'_>) -> Result<(), Error> {
    try_join_all(spec.managed_policies.iter().map(|policy| async move {
        client
            .attach_role_policy()
            .role_name(spec.name)
            .policy_arn(managed_policy_arn(policy))
            .send()
            .await
            .map_err(aws_sdk_iam::Error::from)
    }))
    .await?;

    if let Some((policy_name, document)) = &spec.inline_policy {
        client
            .put_role_policy()
            .role_name(spec.name)
            .policy_name(*policy_name)
            .policy_document(document)
            .send()
            .await
            .map_err(aws_sdk_iam::Error::from)?;
    }
    info!(role = spec.name, policies = spec.managed_policies.len(), "attached policies");
    Ok(())
}

/// Creates an empty instance profile
pub async fn create_instance_profile(client: &IamClient, profile_name: &str) -> Result<(), Error> {
    client
        .create_instance_profile()
        .instance_profile_name(profile_name)
        .send()
        .await
        .map_err(aws_sdk_iam::Error::from)?;
    info!(profile = profile_name, "created instance profile");
    Ok(())
}

/// Adds `role_name` to an instance profile
pub async fn add_role_to_instance_profile(
    client: &IamClient,
    profile_name: &str,
    role_name: &str,
) -> Result<(), Error> {
    client
        .add_role_to_instance_profile()
        .instance_profile_name(profile_name)
        .role_name(role_name)
        .send()
        .await
        .map_err(aws_sdk_iam::Error::from)?;
    info!(profile = profile_name, role = role_name, "added role to instance profile");
    Ok(())
}

/// Removes every role from an instance profile and deletes it
pub async fn delete_instance_profile(client: &IamClient, profile_name: &str) -> Result<(), Error> {
    let result = client
        .get_instance_profile()
        .instance_profile_name(profile_name)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_iam::Error::from(err)));
    let Some(resp) = ignore_not_found(result)? else {
        return Ok(());
    };
    let roles: Vec<String> = resp
        .instance_profile()
        .map(|profile| {
            profile
                .roles()
                .iter()
                .map(|role| role.role_name().to_string())
                .collect()
        })
        .unwrap_or_default();
    for role in roles {
        client
            .remove_role_from_instance_profile()
            .instance_profile_name(profile_name)
            .role_name(role)
            .send()
            .await
            .map_err(aws_sdk_iam::Error::from)?;
    }
    client
        .delete_instance_profile()
        .instance_profile_name(profile_name)
        .send()
        .await
        .map_err(aws_sdk_iam::Error::from)?;
    info!(profile = profile_name, "deleted instance profile");
    Ok(())
}

/// Detaches managed policies, deletes inline policies, and deletes the role
pub async fn delete_role(client: &IamClient, role_name: &str) -> Result<(), Error> {
    let result = client
        .list_attached_role_policies()
        .role_name(role_name)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_iam::Error::from(err)));
    let Some(attached) = ignore_not_found(result)? else {
        return Ok(());
    };
    for policy in attached.attached_policies() {
        let Some(arn) = policy.policy_arn() else {
            continue;
        };
        client
            .detach_role_policy()
            .role_name(role_name)
            .policy_arn(arn)
            .send()
            .await
            .map_err(aws_sdk_iam::Error::from)?;
    }

    let inline = client
        .list_role_policies()
        .role_name(role_name)
        .send()
        .await
        .map_err(aws_sdk_iam::Error::from)?;
    for policy_name in inline.policy_names() {
        client
            .delete_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .send()
            .await
            .map_err(aws_sdk_iam::Error::from)?;
    }

    client
        .delete_role()
        .role_name(role_name)
        .send()
        .await
        .map_err(aws_sdk_iam::Error::from)?;
    info!(role = role_name, "deleted role");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_policy_arn() {
        assert_eq!(
            managed_policy_arn("service-role/AmazonEC2ContainerServiceforEC2Role"),
            "arn:aws:iam::aws:policy/service-role/AmazonEC2ContainerServiceforEC2Role"
        );
    }

    #[test]
    fn test_assume_role_policy() {
        let policy: serde_json::Value =
            serde_json::from_str(&assume_role_policy(ECS_TASKS_PRINCIPAL)).unwrap();
        assert_eq!(
            policy["Statement"][0]["Principal"]["Service"],
            "ecs-tasks.amazonaws.com"
        );
        assert_eq!(policy["Statement"][0]["Action"], "sts:AssumeRole");
    }

    #[test]
    fn test_ssm_messages_policy_grants_all_channels() {
        let policy: serde_json::Value = serde_json::from_str(&ssm_messages_policy()).unwrap();
        let actions = policy["Statement"][0]["Action"].as_array().unwrap();
        assert_eq!(actions.len(), 4);
        assert!(actions.iter().any(|a| a == "ssmmessages:OpenDataChannel"));
        assert!(actions.iter().any(|a| a == "ssmmessages:CreateControlChannel"));
    }
}
