//! AWS provisioning and post-deployment configuration for the gMSA environment.
//!
//! # Resources
//!
//! `create` provisions, in order:
//!
//! * VPC (`10.0.0.0/16`) with an internet gateway, a public route table, and two public subnets
//! * Security group allowing all traffic from a managed prefix list and from itself
//! * AWS Managed Microsoft AD (Standard edition) spanning both subnets
//! * Route 53 Resolver outbound endpoint and a forwarding rule for the directory's domain
//! * Systems Manager association joining tagged Windows instances to the directory
//! * Windows Server 2022 (SQL Server 2022) instance used to administer the domain
//! * Auto Scaling group of ECS-optimized Amazon Linux 2023 hosts running credentials-fetcher
//! * ECS cluster, capacity provider, and task definition
//! * (optional) ECR repository and container image built from a local Dockerfile
//! * (optional) Secrets Manager secret holding the configuration
//!
//! Every identifier is persisted to `~/.gmsa_deployer/<stack_name>/metadata.yaml` as soon as the
//! resource exists, so `destroy` can clean up after a partial `create`.

use crate::aws::template::Substitutions;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::warn;

pub mod autoscaling;
pub mod directory;
pub mod ec2;
pub mod ecr;
pub mod ecs;
pub mod iam;
pub mod resolver;
pub mod secrets;
pub mod ssm;
pub mod template;
pub mod utils;

mod authorize;
pub use authorize::{add_directory_ingress, authorize};
mod configure;
pub use configure::{configure, run_script};
mod create;
pub use create::create;
mod destroy;
pub use destroy::destroy;

/// Directory (under `$HOME`) where per-stack deployment state is stored
const DEPLOYER_DIRECTORY: &str = ".gmsa_deployer";

/// File holding the identifiers of every created resource
pub const METADATA_FILE_NAME: &str = "metadata.yaml";

/// Marker written once `create` completes
pub const CREATED_FILE_NAME: &str = "created";

/// Marker written once `destroy` completes
pub const DESTROYED_FILE_NAME: &str = "destroyed";

/// Logical name of the ECS Auto Scaling group (instances are tagged `<stack>/<name>`)
pub const AUTO_SCALING_GROUP_NAME: &str = "MyAutoScalingGroup";

/// Name of the ECS capacity provider
pub const CAPACITY_PROVIDER_NAME: &str = "MyCapacityProvider";

/// Default PowerShell payload executed by `configure`
pub const DEFAULT_SCRIPT: &str = "gmsa.ps1";

/// Environment variable (or lower-cased config key) holding the AWS region
pub const REGION_SETTING: &str = "AWS_REGION";

/// Environment variable (or lower-cased config key) holding the S3 bucket prefix
pub const S3_PREFIX_SETTING: &str = "S3_PREFIX";

pub const CMD: &str = "aws";
pub const CREATE_CMD: &str = "create";
pub const CONFIGURE_CMD: &str = "configure";
pub const AUTHORIZE_CMD: &str = "authorize";
pub const DESTROY_CMD: &str = "destroy";

/// Errors that can occur when deploying or configuring the environment.
#[derive(Error, Debug)]
pub enum Error {
    #[error("AWS EC2 error: {0}")]
    AwsEc2(#[from] aws_sdk_ec2::Error),
    #[error("AWS Directory Service error: {0}")]
    AwsDirectory(#[from] aws_sdk_directory::Error),
    #[error("AWS Route 53 Resolver error: {0}")]
    AwsResolver(#[from] aws_sdk_route53resolver::Error),
    #[error("AWS IAM error: {0}")]
    AwsIam(#[from] aws_sdk_iam::Error),
    #[error("AWS SSM error: {0}")]
    AwsSsm(#[from] aws_sdk_ssm::Error),
    #[error("AWS Auto Scaling error: {0}")]
    AwsAutoScaling(#[from] aws_sdk_autoscaling::Error),
    #[error("AWS ECS error: {0}")]
    AwsEcs(#[from] aws_sdk_ecs::Error),
    #[error("AWS ECR error: {0}")]
    AwsEcr(#[from] aws_sdk_ecr::Error),
    #[error("AWS Secrets Manager error: {0}")]
    AwsSecretsManager(#[from] aws_sdk_secretsmanager::Error),
    #[error("invalid request: {0}")]
    Build(#[from] aws_sdk_ec2::error::BuildError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("setting not found in environment or config: {0}")]
    MissingSetting(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("missing field in AWS response: {0}")]
    MissingField(&'static str),
    #[error("directory not found: {0}")]
    DirectoryNotFound(String),
    #[error("directory {0} has no security group")]
    DirectoryMissingSecurityGroup(String),
    #[error("directory {id} entered stage {stage}")]
    DirectoryFailed { id: String, stage: String },
    #[error("directory {0} does not expose two DNS addresses")]
    DirectoryDnsUnavailable(String),
    #[error("no running instances found with tag:Name '{0}'")]
    InstanceNotFound(String),
    #[error("no security groups found for instance {0}")]
    NoSecurityGroups(String),
    #[error("command {command_id} finished with status {status}: {stderr}")]
    CommandFailed {
        command_id: String,
        status: String,
        stderr: String,
    },
    #[error("command {command_id} did not complete after {attempts} attempts")]
    CommandTimeout { command_id: String, attempts: usize },
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),
    #[error("registry authorization unavailable")]
    AuthorizationUnavailable,
    #[error("malformed registry authorization token")]
    InvalidAuthorizationToken,
    #[error("{tool} failed: {reason}")]
    ToolFailed { tool: &'static str, reason: String },
    #[error("timed out waiting for {0}")]
    WaitTimeout(String),
    #[error("resource failed: {0}")]
    ResourceFailed(String),
    #[error("deployment already attempted: {0}")]
    CreationAttempted(String),
    #[error("deployment does not exist: {0}")]
    DeploymentDoesNotExist(String),
    #[error("deployment is not complete: {0}")]
    DeploymentNotComplete(String),
    #[error("deployment is already destroyed: {0}")]
    DeploymentAlreadyDestroyed(String),
}

/// Container image built and pushed to ECR during `create`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ImageConfig {
    /// Path to the Dockerfile (its parent directory is the build context)
    pub dockerfile: PathBuf,
    /// ECR repository name
    pub repository: String,
    /// Image tag
    #[serde(default = "default_image_tag")]
    pub tag: String,
}

fn default_image_tag() -> String {
    "latest".to_string()
}

/// Deployment configuration, loaded from a JSON file.
///
/// The file is never modified by the deployer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub stack_name: String,
    #[serde(default)]
    pub aws_region: Option<String>,
    #[serde(default)]
    pub s3_prefix: Option<String>,
    pub s3_bucket_suffix: String,
    pub prefix_list: String,
    pub key_pair_name: String,
    pub directory_name: String,
    pub netbios_name: String,
    pub domain_admin_password: String,
    pub number_of_gmsa_accounts: u32,
    pub windows_instance_tag: String,
    pub ecs_cluster_name: String,
    pub task_definition_template_name: String,
    pub rpm_file: String,
    #[serde(default)]
    pub secret_name: Option<String>,
    #[serde(default)]
    pub image: Option<ImageConfig>,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let config: Config = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants that the JSON schema alone cannot express.
    pub fn validate(&self) -> Result<(), Error> {
        if self.stack_name.is_empty() {
            return Err(Error::InvalidConfig("stack_name is empty".into()));
        }
        if self.number_of_gmsa_accounts == 0 {
            return Err(Error::InvalidConfig(
                "number_of_gmsa_accounts must be at least 1".into(),
            ));
        }
        match self.directory_name.split_once('.') {
            Some((label, rest)) if !label.is_empty() && !rest.is_empty() => {}
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "directory_name must be a fully qualified domain: {}",
                    self.directory_name
                )))
            }
        }
        Ok(())
    }

    /// Resolves `key` from `env` first, falling back to the config field named `key` in lower case.
    pub fn value(&self, key: &str, env: impl Fn(&str) -> Option<String>) -> Result<String, Error> {
        if let Some(value) = env(key) {
            return Ok(value);
        }
        let fallback = match key.to_lowercase().as_str() {
            "aws_region" => self.aws_region.clone(),
            "s3_prefix" => self.s3_prefix.clone(),
            _ => None,
        };
        fallback.ok_or_else(|| Error::MissingSetting(key.to_string()))
    }

    /// Region all clients are created in.
    pub fn region(&self, env: impl Fn(&str) -> Option<String>) -> Result<String, Error> {
        self.value(REGION_SETTING, env)
    }

    /// Name of the S3 bucket the payloads read from (`S3_PREFIX` + `s3_bucket_suffix`).
    pub fn bucket_name(&self, env: impl Fn(&str) -> Option<String>) -> Result<String, Error> {
        let prefix = self.value(S3_PREFIX_SETTING, env)?;
        Ok(format!("{prefix}{}", self.s3_bucket_suffix))
    }

    /// `Name` tag carried by instances launched from the ECS Auto Scaling group.
    pub fn auto_scaling_instance_name(&self) -> String {
        format!("{}/{AUTO_SCALING_GROUP_NAME}", self.stack_name)
    }

    /// Placeholder values for the PowerShell payload run by `configure`.
    pub fn substitutions(&self, bucket: &str) -> Substitutions {
        Substitutions {
            password: self.domain_admin_password.clone(),
            domain_name: self.directory_name.clone(),
            netbios_name: self.netbios_name.clone(),
            accounts: self.number_of_gmsa_accounts,
            bucket: bucket.to_string(),
        }
    }
}

/// Reads a process environment variable (the production `env` for [Config::value]).
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Identifiers of resources created for a stack.
///
/// Fields are filled as resources come into existence and persisted after every step.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Metadata {
    pub stack_name: String,
    pub region: String,
    pub created_at: u64,
    pub vpc_id: Option<String>,
    pub internet_gateway_id: Option<String>,
    pub route_table_id: Option<String>,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    pub security_group_id: Option<String>,
    pub directory_id: Option<String>,
    pub resolver_endpoint_id: Option<String>,
    pub resolver_rule_id: Option<String>,
    pub resolver_association_id: Option<String>,
    pub association_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub instance_profiles: Vec<String>,
    pub windows_instance_id: Option<String>,
    pub launch_template_id: Option<String>,
    pub auto_scaling_group: Option<String>,
    pub capacity_provider: Option<String>,
    pub cluster: Option<String>,
    pub task_definition_arn: Option<String>,
    pub repository: Option<String>,
    pub image_uri: Option<String>,
    pub secret_name: Option<String>,
}

impl Metadata {
    /// Loads persisted metadata from a stack directory.
    pub fn load(directory: &Path) -> Result<Self, Error> {
        let file = File::open(directory.join(METADATA_FILE_NAME))?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Persists metadata to a stack directory, replacing any previous copy.
    pub fn persist(&self, directory: &Path) -> Result<(), Error> {
        let file = File::create(directory.join(METADATA_FILE_NAME))?;
        serde_yaml::to_writer(file, self)?;
        Ok(())
    }

    /// Applies `update` and persists the result.
    pub fn record(
        &mut self,
        directory: &Path,
        update: impl FnOnce(&mut Self),
    ) -> Result<(), Error> {
        update(self);
        self.persist(directory)
    }
}

/// Returns the directory holding deployment state for `stack` (or the root when `None`).
pub fn deployer_directory(stack: Option<&str>) -> PathBuf {
    let base = std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    let root = base.join(DEPLOYER_DIRECTORY);
    match stack {
        Some(stack) => root.join(stack),
        None => root,
    }
}

/// Ensures the stack in `directory` finished `create` and has not been destroyed.
pub fn ensure_active(directory: &Path, stack: &str) -> Result<(), Error> {
    if !directory.exists() {
        return Err(Error::DeploymentDoesNotExist(stack.to_string()));
    }
    if !directory.join(CREATED_FILE_NAME).exists() {
        return Err(Error::DeploymentNotComplete(stack.to_string()));
    }
    if directory.join(DESTROYED_FILE_NAME).exists() {
        return Err(Error::DeploymentAlreadyDestroyed(stack.to_string()));
    }
    Ok(())
}

/// Warns when `directory` holds no active deployment of `stack` (which may have been created
/// from another machine). Returns whether the deployment is active.
pub fn check_deployment(directory: &Path, stack: &str) -> bool {
    match ensure_active(directory, stack) {
        Ok(()) => true,
        Err(err) => {
            warn!(stack, error = %err, "no active deployment recorded on this machine");
            false
        }
    }
}

/// AWS service clients sharing one [SdkConfig].
#[derive(Clone)]
pub struct Clients {
    pub autoscaling: aws_sdk_autoscaling::Client,
    pub directory: aws_sdk_directory::Client,
    pub ec2: aws_sdk_ec2::Client,
    pub ecr: aws_sdk_ecr::Client,
    pub ecs: aws_sdk_ecs::Client,
    pub iam: aws_sdk_iam::Client,
    pub resolver: aws_sdk_route53resolver::Client,
    pub secrets: aws_sdk_secretsmanager::Client,
    pub ssm: aws_sdk_ssm::Client,
}

impl Clients {
    /// Creates every client for the specified AWS region.
    pub async fn new(region: Region) -> Self {
        let config = load_sdk_config(region).await;
        Self {
            autoscaling: aws_sdk_autoscaling::Client::new(&config),
            directory: aws_sdk_directory::Client::new(&config),
            ec2: aws_sdk_ec2::Client::new(&config),
            ecr: aws_sdk_ecr::Client::new(&config),
            ecs: aws_sdk_ecs::Client::new(&config),
            iam: aws_sdk_iam::Client::new(&config),
            resolver: aws_sdk_route53resolver::Client::new(&config),
            secrets: aws_sdk_secretsmanager::Client::new(&config),
            ssm: aws_sdk_ssm::Client::new(&config),
        }
    }
}

/// Loads shared SDK configuration with adaptive retries for the specified region.
pub async fn load_sdk_config(region: Region) -> SdkConfig {
    let retry = aws_config::retry::RetryConfig::adaptive()
        .with_max_attempts(10)
        .with_initial_backoff(Duration::from_millis(500))
        .with_max_backoff(Duration::from_secs(30));
    aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .retry_config(retry)
        .load()
        .await
}
