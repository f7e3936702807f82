//! In-memory implementations of the AWS service traits.

#![allow(dead_code)]

use aws_sdk_directory::types::{DirectoryDescription, DirectoryVpcSettingsDescription};
use aws_sdk_ec2::types::{GroupIdentifier, Instance};
use aws_sdk_ecr::{
    operation::create_repository::CreateRepositoryError,
    types::error::{InvalidParameterException, RepositoryAlreadyExistsException},
};
use aws_sdk_secretsmanager::{
    operation::create_secret::CreateSecretError, types::error::ResourceExistsException,
};
use aws_sdk_ssm::types::CommandInvocationStatus;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use gmsa_deployer::aws::{
    directory::DirectoryApi,
    ec2::InstanceApi,
    ecr::RegistryApi,
    secrets::SecretApi,
    ssm::{CommandApi, Invocation},
    Error,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

pub const DIRECTORY_NAME: &str = "contoso.com";
pub const DIRECTORY_ID: &str = "d-1234567890";
pub const DIRECTORY_SG: &str = "sg-directory";
pub const INSTANCE_NAME: &str = "Credentials-fetcher-AD-Stack/MyAutoScalingGroup";
pub const INSTANCE_ID: &str = "i-0123456789abcdef0";
pub const INSTANCE_SG: &str = "sg-instance";
pub const COMMAND_ID: &str = "cmd-0001";
pub const REPOSITORY_URI: &str = "123456789012.dkr.ecr.us-west-2.amazonaws.com/sample";

/// Builds a directory description with an optional security group
pub fn directory(id: &str, name: &str, security_group: Option<&str>) -> DirectoryDescription {
    let mut builder = DirectoryDescription::builder().directory_id(id).name(name);
    if let Some(security_group) = security_group {
        builder = builder.vpc_settings(
            DirectoryVpcSettingsDescription::builder()
                .security_group_id(security_group)
                .build(),
        );
    }
    builder.build()
}

/// Builds a running instance attached to `security_groups`
pub fn instance(id: &str, security_groups: &[&str]) -> Instance {
    security_groups
        .iter()
        .fold(Instance::builder().instance_id(id), |builder, group| {
            builder.security_groups(GroupIdentifier::builder().group_id(*group).build())
        })
        .build()
}

/// Builds an invocation in `status`
pub fn invocation(status: CommandInvocationStatus, stdout: &str, stderr: &str) -> Invocation {
    Invocation {
        status,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

/// Directory Service holding a fixed set of directories.
#[derive(Default)]
pub struct MockDirectories {
    pub directories: Vec<DirectoryDescription>,
    pub describe_calls: AtomicUsize,
}

impl MockDirectories {
    pub fn new(directories: Vec<DirectoryDescription>) -> Self {
        Self {
            directories,
            describe_calls: AtomicUsize::new(0),
        }
    }
}

impl DirectoryApi for MockDirectories {
    async fn directories(&self) -> Result<Vec<DirectoryDescription>, Error> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.directories.clone())
    }

    async fn directory(&self, directory_id: &str) -> Result<Option<DirectoryDescription>, Error> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .directories
            .iter()
            .find(|directory| directory.directory_id() == Some(directory_id))
            .cloned())
    }
}

/// EC2 with a fixed set of running instances (all sharing one `Name` tag).
#[derive(Default)]
pub struct MockInstances {
    pub name: String,
    pub instances: Vec<Instance>,
    pub existing_rules: Vec<(String, String)>,
    pub authorized: Mutex<Vec<(String, String)>>,
}

impl MockInstances {
    pub fn new(name: &str, instances: Vec<Instance>) -> Self {
        Self {
            name: name.to_string(),
            instances,
            ..Default::default()
        }
    }

    pub fn authorized(&self) -> Vec<(String, String)> {
        self.authorized.lock().unwrap().clone()
    }
}

impl InstanceApi for MockInstances {
    async fn running_instances(&self, name: &str) -> Result<Vec<Instance>, Error> {
        if name != self.name {
            return Ok(Vec::new());
        }
        Ok(self.instances.clone())
    }

    async fn authorize_ingress_from_group(
        &self,
        group_id: &str,
        source_group_id: &str,
    ) -> Result<bool, Error> {
        let rule = (group_id.to_string(), source_group_id.to_string());
        if self.existing_rules.contains(&rule) {
            return Ok(false);
        }
        self.authorized.lock().unwrap().push(rule);
        Ok(true)
    }
}

/// Systems Manager replaying a scripted sequence of invocation states.
///
/// Once the sequence is exhausted, the last state is repeated.
pub struct MockCommands {
    responses: Mutex<VecDeque<Option<Invocation>>>,
    last: Mutex<Option<Invocation>>,
    pub sent: Mutex<Vec<(String, String)>>,
    pub invocation_calls: AtomicUsize,
}

impl MockCommands {
    pub fn new(responses: Vec<Option<Invocation>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            last: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            invocation_calls: AtomicUsize::new(0),
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn invocation_calls(&self) -> usize {
        self.invocation_calls.load(Ordering::SeqCst)
    }
}

impl CommandApi for MockCommands {
    async fn send_powershell(&self, instance_id: &str, script: &str) -> Result<String, Error> {
        self.sent
            .lock()
            .unwrap()
            .push((instance_id.to_string(), script.to_string()));
        Ok(COMMAND_ID.to_string())
    }

    async fn invocation(
        &self,
        command_id: &str,
        _instance_id: &str,
    ) -> Result<Option<Invocation>, Error> {
        assert_eq!(command_id, COMMAND_ID);
        self.invocation_calls.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.responses.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }
}

/// How the registry answers `CreateRepository`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
    Invalid,
}

/// ECR holding a single repository.
pub struct MockRegistry {
    pub outcome: CreateOutcome,
    pub token: String,
    pub create_calls: AtomicUsize,
    pub describe_calls: AtomicUsize,
}

impl MockRegistry {
    pub fn new(outcome: CreateOutcome) -> Self {
        Self {
            outcome,
            token: BASE64.encode("AWS:registry-password"),
            create_calls: AtomicUsize::new(0),
            describe_calls: AtomicUsize::new(0),
        }
    }
}

impl RegistryApi for MockRegistry {
    async fn create_repository(&self, _name: &str) -> Result<(), CreateRepositoryError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        match self.outcome {
            CreateOutcome::Created => Ok(()),
            CreateOutcome::AlreadyExists => Err(
                CreateRepositoryError::RepositoryAlreadyExistsException(
                    RepositoryAlreadyExistsException::builder()
                        .message("repository already exists")
                        .build(),
                ),
            ),
            CreateOutcome::Invalid => Err(CreateRepositoryError::InvalidParameterException(
                InvalidParameterException::builder()
                    .message("invalid repository name")
                    .build(),
            )),
        }
    }

    async fn repository_uri(&self, _name: &str) -> Result<String, Error> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(REPOSITORY_URI.to_string())
    }

    async fn authorization(&self) -> Result<(String, String), Error> {
        Ok((
            self.token.clone(),
            "https://123456789012.dkr.ecr.us-west-2.amazonaws.com".to_string(),
        ))
    }
}

/// Secrets Manager holding named secret values.
#[derive(Default)]
pub struct MockSecrets {
    pub secrets: Mutex<Vec<(String, String)>>,
    pub put_calls: AtomicUsize,
}

impl MockSecrets {
    pub fn with_secret(name: &str, value: &str) -> Self {
        Self {
            secrets: Mutex::new(vec![(name.to_string(), value.to_string())]),
            ..Default::default()
        }
    }

    pub fn value(&self, name: &str) -> Option<String> {
        self.secrets
            .lock()
            .unwrap()
            .iter()
            .find(|(secret, _)| secret == name)
            .map(|(_, value)| value.clone())
    }
}

impl SecretApi for MockSecrets {
    async fn create_secret(&self, name: &str, value: &str) -> Result<(), CreateSecretError> {
        let mut secrets = self.secrets.lock().unwrap();
        if secrets.iter().any(|(secret, _)| secret == name) {
            return Err(CreateSecretError::ResourceExistsException(
                ResourceExistsException::builder()
                    .message("the operation failed because the secret already exists")
                    .build(),
            ));
        }
        secrets.push((name.to_string(), value.to_string()));
        Ok(())
    }

    async fn put_secret_value(&self, name: &str, value: &str) -> Result<(), Error> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let mut secrets = self.secrets.lock().unwrap();
        if let Some(secret) = secrets.iter_mut().find(|(secret, _)| secret == name) {
            secret.1 = value.to_string();
        }
        Ok(())
    }
}
