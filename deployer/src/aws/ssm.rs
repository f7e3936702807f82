//! AWS Systems Manager SDK function wrappers
//!
//! Remote commands are submitted with `SendCommand` and tracked with a waiter that polls
//! `GetCommandInvocation` at a fixed interval.

use crate::aws::{utils::ignore_not_found, Error};
use aws_sdk_ssm::{
    operation::get_command_invocation::GetCommandInvocationError,
    types::{CommandInvocationStatus, Target},
    Client as SsmClient,
};
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

/// Document used to run PowerShell on Windows instances
pub const POWERSHELL_DOCUMENT: &str = "AWS-RunPowerShellScript";

/// Document used to join instances to a directory
pub const JOIN_DOMAIN_DOCUMENT: &str = "AWS-JoinDirectoryServiceDomain";

/// Public parameter holding the latest Windows Server 2022 + SQL Server 2022 Enterprise AMI
pub const WINDOWS_AMI_PARAMETER: &str =
    "/aws/service/ami-windows-latest/Windows_Server-2022-English-Full-SQL_2022_Enterprise";

/// Public parameter holding the latest ECS-optimized Amazon Linux 2023 AMI
pub const ECS_AMI_PARAMETER: &str =
    "/aws/service/ecs/optimized-ami/amazon-linux-2023/recommended/image_id";

/// Default delay between waiter polls
pub const WAITER_DELAY: Duration = Duration::from_secs(30);

/// Default number of waiter polls before giving up
pub const WAITER_MAX_ATTEMPTS: usize = 50;

/// Polling behavior of the command waiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaiterConfig {
    pub delay: Duration,
    pub max_attempts: usize,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            delay: WAITER_DELAY,
            max_attempts: WAITER_MAX_ATTEMPTS,
        }
    }
}

/// State of a command on one instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub status: CommandInvocationStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Systems Manager operations used to run remote commands.
pub trait CommandApi: Send + Sync {
    /// Submits `script` to run with PowerShell on `instance_id`, returning the command ID.
    fn send_powershell(
        &self,
        instance_id: &str,
        script: &str,
    ) -> impl Future<Output = Result<String, Error>> + Send;

    /// Returns the invocation of `command_id` on `instance_id` (`None` until it is registered).
    fn invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> impl Future<Output = Result<Option<Invocation>, Error>> + Send;
}

impl CommandApi for SsmClient {
    async fn send_powershell(&self, instance_id: &str, script: &str) -> Result<String, Error> {
        let resp = self
            .send_command()
            .instance_ids(instance_id)
            .document_name(POWERSHELL_DOCUMENT)
            .parameters("commands", vec![script.to_string()])
            .send()
            .await
            .map_err(aws_sdk_ssm::Error::from)?;
        resp.command()
            .and_then(|command| command.command_id())
            .map(str::to_string)
            .ok_or(Error::MissingField("CommandId"))
    }

    async fn invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<Option<Invocation>, Error> {
        let result = self
            .get_command_invocation()
            .command_id(command_id)
            .instance_id(instance_id)
            .send()
            .await;
        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                let err = err.into_service_error();
                if matches!(err, GetCommandInvocationError::InvocationDoesNotExist(_)) {
                    return Ok(None);
                }
                return Err(aws_sdk_ssm::Error::from(err).into());
            }
        };
        Ok(Some(Invocation {
            status: resp
                .status()
                .cloned()
                .unwrap_or(CommandInvocationStatus::Pending),
            stdout: resp.standard_output_content().unwrap_or_default().to_string(),
            stderr: resp.standard_error_content().unwrap_or_default().to_string(),
        }))
    }
}

/// Returns true once `status` can no longer change
fn is_terminal(status: &CommandInvocationStatus) -> bool {
    matches!(
        status,
        CommandInvocationStatus::Success
            | CommandInvocationStatus::Failed
            | CommandInvocationStatus::Cancelling
            | CommandInvocationStatus::Cancelled
            | CommandInvocationStatus::TimedOut
    )
}

/// Builds the error reported for an invocation that did not succeed
fn command_failed(command_id: &str, invocation: &Invocation) -> Error {
    Error::CommandFailed {
        command_id: command_id.to_string(),
        status: invocation.status.as_str().to_string(),
        stderr: invocation.stderr.clone(),
    }
}

/// Blocks until `command_id` succeeds on `instance_id`.
///
/// Fails as soon as the invocation reaches a terminal non-success status, and with
/// [Error::CommandTimeout] once `waiter.max_attempts` polls have not observed a terminal status.
pub async fn wait_for_command(
    api: &impl CommandApi,
    command_id: &str,
    instance_id: &str,
    waiter: WaiterConfig,
) -> Result<(), Error> {
    for attempt in 1..=waiter.max_attempts {
        if let Some(invocation) = api.invocation(command_id, instance_id).await? {
            if invocation.status == CommandInvocationStatus::Success {
                return Ok(());
            }
            if is_terminal(&invocation.status) {
                return Err(command_failed(command_id, &invocation));
            }
            debug!(command_id, attempt, status = invocation.status.as_str(), "command running");
        } else {
            debug!(command_id, attempt, "command not yet registered");
        }
        if attempt < waiter.max_attempts {
            sleep(waiter.delay).await;
        }
    }
    Err(Error::CommandTimeout {
        command_id: command_id.to_string(),
        attempts: waiter.max_attempts,
    })
}

/// Runs a PowerShell script on an instance and returns its standard output.
///
/// `log_safe` is the script as it may appear in logs (secrets removed). It is logged with the
/// error whenever the command fails. The command is never retried.
pub async fn run_powershell(
    api: &impl CommandApi,
    instance_id: &str,
    script: &str,
    log_safe: &str,
    waiter: WaiterConfig,
) -> Result<String, Error> {
    let command_id = api.send_powershell(instance_id, script).await?;
    info!(command_id, instance_id, "sent command");

    if let Err(err) = wait_for_command(api, &command_id, instance_id, waiter).await {
        error!(command_id, script = log_safe, error = %err, "command failed");
        return Err(err);
    }

    let invocation = api
        .invocation(&command_id, instance_id)
        .await?
        .ok_or(Error::MissingField("CommandInvocation"))?;
    info!(command_id, output = invocation.stdout.as_str(), "command output");
    if invocation.status != CommandInvocationStatus::Success {
        let err = command_failed(&command_id, &invocation);
        error!(command_id, script = log_safe, error = %err, "command failed");
        return Err(err);
    }
    info!(command_id, "command status: Success");
    Ok(invocation.stdout)
}

/// Reads a public parameter (such as the latest AMI ID)
pub async fn get_parameter(client: &SsmClient, name: &str) -> Result<String, Error> {
    let resp = client
        .get_parameter()
        .name(name)
        .send()
        .await
        .map_err(aws_sdk_ssm::Error::from)?;
    resp.parameter()
        .and_then(|parameter| parameter.value())
        .map(str::to_string)
        .ok_or(Error::MissingField("Parameter.Value"))
}

/// Creates an association joining instances tagged `instance_tag` to the directory
pub async fn create_join_domain_association(
    client: &SsmClient,
    instance_tag: &str,
    directory_name: &str,
    directory_id: &str,
) -> Result<String, Error> {
    let resp = client
        .create_association()
        .name(JOIN_DOMAIN_DOCUMENT)
        .targets(
            Target::builder()
                .key("tag:Name")
                .values(instance_tag)
                .build(),
        )
        .parameters("directoryName", vec![directory_name.to_string()])
        .parameters("directoryId", vec![directory_id.to_string()])
        .send()
        .await
        .map_err(aws_sdk_ssm::Error::from)?;
    let association_id = resp
        .association_description()
        .and_then(|association| association.association_id())
        .ok_or(Error::MissingField("AssociationId"))?
        .to_string();
    info!(association_id, instance_tag, "created domain join association");
    Ok(association_id)
}

/// Deletes an association
pub async fn delete_association(client: &SsmClient, association_id: &str) -> Result<(), Error> {
    let result = client
        .delete_association()
        .association_id(association_id)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_ssm::Error::from(err)));
    ignore_not_found(result)?;
    Ok(())
}
