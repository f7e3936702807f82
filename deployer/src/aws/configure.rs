//! `configure` subcommand for `aws`

use crate::aws::{
    check_deployment, deployer_directory,
    ec2::find_instance_id,
    process_env,
    ssm::{run_powershell, CommandApi, WaiterConfig},
    template::{gmsa_script, redact, Substitutions},
    Clients, Config, Error,
};
use aws_config::Region;
use std::path::{Path, PathBuf};
use tracing::info;

/// Renders the PowerShell payload at `script` and runs it on `instance_id`, returning its output.
pub async fn run_script(
    api: &impl CommandApi,
    instance_id: &str,
    script: &Path,
    substitutions: &Substitutions,
    waiter: WaiterConfig,
) -> Result<String, Error> {
    let template = std::fs::read_to_string(script)?;
    let rendered = gmsa_script(&template, substitutions);
    let log_safe = redact(&rendered, &substitutions.password);
    run_powershell(api, instance_id, &rendered, &log_safe, waiter).await
}

/// Creates the gMSA accounts by running `script` on the Windows administration instance
pub async fn configure(config: &PathBuf, script: &PathBuf) -> Result<(), Error> {
    let config = Config::load(config)?;
    let stack = config.stack_name.as_str();
    check_deployment(&deployer_directory(Some(stack)), stack);

    let region = config.region(process_env)?;
    let bucket = config.bucket_name(process_env)?;
    let clients = Clients::new(Region::new(region.clone())).await;
    info!(region = region.as_str(), bucket = bucket.as_str(), "loaded configuration");

    let tag = config.windows_instance_tag.as_str();
    let instance_id = find_instance_id(&clients.ec2, tag)
        .await?
        .ok_or_else(|| Error::InstanceNotFound(tag.to_string()))?;
    info!(instance = instance_id.as_str(), "found Windows instance");

    run_script(
        &clients.ssm,
        &instance_id,
        script,
        &config.substitutions(&bucket),
        WaiterConfig::default(),
    )
    .await?;
    info!(
        instance = instance_id.as_str(),
        accounts = config.number_of_gmsa_accounts,
        "configured gMSA accounts"
    );
    Ok(())
}
