//! gMSA Deployer CLI

use clap::{Arg, ArgAction, Command};
use gmsa_deployer::aws;
use std::path::PathBuf;
use tracing::error;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Returns the required `--config` argument
fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .required(true)
        .help("Path to JSON config file")
        .value_parser(clap::value_parser!(PathBuf))
}

/// Entrypoint for the gMSA Deployer CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("gmsa-deployer")
        .version(crate_version())
        .about("Provision and configure a gMSA environment (Active Directory, ECS, Windows).")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(aws::CMD)
                .about("Deploy a managed Active Directory, an ECS cluster running credentials-fetcher, and a Windows administration instance on AWS.")
                .subcommand(
                    Command::new(aws::CREATE_CMD)
                        .about("Provision every resource of the stack from a JSON configuration file.")
                        .arg(config_arg()),
                )
                .subcommand(
                    Command::new(aws::CONFIGURE_CMD)
                        .about("Create the gMSA accounts by running a PowerShell script on the Windows instance.")
                        .arg(config_arg())
                        .arg(
                            Arg::new("script")
                                .long("script")
                                .default_value(aws::DEFAULT_SCRIPT)
                                .help("Path to the PowerShell script to run")
                                .value_parser(clap::value_parser!(PathBuf)),
                        ),
                )
                .subcommand(
                    Command::new(aws::AUTHORIZE_CMD)
                        .about("Allow traffic from the directory's security group into an instance's security group.")
                        .arg(config_arg())
                        .arg(
                            Arg::new("instance")
                                .long("instance")
                                .help("Name tag of the instance to authorize. If not provided, the ECS host of the stack is used.")
                                .value_parser(clap::value_parser!(String)),
                        ),
                )
                .subcommand(
                    Command::new(aws::DESTROY_CMD)
                        .about("Destroy all resources associated with a given stack.")
                        .arg(
                            Arg::new("config")
                                .long("config")
                                .help("Path to JSON config file")
                                .value_parser(clap::value_parser!(PathBuf)),
                        )
                        .arg(
                            Arg::new("stack")
                                .long("stack")
                                .help("Stack name (uses persisted metadata)")
                                .value_parser(clap::value_parser!(String)),
                        )
                        .group(
                            clap::ArgGroup::new("target")
                                .args(["config", "stack"])
                                .required(true),
                        ),
                ),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Parse subcommands
    if let Some(aws_matches) = matches.subcommand_matches(aws::CMD) {
        match aws_matches.subcommand() {
            Some((aws::CREATE_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config").unwrap();
                if let Err(e) = aws::create(config_path).await {
                    error!(error=?e, "failed to create stack");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((aws::CONFIGURE_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config").unwrap();
                let script = matches.get_one::<PathBuf>("script").unwrap();
                if let Err(e) = aws::configure(config_path, script).await {
                    error!(error=?e, "failed to configure Windows instance");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((aws::AUTHORIZE_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config").unwrap();
                let instance = matches.get_one::<String>("instance").cloned();
                if let Err(e) = aws::authorize(config_path, instance).await {
                    error!(error=?e, "failed to authorize directory traffic");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((aws::DESTROY_CMD, matches)) => {
                let config_path = matches.get_one::<PathBuf>("config");
                let stack = matches.get_one::<String>("stack").map(|s| s.as_str());
                if let Err(e) = aws::destroy(config_path, stack).await {
                    error!(error=?e, "failed to destroy stack");
                } else {
                    return std::process::ExitCode::SUCCESS;
                }
            }
            Some((cmd, _)) => {
                error!(cmd, "invalid subcommand");
            }
            None => {
                error!("no subcommand provided");
            }
        }
    } else if let Some(cmd) = matches.subcommand_name() {
        error!(cmd, "invalid subcommand");
    } else {
        error!("no subcommand provided");
    }
    std::process::ExitCode::FAILURE
}
