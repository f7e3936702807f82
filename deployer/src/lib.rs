//! Provision and configure an AWS environment for exercising Group Managed Service Accounts (gMSA).
//!
//! The environment pairs a managed Microsoft Active Directory with an ECS cluster (whose Linux
//! hosts run credentials-fetcher) and a Windows instance that administers the domain. Provisioning
//! is an ordered sequence of AWS API calls; post-deployment steps run PowerShell on the Windows
//! instance through Systems Manager and open the instance's security group to the directory.
//!
//! # Usage (Run a gMSA Environment)
//!
//! ```bash
//! gmsa-deployer aws create --config data.json
//! gmsa-deployer aws authorize --config data.json
//! gmsa-deployer aws configure --config data.json --script gmsa.ps1
//! gmsa-deployer aws destroy --config data.json
//! ```
//!
//! ## Example Configuration
//!
//! ```json
//! {
//!   "stack_name": "Credentials-fetcher-AD-Stack",
//!   "aws_region": "us-west-2",
//!   "s3_prefix": "gmsa-",
//!   "s3_bucket_suffix": "plugin-bucket",
//!   "prefix_list": "pl-0123456789abcdef0",
//!   "key_pair_name": "gmsa-demo",
//!   "directory_name": "contoso.com",
//!   "netbios_name": "contoso",
//!   "domain_admin_password": "Qn:51eJsORJNL@~{HY@?",
//!   "number_of_gmsa_accounts": 10,
//!   "windows_instance_tag": "Windows-AD-Admin",
//!   "ecs_cluster_name": "Credentials-fetcher-ecs-cluster",
//!   "task_definition_template_name": "Credentials-fetcher-task-definition",
//!   "rpm_file": "credentials-fetcher-1.3.7-0.amzn2023.x86_64.rpm",
//!   "secret_name": "gmsa-demo-config",
//!   "image": {
//!     "dockerfile": "Dockerfile",
//!     "repository": "credentials-fetcher-sample"
//!   }
//! }
//! ```

cfg_if::cfg_if! {
    if #[cfg(feature = "aws")] {
        pub mod aws;
    }
}
