mod common;

use aws_sdk_ssm::types::CommandInvocationStatus;
use common::*;
use gmsa_deployer::aws::{
    run_script,
    ssm::{run_powershell, wait_for_command, Invocation, WaiterConfig},
    template::{
        Substitutions, ACCOUNTS_TOKEN, BUCKET_TOKEN, DOMAIN_TOKEN, NETBIOS_TOKEN, PASSWORD_TOKEN,
    },
    Error,
};
use std::{io::Write, time::Duration};
use tempfile::NamedTempFile;

const SCRIPT: &str = r#"$password = ConvertTo-SecureString "INPUTPASSWORD" -AsPlainText -Force
$credential = New-Object System.Management.Automation.PSCredential("admin@DOMAINNAME", $password)
New-ADOrganizationalUnit -Name "MYOU" -Path "DC=NETBIOS_NAME,DC=com" -Credential $credential
for ($i = 1; $i -le NUMBER_OF_GMSA_ACCOUNTS; $i++) {
    New-ADServiceAccount -Name "WebApp0$i" -DNSHostName "WebApp0$i.DOMAINNAME" -Credential $credential
}
Write-S3Object -BucketName BUCKET_NAME -Key "gmsa/done" -Content "INPUTPASSWORD-ok"
"#;

fn waiter(max_attempts: usize) -> WaiterConfig {
    WaiterConfig {
        delay: Duration::ZERO,
        max_attempts,
    }
}

fn substitutions() -> Substitutions {
    Substitutions {
        password: "Qn:51eJsORJNL@~{HY@?".to_string(),
        domain_name: DIRECTORY_NAME.to_string(),
        netbios_name: "contoso".to_string(),
        accounts: 10,
        bucket: "gmsa-plugin-bucket".to_string(),
    }
}

fn script_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(SCRIPT.as_bytes()).unwrap();
    file
}

fn success(stdout: &str) -> Option<Invocation> {
    Some(invocation(CommandInvocationStatus::Success, stdout, ""))
}

#[tokio::test]
async fn test_run_script_substitutes_every_token() {
    let commands = MockCommands::new(vec![success("created 10 accounts")]);
    let file = script_file();
    let output = run_script(&commands, INSTANCE_ID, file.path(), &substitutions(), waiter(3))
        .await
        .unwrap();
    assert_eq!(output, "created 10 accounts");

    let sent = commands.sent();
    assert_eq!(sent.len(), 1);
    let (instance_id, script) = &sent[0];
    assert_eq!(instance_id, INSTANCE_ID);
    for token in [
        PASSWORD_TOKEN,
        DOMAIN_TOKEN,
        NETBIOS_TOKEN,
        ACCOUNTS_TOKEN,
        BUCKET_TOKEN,
    ] {
        assert!(!script.contains(token), "{token} left in script");
    }
    assert_eq!(script.matches("Qn:51eJsORJNL@~{HY@?").count(), 2);
    assert_eq!(script.matches("contoso.com").count(), 2);
    assert!(script.contains("DC=contoso,DC=com"));
    assert!(script.contains("$i -le 10;"));
    assert!(script.contains("-BucketName gmsa-plugin-bucket"));
}

#[tokio::test]
async fn test_run_script_waits_through_pending_states() {
    let commands = MockCommands::new(vec![
        None,
        Some(invocation(CommandInvocationStatus::Pending, "", "")),
        Some(invocation(CommandInvocationStatus::InProgress, "", "")),
        Some(invocation(CommandInvocationStatus::Delayed, "", "")),
        success("done"),
    ]);
    let file = script_file();
    let output = run_script(&commands, INSTANCE_ID, file.path(), &substitutions(), waiter(10))
        .await
        .unwrap();
    assert_eq!(output, "done");

    // Five polls by the waiter plus the final fetch
    assert_eq!(commands.invocation_calls(), 6);
}

#[tokio::test]
async fn test_failed_command_surfaces_stderr() {
    let commands = MockCommands::new(vec![Some(invocation(
        CommandInvocationStatus::Failed,
        "partial output",
        "New-ADServiceAccount : Access is denied",
    ))]);
    let file = script_file();
    let err = run_script(&commands, INSTANCE_ID, file.path(), &substitutions(), waiter(5))
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        Error::CommandFailed { status, .. } if status == "Failed"
    ));
    assert!(err.to_string().contains("Access is denied"));
    assert_eq!(commands.invocation_calls(), 1);
}

#[tokio::test]
async fn test_non_success_final_status_is_an_error() {
    let commands = MockCommands::new(vec![
        success(""),
        Some(invocation(CommandInvocationStatus::Cancelled, "", "cancelled by operator")),
    ]);
    let err = run_powershell(&commands, INSTANCE_ID, "Get-Date", "Get-Date", waiter(5))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cancelled by operator"));
}

#[tokio::test]
async fn test_timeout_skips_output_fetch() {
    let commands = MockCommands::new(vec![Some(invocation(
        CommandInvocationStatus::InProgress,
        "",
        "",
    ))]);
    let file = script_file();
    let err = run_script(&commands, INSTANCE_ID, file.path(), &substitutions(), waiter(4))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::CommandTimeout { ref command_id, attempts: 4 } if command_id == COMMAND_ID
    ));

    // Every call was made by the waiter
    assert_eq!(commands.invocation_calls(), 4);
    assert_eq!(commands.sent().len(), 1);
}

#[tokio::test]
async fn test_unregistered_invocation_times_out() {
    let commands = MockCommands::new(vec![None]);
    let err = wait_for_command(&commands, COMMAND_ID, INSTANCE_ID, waiter(3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CommandTimeout { attempts: 3, .. }));
    assert_eq!(commands.invocation_calls(), 3);
}

#[tokio::test]
async fn test_missing_script_sends_nothing() {
    let commands = MockCommands::new(vec![success("")]);
    let dir = tempfile::tempdir().unwrap();
    let err = run_script(
        &commands,
        INSTANCE_ID,
        &dir.path().join("gmsa.ps1"),
        &substitutions(),
        waiter(1),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(commands.sent().is_empty());
}

#[tokio::test]
async fn test_waiter_stops_on_terminal_statuses() {
    for status in [
        CommandInvocationStatus::Cancelling,
        CommandInvocationStatus::Cancelled,
        CommandInvocationStatus::TimedOut,
    ] {
        let commands = MockCommands::new(vec![
            Some(invocation(CommandInvocationStatus::InProgress, "", "")),
            Some(invocation(status.clone(), "", "stopped")),
        ]);
        let err = wait_for_command(&commands, COMMAND_ID, INSTANCE_ID, waiter(10))
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            Error::CommandFailed { status: reported, stderr, .. }
                if reported == status.as_str() && stderr == "stopped"
        ));
        assert_eq!(commands.invocation_calls(), 2);
    }
}
