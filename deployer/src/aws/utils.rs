use crate::aws::Error;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Interval between polls of a resource that is converging
pub const RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Maximum number of polls before giving up (one hour at [RETRY_INTERVAL])
pub const MAX_POLL_ATTEMPTS: usize = 240;

/// Polls `check` until it yields a value, sleeping `interval` between attempts.
///
/// `check` returns `Ok(None)` while the resource is still converging.
pub async fn poll<T, F, Fut>(
    resource: &str,
    interval: Duration,
    attempts: usize,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    for attempt in 0..attempts {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        debug!(resource, attempt, "waiting");
        if attempt + 1 < attempts {
            sleep(interval).await;
        }
    }
    Err(Error::WaitTimeout(resource.to_string()))
}

/// Polls `check` with [RETRY_INTERVAL] and [MAX_POLL_ATTEMPTS].
pub async fn wait_for<T, F, Fut>(resource: &str, check: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    poll(resource, RETRY_INTERVAL, MAX_POLL_ATTEMPTS, check).await
}

/// Returns true if `err` reports that the targeted resource does not exist
pub fn is_not_found(err: &Error) -> bool {
    let code = match err {
        Error::AwsEc2(e) => e.code(),
        Error::AwsDirectory(e) => e.code(),
        Error::AwsResolver(e) => e.code(),
        Error::AwsIam(e) => e.code(),
        Error::AwsSsm(e) => e.code(),
        Error::AwsEcs(e) => e.code(),
        Error::AwsEcr(e) => e.code(),
        Error::AwsSecretsManager(e) => e.code(),
        Error::AwsAutoScaling(e) => {
            // Auto Scaling reports missing groups as a validation error
            return e.message().is_some_and(|m| m.contains("not found"));
        }
        _ => None,
    };
    code.is_some_and(|code| {
        code.contains("NotFound")
            || code.contains("NoSuch")
            || code.contains("DoesNotExist")
    })
}

/// Converts a not-found error into `Ok(None)`, leaving other results untouched
pub fn ignore_not_found<T>(result: Result<T, Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if is_not_found(&err) => {
            debug!(error = %err, "resource already gone");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Seconds since the Unix epoch
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_autoscaling::operation::delete_auto_scaling_group::DeleteAutoScalingGroupError;
    use aws_sdk_directory::operation::delete_directory::DeleteDirectoryError;
    use aws_sdk_ec2::{
        error::{ErrorMetadata, SdkError},
        operation::delete_vpc::DeleteVpcError,
    };
    use aws_sdk_iam::operation::get_instance_profile::GetInstanceProfileError;
    use std::cell::Cell;

    fn meta(code: &str, message: &str) -> ErrorMetadata {
        ErrorMetadata::builder().code(code).message(message).build()
    }

    fn ec2_error(code: &str) -> Error {
        let err = DeleteVpcError::generic(meta(code, "ec2"));
        aws_sdk_ec2::Error::from(SdkError::<DeleteVpcError, ()>::service_error(err, ())).into()
    }

    fn iam_error(code: &str) -> Error {
        let err = GetInstanceProfileError::generic(meta(code, "iam"));
        aws_sdk_iam::Error::from(SdkError::<GetInstanceProfileError, ()>::service_error(err, ()))
            .into()
    }

    fn directory_error(code: &str) -> Error {
        let err = DeleteDirectoryError::generic(meta(code, "directory"));
        aws_sdk_directory::Error::from(SdkError::<DeleteDirectoryError, ()>::service_error(
            err,
            (),
        ))
        .into()
    }

    fn autoscaling_error(message: &str) -> Error {
        let err = DeleteAutoScalingGroupError::generic(meta("ValidationError", message));
        aws_sdk_autoscaling::Error::from(SdkError::<DeleteAutoScalingGroupError, ()>::service_error(
            err,
            (),
        ))
        .into()
    }

    #[tokio::test]
    async fn test_poll_returns_first_value() {
        let calls = Cell::new(0);
        let value = poll("thing", Duration::ZERO, 5, || {
            calls.set(calls.get() + 1);
            let ready = calls.get() == 3;
            async move { Ok(ready.then_some("ready")) }
        })
        .await
        .unwrap();
        assert_eq!(value, "ready");
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let calls = Cell::new(0);
        let result: Result<(), _> = poll("thing", Duration::ZERO, 4, || {
            calls.set(calls.get() + 1);
            async { Ok(None) }
        })
        .await;
        assert!(matches!(result, Err(Error::WaitTimeout(resource)) if resource == "thing"));
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test]
    async fn test_poll_propagates_errors() {
        let result: Result<(), _> = poll("thing", Duration::ZERO, 4, || async {
            Err(Error::MissingField("thing"))
        })
        .await;
        assert!(matches!(result, Err(Error::MissingField("thing"))));
    }

    #[test]
    fn test_ignore_not_found() {
        assert_eq!(ignore_not_found(Ok(1)).unwrap(), Some(1));
        let err = ignore_not_found::<()>(Err(Error::DirectoryNotFound("corp".into())));
        assert!(matches!(err, Err(Error::DirectoryNotFound(_))));
    }

    #[test]
    fn test_missing_resources_are_ignored() {
        for err in [
            ec2_error("InvalidVpcID.NotFound"),
            ec2_error("InvalidGroup.NotFound"),
            iam_error("NoSuchEntity"),
            directory_error("EntityDoesNotExistException"),
            autoscaling_error("AutoScalingGroup name not found - stack-MyAutoScalingGroup"),
        ] {
            assert!(is_not_found(&err), "{err} not treated as missing");
            assert!(ignore_not_found::<()>(Err(err)).unwrap().is_none());
        }
    }

    #[test]
    fn test_other_failures_are_kept() {
        for err in [
            ec2_error("DependencyViolation"),
            iam_error("DeleteConflict"),
            directory_error("ClientException"),
            autoscaling_error("Group stack-MyAutoScalingGroup has scaling activities in progress"),
        ] {
            assert!(!is_not_found(&err), "{err} treated as missing");
            assert!(ignore_not_found::<()>(Err(err)).is_err());
        }
    }
}
