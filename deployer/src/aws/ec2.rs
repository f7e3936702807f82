//! AWS EC2 SDK function wrappers

use crate::aws::{
    utils::{ignore_not_found, wait_for},
    Error,
};
use aws_sdk_ec2::{
    error::ProvideErrorMetadata,
    types::{
        AttributeBooleanValue, Filter, IamInstanceProfileSpecification, Instance,
        InstanceStateName, InstanceType, IpPermission, LaunchTemplateHttpTokensState,
        LaunchTemplateIamInstanceProfileSpecificationRequest,
        LaunchTemplateInstanceMetadataOptionsRequest,
        LaunchTemplateInstanceNetworkInterfaceSpecificationRequest, PrefixListId,
        RequestLaunchTemplateData, ResourceType, Tag, TagSpecification, UserIdGroupPair,
    },
    Client as Ec2Client,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// Tag key recording the owning stack on every tagged resource
pub const STACK_TAG: &str = "gmsa-deployer";

/// Protocol value matching all traffic
pub const ALL_TRAFFIC: &str = "-1";

/// Port value matching all ports (used with [ALL_TRAFFIC])
pub const ALL_PORTS: i32 = -1;

/// Launch attempts while a new instance profile propagates
const PROFILE_PROPAGATION_ATTEMPTS: usize = 12;

/// Delay between launch attempts while a new instance profile propagates
const PROFILE_PROPAGATION_DELAY: Duration = Duration::from_secs(10);

/// EC2 operations used by the post-deployment steps.
pub trait InstanceApi: Send + Sync {
    /// Returns running instances whose `Name` tag equals `name`.
    fn running_instances(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Vec<Instance>, Error>> + Send;

    /// Allows all traffic into `group_id` from members of `source_group_id`.
    ///
    /// Returns `false` if the rule already existed.
    fn authorize_ingress_from_group(
        &self,
        group_id: &str,
        source_group_id: &str,
    ) -> impl Future<Output = Result<bool, Error>> + Send;
}

impl InstanceApi for Ec2Client {
    async fn running_instances(&self, name: &str) -> Result<Vec<Instance>, Error> {
        let resp = self
            .describe_instances()
            .filters(Filter::builder().name("tag:Name").values(name).build())
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .values("running")
                    .build(),
            )
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;
        Ok(resp
            .reservations()
            .iter()
            .flat_map(|reservation| reservation.instances().iter().cloned())
            .collect())
    }

    async fn authorize_ingress_from_group(
        &self,
        group_id: &str,
        source_group_id: &str,
    ) -> Result<bool, Error> {
        let result = self
            .authorize_security_group_ingress()
            .group_id(group_id)
            .ip_permissions(
                IpPermission::builder()
                    .ip_protocol(ALL_TRAFFIC)
                    .from_port(ALL_PORTS)
                    .to_port(ALL_PORTS)
                    .user_id_group_pairs(UserIdGroupPair::builder().group_id(source_group_id).build())
                    .build(),
            )
            .send()
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = aws_sdk_ec2::Error::from(err);
                if err.code() == Some("InvalidPermission.Duplicate") {
                    return Ok(false);
                }
                Err(err.into())
            }
        }
    }
}

/// Returns the ID of the first running instance tagged `name`, if any.
pub async fn find_instance_id(api: &impl InstanceApi, name: &str) -> Result<Option<String>, Error> {
    let instances = api.running_instances(name).await?;
    Ok(instances
        .iter()
        .find_map(|instance| instance.instance_id().map(str::to_string)))
}

/// Builds a tag specification carrying a `Name` and the owning stack
fn tags(resource_type: ResourceType, name: &str, stack: &str) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource_type)
        .tags(Tag::builder().key("Name").value(name).build())
        .tags(Tag::builder().key(STACK_TAG).value(stack).build())
        .build()
}

/// Finds the first two available availability zones (sorted by name)
pub async fn find_availability_zones(client: &Ec2Client) -> Result<Vec<String>, Error> {
    let resp = client
        .describe_availability_zones()
        .filters(Filter::builder().name("state").values("available").build())
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    let mut zones: Vec<String> = resp
        .availability_zones()
        .iter()
        .filter_map(|az| az.zone_name().map(str::to_string))
        .collect();
    zones.sort();
    if zones.len() < 2 {
        return Err(Error::InvalidConfig(
            "region must offer at least two availability zones".into(),
        ));
    }
    zones.truncate(2);
    Ok(zones)
}

/// Creates a VPC and returns its ID
pub async fn create_vpc(client: &Ec2Client, cidr: &str, stack: &str) -> Result<String, Error> {
    let resp = client
        .create_vpc()
        .cidr_block(cidr)
        .tag_specifications(tags(ResourceType::Vpc, &format!("{stack}-vpc"), stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    resp.vpc()
        .and_then(|vpc| vpc.vpc_id())
        .map(str::to_string)
        .ok_or(Error::MissingField("VpcId"))
}

/// Enables DNS support and DNS hostnames on a VPC
pub async fn enable_vpc_dns(client: &Ec2Client, vpc_id: &str) -> Result<(), Error> {
    // Only one attribute may be modified per request
    client
        .modify_vpc_attribute()
        .vpc_id(vpc_id)
        .enable_dns_support(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    client
        .modify_vpc_attribute()
        .vpc_id(vpc_id)
        .enable_dns_hostnames(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok(())
}

/// Creates an internet gateway and returns its ID
pub async fn create_internet_gateway(client: &Ec2Client, stack: &str) -> Result<String, Error> {
    let resp = client
        .create_internet_gateway()
        .tag_specifications(tags(ResourceType::InternetGateway, stack, stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    resp.internet_gateway()
        .and_then(|igw| igw.internet_gateway_id())
        .map(str::to_string)
        .ok_or(Error::MissingField("InternetGatewayId"))
}

/// Attaches an internet gateway to a VPC
pub async fn attach_internet_gateway(
    client: &Ec2Client,
    igw_id: &str,
    vpc_id: &str,
) -> Result<(), Error> {
    client
        .attach_internet_gateway()
        .internet_gateway_id(igw_id)
        .vpc_id(vpc_id)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok(())
}

/// Creates a route table and returns its ID
pub async fn create_route_table(
    client: &Ec2Client,
    vpc_id: &str,
    stack: &str,
) -> Result<String, Error> {
    let resp = client
        .create_route_table()
        .vpc_id(vpc_id)
        .tag_specifications(tags(ResourceType::RouteTable, stack, stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    resp.route_table()
        .and_then(|rt| rt.route_table_id())
        .map(str::to_string)
        .ok_or(Error::MissingField("RouteTableId"))
}

/// Adds a default route through the internet gateway
pub async fn add_default_route(
    client: &Ec2Client,
    route_table_id: &str,
    igw_id: &str,
) -> Result<(), Error> {
    client
        .create_route()
        .route_table_id(route_table_id)
        .destination_cidr_block("0.0.0.0/0")
        .gateway_id(igw_id)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok(())
}

/// Creates a subnet and returns its ID
pub async fn create_subnet(
    client: &Ec2Client,
    vpc_id: &str,
    cidr: &str,
    az: &str,
    name: &str,
    stack: &str,
) -> Result<String, Error> {
    let resp = client
        .create_subnet()
        .vpc_id(vpc_id)
        .cidr_block(cidr)
        .availability_zone(az)
        .tag_specifications(tags(ResourceType::Subnet, name, stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    resp.subnet()
        .and_then(|subnet| subnet.subnet_id())
        .map(str::to_string)
        .ok_or(Error::MissingField("SubnetId"))
}

/// Makes a subnet public: associates the route table and maps public IPs on launch
pub async fn make_subnet_public(
    client: &Ec2Client,
    subnet_id: &str,
    route_table_id: &str,
) -> Result<(), Error> {
    client
        .associate_route_table()
        .route_table_id(route_table_id)
        .subnet_id(subnet_id)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    client
        .modify_subnet_attribute()
        .subnet_id(subnet_id)
        .map_public_ip_on_launch(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok(())
}

/// Creates the stack security group and returns its ID
pub async fn create_security_group(
    client: &Ec2Client,
    vpc_id: &str,
    stack: &str,
) -> Result<String, Error> {
    let name = format!("{stack}-SecurityGroup");
    let resp = client
        .create_security_group()
        .group_name(&name)
        .description(format!("{stack}-Security Group"))
        .vpc_id(vpc_id)
        .tag_specifications(tags(ResourceType::SecurityGroup, &name, stack))
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    resp.group_id()
        .map(str::to_string)
        .ok_or(Error::MissingField("GroupId"))
}

/// Opens the stack security group.
///
/// Ingress is open to all traffic from the managed prefix list and from members of the group
/// itself. Egress keeps the default allow-all rule.
pub async fn authorize_stack_ingress(
    client: &Ec2Client,
    sg_id: &str,
    prefix_list: &str,
) -> Result<(), Error> {
    client
        .authorize_security_group_ingress()
        .group_id(sg_id)
        .ip_permissions(
            IpPermission::builder()
                .ip_protocol(ALL_TRAFFIC)
                .prefix_list_ids(PrefixListId::builder().prefix_list_id(prefix_list).build())
                .build(),
        )
        .ip_permissions(
            IpPermission::builder()
                .ip_protocol(ALL_TRAFFIC)
                .user_id_group_pairs(
                    UserIdGroupPair::builder()
                        .group_id(sg_id)
                        .description("Allow all traffic from self")
                        .build(),
                )
                .build(),
        )
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok(())
}

/// Parameters of a single instance launch
pub struct InstanceRequest<'a> {
    pub image_id: &'a str,
    pub instance_type: &'a str,
    pub key_name: &'a str,
    pub subnet_id: &'a str,
    pub security_group_id: &'a str,
    pub instance_profile: &'a str,
    pub user_data: &'a str,
    pub name: &'a str,
    pub stack: &'a str,
}

/// Returns true if `err` indicates an instance profile that has not propagated yet
fn is_profile_propagating(err: &aws_sdk_ec2::Error) -> bool {
    err.code() == Some("InvalidParameterValue")
        && err
            .message()
            .is_some_and(|message| message.to_lowercase().contains("instance profile"))
}

/// Launches one instance, retrying while its instance profile propagates
pub async fn launch_instance(
    client: &Ec2Client,
    request: &InstanceRequest<'_>,
) -> Result<String, Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = client
            .run_instances()
            .image_id(request.image_id)
            .instance_type(InstanceType::from(request.instance_type))
            .key_name(request.key_name)
            .min_count(1)
            .max_count(1)
            .subnet_id(request.subnet_id)
            .security_group_ids(request.security_group_id)
            .iam_instance_profile(
                IamInstanceProfileSpecification::builder()
                    .name(request.instance_profile)
                    .build(),
            )
            .user_data(BASE64.encode(request.user_data))
            .tag_specifications(tags(ResourceType::Instance, request.name, request.stack))
            .send()
            .await;
        match result {
            Ok(resp) => {
                return resp
                    .instances()
                    .first()
                    .and_then(|instance| instance.instance_id())
                    .map(str::to_string)
                    .ok_or(Error::MissingField("InstanceId"));
            }
            Err(err) => {
                let err = aws_sdk_ec2::Error::from(err);
                if attempt < PROFILE_PROPAGATION_ATTEMPTS && is_profile_propagating(&err) {
                    warn!(attempt, "instance profile not yet available");
                    sleep(PROFILE_PROPAGATION_DELAY).await;
                    continue;
                }
                return Err(err.into());
            }
        }
    }
}

/// Returns the state of an instance (or `None` if it is not yet visible)
async fn instance_state(
    client: &Ec2Client,
    instance_id: &str,
) -> Result<Option<InstanceStateName>, Error> {
    let resp = client
        .describe_instances()
        .instance_ids(instance_id)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    Ok(resp
        .reservations()
        .iter()
        .flat_map(|reservation| reservation.instances())
        .find_map(|instance| instance.state().and_then(|state| state.name()).cloned()))
}

/// Waits for an instance to reach the `running` state
pub async fn wait_for_instance_running(client: &Ec2Client, instance_id: &str) -> Result<(), Error> {
    wait_for(&format!("instance {instance_id} to run"), move || async move {
        Ok((instance_state(client, instance_id).await? == Some(InstanceStateName::Running))
            .then_some(()))
    })
    .await?;
    info!(instance_id, "instance running");
    Ok(())
}

/// Creates a launch template for the ECS hosts (IMDSv2 required, public IP)
#[allow(clippy::too_many_arguments)]
pub async fn create_launch_template(
    client: &Ec2Client,
    name: &str,
    image_id: &str,
    instance_type: &str,
    key_name: &str,
    instance_profile: &str,
    security_group_id: &str,
    user_data: &str,
) -> Result<String, Error> {
    let data = RequestLaunchTemplateData::builder()
        .image_id(image_id)
        .instance_type(InstanceType::from(instance_type))
        .key_name(key_name)
        .iam_instance_profile(
            LaunchTemplateIamInstanceProfileSpecificationRequest::builder()
                .name(instance_profile)
                .build(),
        )
        .metadata_options(
            LaunchTemplateInstanceMetadataOptionsRequest::builder()
                .http_tokens(LaunchTemplateHttpTokensState::Required)
                .build(),
        )
        .network_interfaces(
            LaunchTemplateInstanceNetworkInterfaceSpecificationRequest::builder()
                .device_index(0)
                .associate_public_ip_address(true)
                .groups(security_group_id)
                .build(),
        )
        .user_data(BASE64.encode(user_data))
        .build();
    let resp = client
        .create_launch_template()
        .launch_template_name(name)
        .launch_template_data(data)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from)?;
    resp.launch_template()
        .and_then(|template| template.launch_template_id())
        .map(str::to_string)
        .ok_or(Error::MissingField("LaunchTemplateId"))
}

/// Terminates an instance and waits until it is gone
pub async fn terminate_instance(client: &Ec2Client, instance_id: &str) -> Result<(), Error> {
    let result = client
        .terminate_instances()
        .instance_ids(instance_id)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_ec2::Error::from(err)));
    if ignore_not_found(result)?.is_none() {
        return Ok(());
    }
    wait_for(&format!("instance {instance_id} to terminate"), move || async move {
        let state = instance_state(client, instance_id).await?;
        Ok(matches!(state, None | Some(InstanceStateName::Terminated)).then_some(()))
    })
    .await?;
    info!(instance_id, "instance terminated");
    Ok(())
}

/// Deletes a launch template
pub async fn delete_launch_template(client: &Ec2Client, template_id: &str) -> Result<(), Error> {
    let result = client
        .delete_launch_template()
        .launch_template_id(template_id)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_ec2::Error::from(err)));
    ignore_not_found(result)?;
    Ok(())
}

/// Deletes a security group, retrying while dependent network interfaces drain
pub async fn delete_security_group(client: &Ec2Client, sg_id: &str) -> Result<(), Error> {
    wait_for(&format!("security group {sg_id} to delete"), move || async move {
        let result = client
            .delete_security_group()
            .group_id(sg_id)
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from);
        match result {
            Ok(_) => Ok(Some(())),
            Err(err) if err.code() == Some("DependencyViolation") => Ok(None),
            Err(err) => ignore_not_found::<()>(Err(err.into())).map(|_| Some(())),
        }
    })
    .await
}

/// Deletes a subnet, retrying while dependent network interfaces drain
pub async fn delete_subnet(client: &Ec2Client, subnet_id: &str) -> Result<(), Error> {
    wait_for(&format!("subnet {subnet_id} to delete"), move || async move {
        let result = client
            .delete_subnet()
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from);
        match result {
            Ok(_) => Ok(Some(())),
            Err(err) if err.code() == Some("DependencyViolation") => Ok(None),
            Err(err) => ignore_not_found::<()>(Err(err.into())).map(|_| Some(())),
        }
    })
    .await
}

/// Returns true if `err` reports a gateway that is not attached to the VPC
fn is_not_attached(err: &aws_sdk_ec2::Error) -> bool {
    err.code() == Some("Gateway.NotAttached")
}

/// Detaches an internet gateway from a VPC and deletes it
pub async fn delete_igw(client: &Ec2Client, igw_id: &str, vpc_id: &str) -> Result<(), Error> {
    let result = client
        .detach_internet_gateway()
        .internet_gateway_id(igw_id)
        .vpc_id(vpc_id)
        .send()
        .await
        .map_err(aws_sdk_ec2::Error::from);
    match result {
        Ok(_) => {}
        // A previous run may have detached the gateway without deleting it
        Err(err) if is_not_attached(&err) => {}
        Err(err) => {
            ignore_not_found::<()>(Err(err.into()))?;
        }
    }
    let result = client
        .delete_internet_gateway()
        .internet_gateway_id(igw_id)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_ec2::Error::from(err)));
    ignore_not_found(result)?;
    Ok(())
}

/// Deletes a route table
pub async fn delete_route_table(client: &Ec2Client, route_table_id: &str) -> Result<(), Error> {
    let result = client
        .delete_route_table()
        .route_table_id(route_table_id)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_ec2::Error::from(err)));
    ignore_not_found(result)?;
    Ok(())
}

/// Deletes a VPC
pub async fn delete_vpc(client: &Ec2Client, vpc_id: &str) -> Result<(), Error> {
    let result = client
        .delete_vpc()
        .vpc_id(vpc_id)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_ec2::Error::from(err)));
    ignore_not_found(result)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_ec2::{
        error::{ErrorMetadata, SdkError},
        operation::detach_internet_gateway::DetachInternetGatewayError,
    };

    fn error(code: &str, message: &str) -> aws_sdk_ec2::Error {
        let err = DetachInternetGatewayError::generic(
            ErrorMetadata::builder().code(code).message(message).build(),
        );
        SdkError::<DetachInternetGatewayError, ()>::service_error(err, ()).into()
    }

    #[test]
    fn test_detached_gateway_is_tolerated() {
        assert!(is_not_attached(&error(
            "Gateway.NotAttached",
            "resource igw-1 is not attached to network vpc-1"
        )));
        assert!(!is_not_attached(&error("DependencyViolation", "in use")));
    }

    #[test]
    fn test_profile_propagation_detection() {
        assert!(is_profile_propagating(&error(
            "InvalidParameterValue",
            "Value (stack-WindowsInstanceRole) for parameter iamInstanceProfile.name is invalid. Invalid IAM Instance Profile name"
        )));
        assert!(!is_profile_propagating(&error(
            "InvalidParameterValue",
            "Invalid value 't9.huge' for InstanceType"
        )));
        assert!(!is_profile_propagating(&error("UnauthorizedOperation", "instance profile")));
    }
}
