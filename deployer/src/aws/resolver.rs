//! AWS Route 53 Resolver SDK function wrappers
//!
//! Forwards DNS queries for the directory's domain from the VPC to its domain controllers.

use crate::aws::{
    utils::{ignore_not_found, wait_for},
    Error,
};
use aws_sdk_route53resolver::{
    types::{
        IpAddressRequest, ResolverEndpointDirection, ResolverEndpointStatus,
        ResolverRuleAssociationStatus, ResolverRuleStatus, RuleTypeOption, TargetAddress,
    },
    Client as ResolverClient,
};
use tracing::info;
use uuid::Uuid;

/// Name of the outbound resolver endpoint
const ENDPOINT_NAME: &str = "resolver";

/// Creates an outbound resolver endpoint with one address in each subnet
pub async fn create_outbound_endpoint(
    client: &ResolverClient,
    subnet_ids: &[String],
    security_group_id: &str,
) -> Result<String, Error> {
    let mut request = client
        .create_resolver_endpoint()
        .creator_request_id(Uuid::new_v4().to_string())
        .name(ENDPOINT_NAME)
        .direction(ResolverEndpointDirection::Outbound)
        .security_group_ids(security_group_id);
    for subnet_id in subnet_ids {
        request = request.ip_addresses(IpAddressRequest::builder().subnet_id(subnet_id).build()?);
    }
    let resp = request
        .send()
        .await
        .map_err(aws_sdk_route53resolver::Error::from)?;
    resp.resolver_endpoint()
        .and_then(|endpoint| endpoint.id())
        .map(str::to_string)
        .ok_or(Error::MissingField("ResolverEndpointId"))
}

/// Waits for an endpoint to become operational
pub async fn wait_for_endpoint(client: &ResolverClient, endpoint_id: &str) -> Result<(), Error> {
    let id = endpoint_id;
    wait_for(
        &format!("resolver endpoint {id} to become operational"),
        move || async move {
            let resp = client
                .get_resolver_endpoint()
                .resolver_endpoint_id(id)
                .send()
                .await
                .map_err(aws_sdk_route53resolver::Error::from)?;
            let status = resp.resolver_endpoint().and_then(|endpoint| endpoint.status());
            match status {
                Some(ResolverEndpointStatus::Operational) => Ok(Some(())),
                Some(ResolverEndpointStatus::ActionNeeded) => Err(Error::ResourceFailed(format!(
                    "resolver endpoint {id} (action needed)"
                ))),
                _ => Ok(None),
            }
        },
    )
    .await?;
    info!(endpoint_id, "resolver endpoint operational");
    Ok(())
}

/// Creates a rule forwarding `domain_name` to `target_ips` through the endpoint
pub async fn create_forward_rule(
    client: &ResolverClient,
    domain_name: &str,
    endpoint_id: &str,
    target_ips: &[String],
) -> Result<String, Error> {
    let targets = target_ips
        .iter()
        .map(|ip| TargetAddress::builder().ip(ip).build())
        .collect();
    let resp = client
        .create_resolver_rule()
        .creator_request_id(Uuid::new_v4().to_string())
        .domain_name(domain_name)
        .rule_type(RuleTypeOption::Forward)
        .resolver_endpoint_id(endpoint_id)
        .set_target_ips(Some(targets))
        .send()
        .await
        .map_err(aws_sdk_route53resolver::Error::from)?;
    resp.resolver_rule()
        .and_then(|rule| rule.id())
        .map(str::to_string)
        .ok_or(Error::MissingField("ResolverRuleId"))
}

/// Waits for a rule to reach `COMPLETE`
pub async fn wait_for_rule(client: &ResolverClient, rule_id: &str) -> Result<(), Error> {
    let id = rule_id;
    wait_for(&format!("resolver rule {id}"), move || async move {
        let resp = client
            .get_resolver_rule()
            .resolver_rule_id(id)
            .send()
            .await
            .map_err(aws_sdk_route53resolver::Error::from)?;
        let status = resp.resolver_rule().and_then(|rule| rule.status());
        Ok((status == Some(&ResolverRuleStatus::Complete)).then_some(()))
    })
    .await?;
    info!(rule_id, "resolver rule created");
    Ok(())
}

/// Associates a resolver rule with a VPC
pub async fn associate_rule(
    client: &ResolverClient,
    rule_id: &str,
    vpc_id: &str,
    name: &str,
) -> Result<String, Error> {
    let resp = client
        .associate_resolver_rule()
        .resolver_rule_id(rule_id)
        .vpc_id(vpc_id)
        .name(name)
        .send()
        .await
        .map_err(aws_sdk_route53resolver::Error::from)?;
    resp.resolver_rule_association()
        .and_then(|association| association.id())
        .map(str::to_string)
        .ok_or(Error::MissingField("ResolverRuleAssociationId"))
}

/// Waits for a rule association to reach `COMPLETE`
pub async fn wait_for_rule_association(
    client: &ResolverClient,
    association_id: &str,
) -> Result<(), Error> {
    let id = association_id;
    wait_for(
        &format!("resolver rule association {id}"),
        move || async move {
            let resp = client
                .get_resolver_rule_association()
                .resolver_rule_association_id(id)
                .send()
                .await
                .map_err(aws_sdk_route53resolver::Error::from)?;
            let status = resp
                .resolver_rule_association()
                .and_then(|association| association.status());
            match status {
                Some(ResolverRuleAssociationStatus::Complete) => Ok(Some(())),
                Some(ResolverRuleAssociationStatus::Failed) => Err(Error::ResourceFailed(format!(
                    "resolver rule association {id} (failed)"
                ))),
                _ => Ok(None),
            }
        },
    )
    .await?;
    info!(association_id, "resolver rule associated");
    Ok(())
}

/// Removes a rule's association with a VPC
pub async fn disassociate_rule(
    client: &ResolverClient,
    rule_id: &str,
    vpc_id: &str,
) -> Result<(), Error> {
    let result = client
        .disassociate_resolver_rule()
        .resolver_rule_id(rule_id)
        .vpc_id(vpc_id)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_route53resolver::Error::from(err)));
    if ignore_not_found(result)?.is_none() {
        return Ok(());
    }

    // The rule cannot be deleted until the association is gone
    wait_for(&format!("resolver rule {rule_id} to disassociate"), move || async move {
        let resp = client
            .list_resolver_rule_associations()
            .filters(
                aws_sdk_route53resolver::types::Filter::builder()
                    .name("ResolverRuleId")
                    .values(rule_id)
                    .build(),
            )
            .send()
            .await
            .map_err(aws_sdk_route53resolver::Error::from)?;
        Ok(resp.resolver_rule_associations().is_empty().then_some(()))
    })
    .await
}

/// Deletes a resolver rule
pub async fn delete_rule(client: &ResolverClient, rule_id: &str) -> Result<(), Error> {
    let result = client
        .delete_resolver_rule()
        .resolver_rule_id(rule_id)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_route53resolver::Error::from(err)));
    ignore_not_found(result)?;
    Ok(())
}

/// Deletes a resolver endpoint and waits until it is gone
pub async fn delete_endpoint(client: &ResolverClient, endpoint_id: &str) -> Result<(), Error> {
    let result = client
        .delete_resolver_endpoint()
        .resolver_endpoint_id(endpoint_id)
        .send()
        .await
        .map_err(|err| Error::from(aws_sdk_route53resolver::Error::from(err)));
    if ignore_not_found(result)?.is_none() {
        return Ok(());
    }
    wait_for(
        &format!("resolver endpoint {endpoint_id} to delete"),
        move || async move {
            let result = client
                .get_resolver_endpoint()
                .resolver_endpoint_id(endpoint_id)
                .send()
                .await
                .map_err(|err| Error::from(aws_sdk_route53resolver::Error::from(err)));
            Ok(ignore_not_found(result)?.is_none().then_some(()))
        },
    )
    .await
}
