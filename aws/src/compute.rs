//! EC2 implementation of the [`CloudCompute`] seam

use async_trait::async_trait;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{Filter, InstanceStateName};
use broker_bench_core::traits::{
    CloudCompute, CloudError, GatewayView, InstanceState, InstanceView,
};

/// Tag-scoped EC2 client
///
/// All queries filter on a single tag pair, so discovery never depends on
/// provisioner state. The client is cheap to clone and safe for
/// concurrent use.
pub struct Ec2Compute {
    client: aws_sdk_ec2::Client,
}

impl Ec2Compute {
    /// Wrap an EC2 client
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Ec2Compute { client }
    }

    fn tag_filter(key: &str, value: &str) -> Filter {
        Filter::builder()
            .name(format!("tag:{key}"))
            .values(value)
            .build()
    }
}

/// Map an SDK error onto the seam's error kinds
fn classify<E>(err: SdkError<E>) -> CloudError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            return CloudError::Throttled(format!("transport: {err}"));
        }
        _ => {}
    }
    let code = err.code().unwrap_or_default();
    if code == "Throttling" || code == "RequestLimitExceeded" {
        CloudError::Throttled(format!("{code}: {err}"))
    } else if code.ends_with(".NotFound") {
        CloudError::NotFound(format!("{code}: {err}"))
    } else {
        CloudError::Api(format!("{code}: {err}"))
    }
}

fn map_state(state: Option<&InstanceStateName>) -> InstanceState {
    match state {
        Some(InstanceStateName::Pending) => InstanceState::Pending,
        Some(InstanceStateName::Running) => InstanceState::Running,
        Some(InstanceStateName::ShuttingDown) => InstanceState::ShuttingDown,
        Some(InstanceStateName::Stopped) | Some(InstanceStateName::Stopping) => {
            InstanceState::Stopped
        }
        Some(InstanceStateName::Terminated) => InstanceState::Terminated,
        _ => InstanceState::Other,
    }
}

#[async_trait]
impl CloudCompute for Ec2Compute {
    async fn instances_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<InstanceView>, CloudError> {
        let output = self
            .client
            .describe_instances()
            .filters(Self::tag_filter(key, value))
            .send()
            .await
            .map_err(classify)?;

        let mut views = Vec::new();
        for reservation in output.reservations() {
            for instance in reservation.instances() {
                let Some(id) = instance.instance_id() else {
                    continue;
                };
                views.push(InstanceView {
                    id: id.to_string(),
                    state: map_state(instance.state().and_then(|s| s.name())),
                    private_ip: instance.private_ip_address().map(str::to_string),
                });
            }
        }
        Ok(views)
    }

    async fn terminate_instances(&self, ids: &[String]) -> Result<(), CloudError> {
        if ids.is_empty() {
            return Ok(());
        }
        self.client
            .terminate_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn volumes_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>, CloudError> {
        let output = self
            .client
            .describe_volumes()
            .filters(Self::tag_filter(key, value))
            .send()
            .await
            .map_err(classify)?;
        Ok(output
            .volumes()
            .iter()
            .filter_map(|v| v.volume_id().map(str::to_string))
            .collect())
    }

    async fn delete_volume(&self, id: &str) -> Result<(), CloudError> {
        self.client
            .delete_volume()
            .volume_id(id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn security_groups_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, CloudError> {
        let output = self
            .client
            .describe_security_groups()
            .filters(Self::tag_filter(key, value))
            .send()
            .await
            .map_err(classify)?;
        Ok(output
            .security_groups()
            .iter()
            // The VPC default group cannot be deleted
            .filter(|g| g.group_name() != Some("default"))
            .filter_map(|g| g.group_id().map(str::to_string))
            .collect())
    }

    async fn delete_security_group(&self, id: &str) -> Result<(), CloudError> {
        self.client
            .delete_security_group()
            .group_id(id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn subnets_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>, CloudError> {
        let output = self
            .client
            .describe_subnets()
            .filters(Self::tag_filter(key, value))
            .send()
            .await
            .map_err(classify)?;
        Ok(output
            .subnets()
            .iter()
            .filter_map(|s| s.subnet_id().map(str::to_string))
            .collect())
    }

    async fn delete_subnet(&self, id: &str) -> Result<(), CloudError> {
        self.client
            .delete_subnet()
            .subnet_id(id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn route_tables_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, CloudError> {
        let output = self
            .client
            .describe_route_tables()
            .filters(Self::tag_filter(key, value))
            .send()
            .await
            .map_err(classify)?;
        Ok(output
            .route_tables()
            .iter()
            // The VPC main table is deleted with the VPC itself
            .filter(|t| {
                !t.associations()
                    .iter()
                    .any(|a| a.main().unwrap_or(false))
            })
            .filter_map(|t| t.route_table_id().map(str::to_string))
            .collect())
    }

    async fn delete_route_table(&self, id: &str) -> Result<(), CloudError> {
        self.client
            .delete_route_table()
            .route_table_id(id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn internet_gateways_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<GatewayView>, CloudError> {
        let output = self
            .client
            .describe_internet_gateways()
            .filters(Self::tag_filter(key, value))
            .send()
            .await
            .map_err(classify)?;
        Ok(output
            .internet_gateways()
            .iter()
            .filter_map(|g| {
                g.internet_gateway_id().map(|id| GatewayView {
                    id: id.to_string(),
                    attached_vpcs: g
                        .attachments()
                        .iter()
                        .filter_map(|a| a.vpc_id().map(str::to_string))
                        .collect(),
                })
            })
            .collect())
    }

    async fn detach_internet_gateway(&self, id: &str, vpc: &str) -> Result<(), CloudError> {
        self.client
            .detach_internet_gateway()
            .internet_gateway_id(id)
            .vpc_id(vpc)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_internet_gateway(&self, id: &str) -> Result<(), CloudError> {
        self.client
            .delete_internet_gateway()
            .internet_gateway_id(id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn vpcs_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>, CloudError> {
        let output = self
            .client
            .describe_vpcs()
            .filters(Self::tag_filter(key, value))
            .send()
            .await
            .map_err(classify)?;
        Ok(output
            .vpcs()
            .iter()
            .filter_map(|v| v.vpc_id().map(str::to_string))
            .collect())
    }

    async fn delete_vpc(&self, id: &str) -> Result<(), CloudError> {
        self.client
            .delete_vpc()
            .vpc_id(id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }
}
