//! AWS-backed implementations of the broker-bench trait seams
//!
//! - [`Ec2Compute`]: tag-scoped compute discovery and destruction over
//!   `aws-sdk-ec2`
//! - [`SsmControlPlane`]: asynchronous remote command channel over
//!   `aws-sdk-ssm` (SendCommand / GetCommandInvocation)
//!
//! One shared credential/region configuration is loaded per process and
//! both clients are built from it.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod compute;
mod control;

pub use compute::Ec2Compute;
pub use control::SsmControlPlane;

use aws_config::{BehaviorVersion, Region};
use std::sync::Arc;

/// Both AWS backends, built from one shared configuration
pub struct AwsBackends {
    /// Compute / reclaim client
    pub compute: Arc<Ec2Compute>,
    /// Control-plane client
    pub control: Arc<SsmControlPlane>,
}

/// Load shared AWS configuration and build both clients
///
/// `region` overrides the environment/profile default when given.
pub async fn connect(region: Option<String>) -> AwsBackends {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region));
    }
    let shared = loader.load().await;

    AwsBackends {
        compute: Arc::new(Ec2Compute::new(aws_sdk_ec2::Client::new(&shared))),
        control: Arc::new(SsmControlPlane::new(aws_sdk_ssm::Client::new(&shared))),
    }
}
