//! Trait seams for the cloud API, the control plane, and the provisioner
//!
//! These traits are defined in core to keep the orchestration logic free of
//! any provider SDK. Production implementations live in `broker-bench-aws`;
//! tests use in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ============================================================================
// Cloud compute API
// ============================================================================

/// Cloud-level state of a compute instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Requested but not yet running
    Pending,
    /// Running
    Running,
    /// Shutting down towards termination
    ShuttingDown,
    /// Stopped (still billed for storage)
    Stopped,
    /// Terminated
    Terminated,
    /// Any state the provider reports that we do not model
    Other,
}

/// Compute instance as seen through a tag query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceView {
    /// Opaque cloud identifier
    pub id: String,
    /// Cloud-level lifecycle state
    pub state: InstanceState,
    /// Private IP, when assigned
    pub private_ip: Option<String>,
}

/// Internet gateway with its attachment set (must be detached before delete)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayView {
    /// Gateway identifier
    pub id: String,
    /// VPC identifiers this gateway is attached to
    pub attached_vpcs: Vec<String>,
}

/// Errors surfaced by the cloud compute API
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// The referenced resource does not exist (treated as success on delete)
    #[error("not found: {0}")]
    NotFound(String),

    /// Provider-side rate limiting
    #[error("throttled: {0}")]
    Throttled(String),

    /// Any other API failure
    #[error("cloud API error: {0}")]
    Api(String),
}

impl CloudError {
    /// Throttle-kind errors are retried with backoff
    pub fn is_throttle(&self) -> bool {
        matches!(self, CloudError::Throttled(_))
    }

    /// Not-found on deletion means the work is already done
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }
}

/// Tag-scoped view of the compute layer
///
/// One client instance is shared across the whole process; implementations
/// must be safe for concurrent use. All queries take a `(key, value)` tag
/// filter so discovery never depends on provisioner state.
#[async_trait]
pub trait CloudCompute: Send + Sync {
    /// List instances carrying the tag, including non-running ones
    async fn instances_by_tag(&self, key: &str, value: &str)
        -> Result<Vec<InstanceView>, CloudError>;

    /// Request termination of the given instances
    async fn terminate_instances(&self, ids: &[String]) -> Result<(), CloudError>;

    /// List volumes carrying the tag
    async fn volumes_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>, CloudError>;

    /// Delete one volume
    async fn delete_volume(&self, id: &str) -> Result<(), CloudError>;

    /// List security groups carrying the tag
    async fn security_groups_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, CloudError>;

    /// Delete one security group
    async fn delete_security_group(&self, id: &str) -> Result<(), CloudError>;

    /// List subnets carrying the tag
    async fn subnets_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>, CloudError>;

    /// Delete one subnet
    async fn delete_subnet(&self, id: &str) -> Result<(), CloudError>;

    /// List route tables carrying the tag (main tables excluded)
    async fn route_tables_by_tag(&self, key: &str, value: &str)
        -> Result<Vec<String>, CloudError>;

    /// Delete one route table
    async fn delete_route_table(&self, id: &str) -> Result<(), CloudError>;

    /// List internet gateways carrying the tag, with attachments
    async fn internet_gateways_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<GatewayView>, CloudError>;

    /// Detach a gateway from a VPC
    async fn detach_internet_gateway(&self, id: &str, vpc: &str) -> Result<(), CloudError>;

    /// Delete one internet gateway
    async fn delete_internet_gateway(&self, id: &str) -> Result<(), CloudError>;

    /// List VPCs carrying the tag
    async fn vpcs_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>, CloudError>;

    /// Delete one VPC
    async fn delete_vpc(&self, id: &str) -> Result<(), CloudError>;
}

// ============================================================================
// Control plane
// ============================================================================

/// Identifier of a submitted command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub String);

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a submitted command, as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Accepted, not yet dispatched to the agent
    Pending,
    /// Running on the host
    InProgress,
    /// Finished with exit code 0
    Success,
    /// Finished with a non-zero exit code
    Failed,
    /// Cancelled by request
    Cancelled,
    /// Killed by the control plane's own execution timeout
    TimedOut,
}

impl CommandStatus {
    /// Whether polling can stop
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Pending | CommandStatus::InProgress)
    }

    /// Narrow to the terminal subset, if terminal
    pub fn terminal(&self) -> Option<TerminalStatus> {
        match self {
            CommandStatus::Success => Some(TerminalStatus::Success),
            CommandStatus::Failed => Some(TerminalStatus::Failed),
            CommandStatus::Cancelled => Some(TerminalStatus::Cancelled),
            CommandStatus::TimedOut => Some(TerminalStatus::TimedOut),
            _ => None,
        }
    }
}

/// Terminal subset of [`CommandStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalStatus {
    /// Finished with exit code 0
    Success,
    /// Finished with a non-zero exit code
    Failed,
    /// Cancelled by request
    Cancelled,
    /// Killed by a timeout
    TimedOut,
}

/// One poll of a command's status and captured output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPoll {
    /// Current status
    pub status: CommandStatus,
    /// Captured standard output (complete once terminal)
    pub stdout: String,
    /// Captured standard error (complete once terminal)
    pub stderr: String,
    /// Exit code, once terminal
    pub exit_code: Option<i32>,
}

/// Errors surfaced by the control plane
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    /// Transient transport or provider failure; polls retry these
    #[error("control plane transient error: {0}")]
    Transient(String),

    /// Provider-side rate limiting
    #[error("control plane throttled: {0}")]
    Throttled(String),

    /// Submission or lookup rejected outright
    #[error("control plane error: {0}")]
    Api(String),
}

impl ControlPlaneError {
    /// Whether a poll-side retry is worthwhile
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlPlaneError::Transient(_) | ControlPlaneError::Throttled(_)
        )
    }
}

/// Asynchronous remote command channel
///
/// Two operations: submit a shell payload (returns an identifier) and poll
/// the resulting invocation until terminal. The orchestrator never opens an
/// interactive shell. Implementations must be safe for concurrent use.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Submit a shell payload to a host; returns the command identifier
    async fn submit(&self, host: &str, payload: &str) -> Result<CommandId, ControlPlaneError>;

    /// Poll a previously submitted command
    async fn poll(&self, host: &str, id: &CommandId) -> Result<CommandPoll, ControlPlaneError>;

    /// Best-effort cancellation of an in-flight command
    async fn cancel(&self, host: &str, id: &CommandId) -> Result<(), ControlPlaneError>;

    /// Whether the host has an active agent registration
    async fn agent_online(&self, host: &str) -> Result<bool, ControlPlaneError>;

    /// Largest payload a single submission accepts, in bytes
    fn max_payload_bytes(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_status_terminal() {
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(!CommandStatus::InProgress.is_terminal());
        assert!(CommandStatus::Success.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(CommandStatus::Cancelled.is_terminal());
        assert!(CommandStatus::TimedOut.is_terminal());
    }

    #[test]
    fn test_terminal_narrowing() {
        assert_eq!(
            CommandStatus::Success.terminal(),
            Some(TerminalStatus::Success)
        );
        assert_eq!(CommandStatus::Pending.terminal(), None);
    }

    #[test]
    fn test_cloud_error_classification() {
        assert!(CloudError::Throttled("slow down".into()).is_throttle());
        assert!(CloudError::NotFound("vol-1".into()).is_not_found());
        assert!(!CloudError::Api("boom".into()).is_throttle());
    }

    #[test]
    fn test_control_plane_error_retryable() {
        assert!(ControlPlaneError::Transient("net".into()).is_retryable());
        assert!(ControlPlaneError::Throttled("rate".into()).is_retryable());
        assert!(!ControlPlaneError::Api("denied".into()).is_retryable());
    }
}
