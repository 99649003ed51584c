//! SSM implementation of the [`ControlPlane`] seam
//!
//! Commands are submitted with `SendCommand` against the stock
//! `AWS-RunShellScript` document and polled with `GetCommandInvocation`.
//! The orchestrator never opens an interactive session.

use async_trait::async_trait;
use aws_sdk_ssm::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ssm::types::{CommandInvocationStatus, InstanceInformationStringFilter, PingStatus};
use broker_bench_core::traits::{
    CommandId, CommandPoll, CommandStatus, ControlPlane, ControlPlaneError,
};

/// Budget for one SendCommand payload. The service caps the whole request
/// well above this; staying conservative leaves room for framing.
const MAX_PAYLOAD_BYTES: usize = 48 * 1024;

const RUN_SHELL_DOCUMENT: &str = "AWS-RunShellScript";

/// SSM-backed control plane
pub struct SsmControlPlane {
    client: aws_sdk_ssm::Client,
}

impl SsmControlPlane {
    /// Wrap an SSM client
    pub fn new(client: aws_sdk_ssm::Client) -> Self {
        SsmControlPlane { client }
    }
}

/// Map an SDK error onto the seam's error kinds
fn classify<E>(err: SdkError<E>) -> ControlPlaneError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            return ControlPlaneError::Transient(format!("transport: {err}"));
        }
        _ => {}
    }
    let code = err.code().unwrap_or_default();
    match code {
        "ThrottlingException" => ControlPlaneError::Throttled(format!("{code}: {err}")),
        // The invocation record lags the submission briefly
        "InvocationDoesNotExist" => ControlPlaneError::Transient(format!("{code}: {err}")),
        _ => ControlPlaneError::Api(format!("{code}: {err}")),
    }
}

fn map_status(status: Option<&CommandInvocationStatus>) -> CommandStatus {
    match status {
        Some(CommandInvocationStatus::Pending) | Some(CommandInvocationStatus::Delayed) => {
            CommandStatus::Pending
        }
        Some(CommandInvocationStatus::InProgress) => CommandStatus::InProgress,
        Some(CommandInvocationStatus::Success) => CommandStatus::Success,
        Some(CommandInvocationStatus::Cancelled) => CommandStatus::Cancelled,
        Some(CommandInvocationStatus::TimedOut) => CommandStatus::TimedOut,
        // Cancelling resolves to Cancelled on a later poll
        Some(CommandInvocationStatus::Cancelling) => CommandStatus::InProgress,
        _ => CommandStatus::Failed,
    }
}

#[async_trait]
impl ControlPlane for SsmControlPlane {
    async fn submit(&self, host: &str, payload: &str) -> Result<CommandId, ControlPlaneError> {
        let output = self
            .client
            .send_command()
            .instance_ids(host)
            .document_name(RUN_SHELL_DOCUMENT)
            .parameters("commands", vec![payload.to_string()])
            .send()
            .await
            .map_err(classify)?;

        output
            .command()
            .and_then(|c| c.command_id())
            .map(|id| CommandId(id.to_string()))
            .ok_or_else(|| ControlPlaneError::Api("SendCommand returned no command id".into()))
    }

    async fn poll(&self, host: &str, id: &CommandId) -> Result<CommandPoll, ControlPlaneError> {
        let output = self
            .client
            .get_command_invocation()
            .command_id(&id.0)
            .instance_id(host)
            .send()
            .await
            .map_err(classify)?;

        let status = map_status(output.status());
        Ok(CommandPoll {
            status,
            stdout: output.standard_output_content().unwrap_or_default().to_string(),
            stderr: output.standard_error_content().unwrap_or_default().to_string(),
            exit_code: status.is_terminal().then_some(output.response_code()),
        })
    }

    async fn cancel(&self, host: &str, id: &CommandId) -> Result<(), ControlPlaneError> {
        self.client
            .cancel_command()
            .command_id(&id.0)
            .instance_ids(host)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn agent_online(&self, host: &str) -> Result<bool, ControlPlaneError> {
        let output = self
            .client
            .describe_instance_information()
            .filters(
                InstanceInformationStringFilter::builder()
                    .key("InstanceIds")
                    .values(host)
                    .build()
                    .map_err(|e| ControlPlaneError::Api(e.to_string()))?,
            )
            .send()
            .await
            .map_err(classify)?;

        Ok(output
            .instance_information_list()
            .iter()
            .any(|info| info.ping_status() == Some(&PingStatus::Online)))
    }

    fn max_payload_bytes(&self) -> usize {
        MAX_PAYLOAD_BYTES
    }
}
