//! In-memory fakes of the cloud, control-plane, and provisioner seams
//!
//! Shared by the component test modules. Behaviour is scripted per payload
//! substring (control plane) or mutated directly (cloud state).

use crate::experiment::{ExperimentId, TAG_EXPERIMENT_ID};
use crate::fleet::Role;
use crate::provisioner::{InfraVars, Provision, ProvisionError, ProvisionOutputs, RoleOutputs};
use crate::store::ExperimentDir;
use crate::traits::{
    CloudCompute, CloudError, CommandId, CommandPoll, CommandStatus, ControlPlane,
    ControlPlaneError, GatewayView, InstanceState, InstanceView, TerminalStatus,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Fake control plane
// ============================================================================

/// Scripted behaviour for commands matching a payload substring
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    /// Number of `InProgress` polls before the terminal status
    pub polls: usize,
    /// Terminal status; `None` never terminates (deadline tests)
    pub terminal: Option<TerminalStatus>,
    /// stdout reported once terminal
    pub stdout: String,
    /// stderr reported once terminal
    pub stderr: String,
    /// exit code reported once terminal
    pub exit_code: i32,
}

impl FakeBehavior {
    pub fn success(stdout: impl Into<String>) -> Self {
        FakeBehavior {
            polls: 0,
            terminal: Some(TerminalStatus::Success),
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failure(stderr: impl Into<String>) -> Self {
        FakeBehavior {
            polls: 0,
            terminal: Some(TerminalStatus::Failed),
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: 1,
        }
    }

    pub fn never_terminal() -> Self {
        FakeBehavior {
            polls: 0,
            terminal: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn with_polls(mut self, polls: usize) -> Self {
        self.polls = polls;
        self
    }
}

struct Invocation {
    behavior: FakeBehavior,
    polls_left: usize,
    cancelled: bool,
}

#[derive(Default)]
struct ControlInner {
    rules: Vec<(String, FakeBehavior)>,
    invocations: HashMap<String, Invocation>,
    submitted: Vec<(String, String)>,
    offline: HashSet<String>,
    submit_failures: usize,
    poll_failures: usize,
    next_id: u64,
}

/// In-memory [`ControlPlane`]
pub struct FakeControlPlane {
    inner: Mutex<ControlInner>,
    max_payload: usize,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        FakeControlPlane {
            inner: Mutex::new(ControlInner::default()),
            max_payload: 48 * 1024,
        }
    }

    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    /// Script behaviour for payloads containing `needle`; last rule wins
    pub fn on(&self, needle: impl Into<String>, behavior: FakeBehavior) {
        self.inner
            .lock()
            .unwrap()
            .rules
            .push((needle.into(), behavior));
    }

    /// Mark a host's agent as offline for `agent_online`
    pub fn set_agent_offline(&self, host: &str, offline: bool) {
        let mut inner = self.inner.lock().unwrap();
        if offline {
            inner.offline.insert(host.to_string());
        } else {
            inner.offline.remove(host);
        }
    }

    /// The next `n` submissions fail with a transient error
    pub fn fail_next_submits(&self, n: usize) {
        self.inner.lock().unwrap().submit_failures = n;
    }

    /// The next `n` polls fail with a transient error
    pub fn fail_next_polls(&self, n: usize) {
        self.inner.lock().unwrap().poll_failures = n;
    }

    /// All `(host, payload)` pairs submitted so far
    pub fn submitted(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().submitted.clone()
    }

    /// Command ids that received a cancel call
    pub fn cancelled(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .invocations
            .iter()
            .filter(|(_, inv)| inv.cancelled)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn submit(&self, host: &str, payload: &str) -> Result<CommandId, ControlPlaneError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.submit_failures > 0 {
            inner.submit_failures -= 1;
            return Err(ControlPlaneError::Transient("submit glitch".into()));
        }
        if payload.len() > self.max_payload {
            return Err(ControlPlaneError::Api(format!(
                "payload of {} bytes exceeds limit {}",
                payload.len(),
                self.max_payload
            )));
        }

        let behavior = inner
            .rules
            .iter()
            .rev()
            .find(|(needle, _)| payload.contains(needle.as_str()))
            .map(|(_, b)| b.clone())
            .unwrap_or_else(|| FakeBehavior::success(""));

        inner.next_id += 1;
        let id = format!("cmd-{:04}", inner.next_id);
        inner.submitted.push((host.to_string(), payload.to_string()));
        inner.invocations.insert(
            id.clone(),
            Invocation {
                polls_left: behavior.polls,
                behavior,
                cancelled: false,
            },
        );
        Ok(CommandId(id))
    }

    async fn poll(&self, _host: &str, id: &CommandId) -> Result<CommandPoll, ControlPlaneError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.poll_failures > 0 {
            inner.poll_failures -= 1;
            return Err(ControlPlaneError::Transient("poll glitch".into()));
        }
        let inv = inner
            .invocations
            .get_mut(&id.0)
            .ok_or_else(|| ControlPlaneError::Api(format!("unknown command {id}")))?;

        if inv.cancelled {
            return Ok(CommandPoll {
                status: CommandStatus::Cancelled,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
            });
        }
        if inv.polls_left > 0 {
            inv.polls_left -= 1;
            return Ok(CommandPoll {
                status: CommandStatus::InProgress,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
            });
        }
        match inv.behavior.terminal {
            None => Ok(CommandPoll {
                status: CommandStatus::InProgress,
                stdout: String::new(),
                stderr: String::new(),
                exit_code: None,
            }),
            Some(terminal) => Ok(CommandPoll {
                status: match terminal {
                    TerminalStatus::Success => CommandStatus::Success,
                    TerminalStatus::Failed => CommandStatus::Failed,
                    TerminalStatus::Cancelled => CommandStatus::Cancelled,
                    TerminalStatus::TimedOut => CommandStatus::TimedOut,
                },
                stdout: inv.behavior.stdout.clone(),
                stderr: inv.behavior.stderr.clone(),
                exit_code: Some(inv.behavior.exit_code),
            }),
        }
    }

    async fn cancel(&self, _host: &str, id: &CommandId) -> Result<(), ControlPlaneError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(inv) = inner.invocations.get_mut(&id.0) {
            inv.cancelled = true;
        }
        Ok(())
    }

    async fn agent_online(&self, host: &str) -> Result<bool, ControlPlaneError> {
        Ok(!self.inner.lock().unwrap().offline.contains(host))
    }

    fn max_payload_bytes(&self) -> usize {
        self.max_payload
    }
}

// ============================================================================
// Fake cloud
// ============================================================================

/// A resource with only an id and tags
#[derive(Debug, Clone)]
pub struct Tagged {
    pub id: String,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FakeInstance {
    pub id: String,
    pub tags: BTreeMap<String, String>,
    pub state: InstanceState,
    pub private_ip: Option<String>,
    /// Describe calls remaining until a pending instance reports running
    pub running_after: usize,
    /// Describe calls remaining until a shutting-down instance terminates
    pub terminated_after: usize,
}

#[derive(Debug, Clone)]
pub struct FakeGateway {
    pub id: String,
    pub tags: BTreeMap<String, String>,
    pub attached: Vec<String>,
}

#[derive(Default)]
pub struct CloudState {
    pub instances: Vec<FakeInstance>,
    pub volumes: Vec<Tagged>,
    pub security_groups: Vec<Tagged>,
    pub subnets: Vec<Tagged>,
    pub route_tables: Vec<Tagged>,
    pub gateways: Vec<FakeGateway>,
    pub vpcs: Vec<Tagged>,
    /// Next N list calls fail with an API error
    pub discovery_failures: usize,
    /// Next N calls (any kind) fail with a throttle error
    pub throttles: usize,
}

fn has_tag(tags: &BTreeMap<String, String>, key: &str, value: &str) -> bool {
    tags.get(key).map(String::as_str) == Some(value)
}

/// In-memory [`CloudCompute`]
#[derive(Default)]
pub struct FakeCloud {
    pub state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        FakeCloud::default()
    }

    fn experiment_tags(id: &ExperimentId, role: Option<Role>) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert("Project".to_string(), "broker-bench".to_string());
        tags.insert(TAG_EXPERIMENT_ID.to_string(), id.to_string());
        tags.insert("ManagedBy".to_string(), "broker-bench".to_string());
        if let Some(role) = role {
            tags.insert("Component".to_string(), role.to_string());
        }
        tags
    }

    /// Populate a full experiment's resource set: instances per role plus
    /// one volume per storage host, a security group, subnet, route table,
    /// attached gateway, and VPC.
    pub fn seed_experiment(
        &self,
        id: &ExperimentId,
        counts: &[(Role, usize)],
    ) -> ProvisionOutputs {
        let mut state = self.state.lock().unwrap();
        let mut roles = BTreeMap::new();
        let mut host_index = 0;

        for (role, count) in counts {
            let mut ids = Vec::new();
            let mut ips = Vec::new();
            for _ in 0..*count {
                host_index += 1;
                let instance_id = format!("i-{role}{host_index:02}");
                let ip = format!("10.0.1.{host_index}");
                state.instances.push(FakeInstance {
                    id: instance_id.clone(),
                    tags: Self::experiment_tags(id, Some(*role)),
                    state: InstanceState::Running,
                    private_ip: Some(ip.clone()),
                    running_after: 0,
                    terminated_after: 1,
                });
                if *role == Role::Storage {
                    state.volumes.push(Tagged {
                        id: format!("vol-{host_index:02}"),
                        tags: Self::experiment_tags(id, Some(*role)),
                    });
                }
                ids.push(instance_id);
                ips.push(ip);
            }
            roles.insert(*role, RoleOutputs {
                ids,
                private_ips: ips,
            });
        }

        let vpc_id = format!("vpc-{id}");
        state.security_groups.push(Tagged {
            id: format!("sg-{id}"),
            tags: Self::experiment_tags(id, None),
        });
        state.subnets.push(Tagged {
            id: format!("subnet-{id}"),
            tags: Self::experiment_tags(id, None),
        });
        state.route_tables.push(Tagged {
            id: format!("rtb-{id}"),
            tags: Self::experiment_tags(id, None),
        });
        state.gateways.push(FakeGateway {
            id: format!("igw-{id}"),
            tags: Self::experiment_tags(id, None),
            attached: vec![vpc_id.clone()],
        });
        state.vpcs.push(Tagged {
            id: vpc_id,
            tags: Self::experiment_tags(id, None),
        });

        ProvisionOutputs { roles }
    }

    /// Count every resource still tagged with the experiment id
    pub fn remaining_tagged(&self, id: &ExperimentId) -> usize {
        let state = self.state.lock().unwrap();
        let value = id.to_string();
        let tagged = |tags: &BTreeMap<String, String>| has_tag(tags, TAG_EXPERIMENT_ID, &value);
        state
            .instances
            .iter()
            .filter(|i| i.state != InstanceState::Terminated && tagged(&i.tags))
            .count()
            + state.volumes.iter().filter(|r| tagged(&r.tags)).count()
            + state
                .security_groups
                .iter()
                .filter(|r| tagged(&r.tags))
                .count()
            + state.subnets.iter().filter(|r| tagged(&r.tags)).count()
            + state.route_tables.iter().filter(|r| tagged(&r.tags)).count()
            + state.gateways.iter().filter(|g| tagged(&g.tags)).count()
            + state.vpcs.iter().filter(|r| tagged(&r.tags)).count()
    }

    fn gate(state: &mut CloudState, is_discovery: bool) -> Result<(), CloudError> {
        if state.throttles > 0 {
            state.throttles -= 1;
            return Err(CloudError::Throttled("rate exceeded".into()));
        }
        if is_discovery && state.discovery_failures > 0 {
            state.discovery_failures -= 1;
            return Err(CloudError::Api("describe failed".into()));
        }
        Ok(())
    }

    fn delete_from(list: &mut Vec<Tagged>, id: &str) -> Result<(), CloudError> {
        let before = list.len();
        list.retain(|r| r.id != id);
        if list.len() == before {
            Err(CloudError::NotFound(id.to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CloudCompute for FakeCloud {
    async fn instances_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<InstanceView>, CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, true)?;
        let mut views = Vec::new();
        for inst in state.instances.iter_mut() {
            if !has_tag(&inst.tags, key, value) {
                continue;
            }
            // Advance scripted state transitions one step per observation
            match inst.state {
                InstanceState::Pending => {
                    if inst.running_after == 0 {
                        inst.state = InstanceState::Running;
                    } else {
                        inst.running_after -= 1;
                    }
                }
                InstanceState::ShuttingDown => {
                    if inst.terminated_after == 0 {
                        inst.state = InstanceState::Terminated;
                    } else {
                        inst.terminated_after -= 1;
                    }
                }
                _ => {}
            }
            views.push(InstanceView {
                id: inst.id.clone(),
                state: inst.state,
                private_ip: inst.private_ip.clone(),
            });
        }
        Ok(views)
    }

    async fn terminate_instances(&self, ids: &[String]) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, false)?;
        for inst in state.instances.iter_mut() {
            if ids.contains(&inst.id) && inst.state != InstanceState::Terminated {
                inst.state = InstanceState::ShuttingDown;
            }
        }
        Ok(())
    }

    async fn volumes_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>, CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, true)?;
        Ok(state
            .volumes
            .iter()
            .filter(|r| has_tag(&r.tags, key, value))
            .map(|r| r.id.clone())
            .collect())
    }

    async fn delete_volume(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, false)?;
        FakeCloud::delete_from(&mut state.volumes, id)
    }

    async fn security_groups_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, true)?;
        Ok(state
            .security_groups
            .iter()
            .filter(|r| has_tag(&r.tags, key, value))
            .map(|r| r.id.clone())
            .collect())
    }

    async fn delete_security_group(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, false)?;
        FakeCloud::delete_from(&mut state.security_groups, id)
    }

    async fn subnets_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>, CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, true)?;
        Ok(state
            .subnets
            .iter()
            .filter(|r| has_tag(&r.tags, key, value))
            .map(|r| r.id.clone())
            .collect())
    }

    async fn delete_subnet(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, false)?;
        FakeCloud::delete_from(&mut state.subnets, id)
    }

    async fn route_tables_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<String>, CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, true)?;
        Ok(state
            .route_tables
            .iter()
            .filter(|r| has_tag(&r.tags, key, value))
            .map(|r| r.id.clone())
            .collect())
    }

    async fn delete_route_table(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, false)?;
        FakeCloud::delete_from(&mut state.route_tables, id)
    }

    async fn internet_gateways_by_tag(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<GatewayView>, CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, true)?;
        Ok(state
            .gateways
            .iter()
            .filter(|g| has_tag(&g.tags, key, value))
            .map(|g| GatewayView {
                id: g.id.clone(),
                attached_vpcs: g.attached.clone(),
            })
            .collect())
    }

    async fn detach_internet_gateway(&self, id: &str, vpc: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, false)?;
        match state.gateways.iter_mut().find(|g| g.id == id) {
            Some(gw) => {
                gw.attached.retain(|v| v != vpc);
                Ok(())
            }
            None => Err(CloudError::NotFound(id.to_string())),
        }
    }

    async fn delete_internet_gateway(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, false)?;
        let Some(pos) = state.gateways.iter().position(|g| g.id == id) else {
            return Err(CloudError::NotFound(id.to_string()));
        };
        if !state.gateways[pos].attached.is_empty() {
            return Err(CloudError::Api(format!("{id} still attached")));
        }
        state.gateways.remove(pos);
        Ok(())
    }

    async fn vpcs_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>, CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, true)?;
        Ok(state
            .vpcs
            .iter()
            .filter(|r| has_tag(&r.tags, key, value))
            .map(|r| r.id.clone())
            .collect())
    }

    async fn delete_vpc(&self, id: &str) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        FakeCloud::gate(&mut state, false)?;
        FakeCloud::delete_from(&mut state.vpcs, id)
    }
}

// ============================================================================
// Fake provisioner
// ============================================================================

/// In-memory [`Provision`] that registers resources in a [`FakeCloud`]
pub struct FakeProvisioner {
    cloud: Arc<FakeCloud>,
    counts: Vec<(Role, usize)>,
    fail_apply: bool,
    fail_destroy: bool,
    pub destroy_calls: AtomicUsize,
}

impl FakeProvisioner {
    pub fn new(cloud: Arc<FakeCloud>, counts: Vec<(Role, usize)>) -> Self {
        FakeProvisioner {
            cloud,
            counts,
            fail_apply: false,
            fail_destroy: false,
            destroy_calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_apply(mut self) -> Self {
        self.fail_apply = true;
        self
    }

    pub fn failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }
}

#[async_trait]
impl Provision for FakeProvisioner {
    async fn apply(
        &self,
        vars: &InfraVars,
        _experiment: &ExperimentDir,
    ) -> Result<ProvisionOutputs, ProvisionError> {
        if self.fail_apply {
            return Err(ProvisionError::Exited { code: Some(1) });
        }
        let id = ExperimentId::parse(&vars.experiment_id)
            .map_err(|e| ProvisionError::Other(e.to_string()))?;
        Ok(self.cloud.seed_experiment(&id, &self.counts))
    }

    async fn destroy(
        &self,
        _vars: &InfraVars,
        _experiment: &ExperimentDir,
    ) -> Result<(), ProvisionError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy {
            return Err(ProvisionError::Exited { code: Some(1) });
        }
        // Provisioner-led destroy is not modelled; tag reclaim always runs
        // afterwards and is the final authority, so leaving resources in
        // place here exercises exactly that path.
        Ok(())
    }
}
