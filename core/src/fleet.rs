//! Fleet model: hosts, roles, and the role → service table

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Role a host plays in the cluster
///
/// Set at provisioning, never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Cluster metadata / coordination service
    Coordinator,
    /// Persistent log storage nodes
    Storage,
    /// Message brokers
    Broker,
    /// Benchmark driver hosts
    Worker,
}

impl Role {
    /// All roles, in provisioning order
    pub const ALL: [Role; 4] = [Role::Coordinator, Role::Storage, Role::Broker, Role::Worker];

    /// The services and health endpoints this role must expose
    pub fn services(&self) -> &'static [ServiceDescriptor] {
        match self {
            Role::Coordinator => COORDINATOR_SERVICES,
            Role::Storage => STORAGE_SERVICES,
            Role::Broker => BROKER_SERVICES,
            Role::Worker => WORKER_SERVICES,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Coordinator => write!(f, "coordinator"),
            Role::Storage => write!(f, "storage"),
            Role::Broker => write!(f, "broker"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(Role::Coordinator),
            "storage" => Ok(Role::Storage),
            "broker" => Ok(Role::Broker),
            "worker" => Ok(Role::Worker),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// How a service's health endpoint is probed, always from the host itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthProbe {
    /// Open and close a TCP connection; success = connection accepted
    TcpPort(u16),
    /// Send a literal text challenge, match the expected response
    ChallengeResponse {
        /// Port to send the challenge to
        port: u16,
        /// Literal text to send
        send: &'static str,
        /// Exact expected response
        expect: &'static str,
    },
    /// HTTP GET expecting an exact 200
    HttpStatus {
        /// URL as reachable from the host itself
        url: &'static str,
    },
    /// A file must exist and be executable
    BinaryPresent {
        /// Absolute path on the host
        path: &'static str,
    },
}

impl HealthProbe {
    /// Render the probe as a shell payload; exit status 0 means healthy
    pub fn payload(&self) -> String {
        match self {
            HealthProbe::TcpPort(port) => format!("nc -z -w 5 127.0.0.1 {port}"),
            HealthProbe::ChallengeResponse { port, send, expect } => format!(
                "resp=$(printf '%s' '{send}' | nc -w 5 127.0.0.1 {port}); [ \"$resp\" = \"{expect}\" ]"
            ),
            HealthProbe::HttpStatus { url } => format!(
                "code=$(curl -s -o /dev/null -w '%{{http_code}}' --max-time 10 '{url}'); [ \"$code\" = \"200\" ]"
            ),
            HealthProbe::BinaryPresent { path } => format!("test -x '{path}'"),
        }
    }

    /// Short name for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            HealthProbe::TcpPort(_) => "tcp-port",
            HealthProbe::ChallengeResponse { .. } => "challenge-response",
            HealthProbe::HttpStatus { .. } => "http-status",
            HealthProbe::BinaryPresent { .. } => "binary-present",
        }
    }
}

/// One expected service on a role, with its health probe
#[derive(Debug, Clone, Copy)]
pub struct ServiceDescriptor {
    /// systemd unit name, when the role runs a supervised service
    pub unit: Option<&'static str>,
    /// Whether the unit must report active before the endpoint is probed
    pub required_active: bool,
    /// Endpoint health probe
    pub probe: HealthProbe,
}

impl ServiceDescriptor {
    /// Shell payload asserting the unit is active, if there is a unit
    pub fn active_payload(&self) -> Option<String> {
        self.unit
            .filter(|_| self.required_active)
            .map(|unit| format!("systemctl is-active --quiet {unit}"))
    }

    /// Name used in log lines
    pub fn component(&self) -> &'static str {
        self.unit.unwrap_or("benchmark-binary")
    }
}

const COORDINATOR_SERVICES: &[ServiceDescriptor] = &[
    ServiceDescriptor {
        unit: Some("zk.service"),
        required_active: true,
        probe: HealthProbe::TcpPort(2181),
    },
    ServiceDescriptor {
        unit: Some("zk.service"),
        required_active: true,
        probe: HealthProbe::ChallengeResponse {
            port: 2181,
            send: "ruok",
            expect: "imok",
        },
    },
];

const STORAGE_SERVICES: &[ServiceDescriptor] = &[ServiceDescriptor {
    unit: Some("bk.service"),
    required_active: true,
    probe: HealthProbe::TcpPort(3181),
}];

const BROKER_SERVICES: &[ServiceDescriptor] = &[ServiceDescriptor {
    unit: Some("broker.service"),
    required_active: true,
    probe: HealthProbe::HttpStatus {
        url: "http://localhost:8080/admin/v2/brokers/health",
    },
}];

const WORKER_SERVICES: &[ServiceDescriptor] = &[ServiceDescriptor {
    unit: None,
    required_active: false,
    probe: HealthProbe::BinaryPresent {
        path: "/opt/benchmark/bin/benchmark",
    },
}];

/// One provisioned host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Opaque cloud identifier
    pub id: String,
    /// Role the host was provisioned for
    pub role: Role,
    /// Private IP inside the experiment network
    pub private_ip: String,
}

/// The provisioned fleet, grouped by role
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fleet {
    hosts: BTreeMap<Role, Vec<Host>>,
}

impl Fleet {
    /// Build a fleet from a host list
    pub fn new(hosts: impl IntoIterator<Item = Host>) -> Self {
        let mut grouped: BTreeMap<Role, Vec<Host>> = BTreeMap::new();
        for host in hosts {
            grouped.entry(host.role).or_default().push(host);
        }
        Fleet { hosts: grouped }
    }

    /// All hosts, role by role
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values().flatten()
    }

    /// Hosts with the given role
    pub fn by_role(&self, role: Role) -> &[Host] {
        self.hosts.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total host count
    pub fn len(&self) -> usize {
        self.hosts.values().map(Vec::len).sum()
    }

    /// Whether the fleet is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hosts the metrics sampler scrapes (brokers and storage nodes)
    pub fn scrape_targets(&self) -> Vec<&Host> {
        self.by_role(Role::Broker)
            .iter()
            .chain(self.by_role(Role::Storage).iter())
            .collect()
    }
}
