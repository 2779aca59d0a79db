//! Node configuration and environment defaults.

use serde::Deserialize;
use serde::Serialize;

pub const NODE_TYPE_ENV_VAR: &str = "NODE_TYPE";
pub const DEPLOYMENT_TYPE_ENV_VAR: &str = "DEPLOYMENT_TYPE";
pub const NODE_PORT_ENV_VAR: &str = "NODE_PORT";
pub const NODE_URL_ENV_VAR: &str = "NODE_URL";

pub const DEFAULT_NODE_PORT: u16 = 8080;
pub const DEFAULT_NODE_URL: &str = "http://localhost";

/// Default bind addresses of the pub/sub broker.
pub const DEFAULT_QUEUE_PUB_ADDR: &str = "tcp://127.0.0.1:6000";
pub const DEFAULT_QUEUE_SUB_ADDR: &str = "tcp://127.0.0.1:6001";

const DEFAULT_POOL_NAME: &str = "default-pool";
const DEFAULT_POOL_WORKERS: usize = 2;

/// Approval mode of a node: a domain approves locally, an enclave requires
/// every input owner to approve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Domain,
    Enclave,
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "domain" => Ok(NodeType::Domain),
            "enclave" => Ok(NodeType::Enclave),
            other => Err(format!("unknown node type '{other}'")),
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeType::Domain => write!(f, "domain"),
            NodeType::Enclave => write!(f, "enclave"),
        }
    }
}

/// How a node is deployed by the orchestration CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentType {
    InProcess,
    ContainerSingle,
    ContainerStack,
    Podman,
    Kubernetes,
}

impl std::str::FromStr for DeploymentType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "in_process" => Ok(DeploymentType::InProcess),
            "container_single" => Ok(DeploymentType::ContainerSingle),
            "container_stack" => Ok(DeploymentType::ContainerStack),
            "podman" => Ok(DeploymentType::Podman),
            "kubernetes" | "k8s" => Ok(DeploymentType::Kubernetes),
            other => Err(format!("unknown deployment type '{other}'")),
        }
    }
}

impl std::fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentType::InProcess => "in_process",
            DeploymentType::ContainerSingle => "container_single",
            DeploymentType::ContainerStack => "container_stack",
            DeploymentType::Podman => "podman",
            DeploymentType::Kubernetes => "kubernetes",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub pub_addr: String,
    pub sub_addr: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pub_addr: DEFAULT_QUEUE_PUB_ADDR.to_string(),
            sub_addr: DEFAULT_QUEUE_SUB_ADDR.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub node_type: NodeType,
    pub deployment: DeploymentType,
    pub port: u16,
    pub url: String,
    pub queue: QueueConfig,
    pub default_pool_name: String,
    pub default_pool_workers: usize,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_type: NodeType::Domain,
            deployment: DeploymentType::InProcess,
            port: DEFAULT_NODE_PORT,
            url: DEFAULT_NODE_URL.to_string(),
            queue: QueueConfig::default(),
            default_pool_name: DEFAULT_POOL_NAME.to_string(),
            default_pool_workers: DEFAULT_POOL_WORKERS,
        }
    }

    /// Applies `NODE_TYPE`, `DEPLOYMENT_TYPE`, `NODE_PORT` and `NODE_URL`
    /// on top of the defaults. Unset or malformed variables keep defaults.
    pub fn from_env(name: impl Into<String>) -> Self {
        let mut config = Self::new(name);
        if let Ok(raw) = std::env::var(NODE_TYPE_ENV_VAR)
            && let Ok(node_type) = raw.parse()
        {
            config.node_type = node_type;
        }
        if let Ok(raw) = std::env::var(DEPLOYMENT_TYPE_ENV_VAR)
            && let Ok(deployment) = raw.parse()
        {
            config.deployment = deployment;
        }
        if let Ok(raw) = std::env::var(NODE_PORT_ENV_VAR)
            && let Ok(port) = raw.parse()
        {
            config.port = port;
        }
        if let Ok(url) = std::env::var(NODE_URL_ENV_VAR) {
            config.url = url;
        }
        config
    }

    pub fn enclave(mut self) -> Self {
        self.node_type = NodeType::Enclave;
        self
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = NodeConfig::new("alpha");
        assert_eq!(config.port, 8080);
        assert_eq!(config.queue.pub_addr, "tcp://127.0.0.1:6000");
        assert_eq!(config.queue.sub_addr, "tcp://127.0.0.1:6001");
        assert_eq!(config.node_type, NodeType::Domain);
    }

    #[test]
    fn parses_node_kinds() {
        assert_eq!("enclave".parse::<NodeType>(), Ok(NodeType::Enclave));
        assert_eq!("container-stack".parse::<DeploymentType>(), Ok(DeploymentType::ContainerStack));
        assert_eq!("k8s".parse::<DeploymentType>(), Ok(DeploymentType::Kubernetes));
        assert!("warehouse".parse::<NodeType>().is_err());
    }
}
