//! Orchestration CLI: launches and tears down compute nodes.
//!
//! Exit code 0 on success; nonzero with a stderr line beginning `❌` on a
//! failed launch or removal. `✅` prefixes success lines. Both prefixes
//! are compatibility points for scripts driving this binary.

use std::process::ExitCode;

use clap::Parser;
use fedra_core::Node;
use fedra_core::config::DeploymentType;
use fedra_core::config::NODE_PORT_ENV_VAR;
use fedra_core::config::NODE_TYPE_ENV_VAR;
use fedra_core::config::NODE_URL_ENV_VAR;
use fedra_core::config::NodeConfig;
use fedra_core::config::NodeType;
use tracing_subscriber::EnvFilter;

/// Federated compute node launcher.
#[derive(Debug, Parser)]
#[clap(author, version)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Launch a node and run it until interrupted.
    Launch(LaunchArgs),

    /// Tear down a previously launched node.
    Land(LandArgs),

    /// Print the configuration a launch would use.
    Status(LaunchArgs),
}

#[derive(Debug, Parser)]
struct LaunchArgs {
    /// Node name.
    #[arg(default_value = "fedra")]
    name: String,

    /// Node kind; falls back to NODE_TYPE, then "domain".
    #[arg(long)]
    node_type: Option<NodeType>,

    /// Deployment kind; falls back to DEPLOYMENT_TYPE, then "in_process".
    #[arg(long)]
    deployment: Option<DeploymentType>,

    /// Port to expose; falls back to NODE_PORT, then 8080.
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Parser)]
struct LandArgs {
    /// Node name.
    #[arg(default_value = "fedra")]
    name: String,

    /// Deployment kind the node was launched with.
    #[arg(long)]
    deployment: Option<DeploymentType>,
}

impl LaunchArgs {
    fn resolve(&self) -> NodeConfig {
        let mut config = NodeConfig::from_env(&self.name);
        if let Some(node_type) = self.node_type {
            config.node_type = node_type;
        }
        if let Some(deployment) = self.deployment {
            config.deployment = deployment;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Launch(args) => launch(&args).await,
        Command::Land(args) => land(&args),
        Command::Status(args) => status(&args),
    }
}

async fn launch(args: &LaunchArgs) -> ExitCode {
    let config = args.resolve();
    match config.deployment {
        DeploymentType::InProcess => launch_in_process(&args.name, config).await,
        DeploymentType::ContainerSingle | DeploymentType::ContainerStack | DeploymentType::Podman => {
            launch_container(&args.name, &config)
        }
        DeploymentType::Kubernetes => {
            eprintln!("❌ failed to launch node '{}': kubernetes deployments are driven by the cluster charts, not this binary", args.name);
            ExitCode::FAILURE
        }
    }
}

async fn launch_in_process(name: &str, config: NodeConfig) -> ExitCode {
    let url = config.url.clone();
    let port = config.port;
    let node = Node::new(config);
    if let Err(e) = node.start() {
        eprintln!("❌ failed to launch node '{name}': {e}");
        return ExitCode::FAILURE;
    }
    println!("✅ launched node '{name}' ({}) at {url}:{port}", node.id);

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("❌ failed while serving node '{name}': {e}");
        node.shutdown();
        return ExitCode::FAILURE;
    }
    node.shutdown();
    println!("✅ landed node '{name}'");
    ExitCode::SUCCESS
}

fn launch_container(name: &str, config: &NodeConfig) -> ExitCode {
    let engine = container_engine(config.deployment);
    let container = container_name(name);
    let port_map = format!("{}:{}", config.port, config.port);
    let status = std::process::Command::new(engine)
        .args(["run", "--detach", "--name", &container, "--publish", &port_map])
        .args(["--env", &format!("{NODE_TYPE_ENV_VAR}={}", config.node_type)])
        .args(["--env", &format!("{NODE_PORT_ENV_VAR}={}", config.port)])
        .args(["--env", &format!("{NODE_URL_ENV_VAR}={}", config.url)])
        .arg("fedra-node:latest")
        .status();
    match status {
        Ok(status) if status.success() => {
            println!("✅ launched node '{name}' in container '{container}'");
            ExitCode::SUCCESS
        }
        Ok(status) => {
            eprintln!("❌ failed to launch node '{name}': {engine} exited with {status}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ failed to launch node '{name}': could not run {engine}: {e}");
            ExitCode::FAILURE
        }
    }
}

fn land(args: &LandArgs) -> ExitCode {
    let deployment = args
        .deployment
        .unwrap_or_else(|| NodeConfig::from_env(&args.name).deployment);
    match deployment {
        DeploymentType::InProcess => {
            eprintln!(
                "❌ failed to remove node '{}': in-process nodes stop with their launch command",
                args.name
            );
            ExitCode::FAILURE
        }
        DeploymentType::Kubernetes => {
            eprintln!(
                "❌ failed to remove node '{}': kubernetes deployments are driven by the cluster charts, not this binary",
                args.name
            );
            ExitCode::FAILURE
        }
        other => {
            let engine = container_engine(other);
            let container = container_name(&args.name);
            let status = std::process::Command::new(engine)
                .args(["rm", "--force", &container])
                .status();
            match status {
                Ok(status) if status.success() => {
                    println!("✅ removed node '{}'", args.name);
                    ExitCode::SUCCESS
                }
                Ok(status) => {
                    eprintln!(
                        "❌ failed to remove node '{}': {engine} exited with {status}",
                        args.name
                    );
                    ExitCode::FAILURE
                }
                Err(e) => {
                    eprintln!(
                        "❌ failed to remove node '{}': could not run {engine}: {e}",
                        args.name
                    );
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn status(args: &LaunchArgs) -> ExitCode {
    let config = args.resolve();
    println!(
        "✅ node '{}': type={} deployment={} url={}:{} queue=[pub {}, sub {}]",
        config.name,
        config.node_type,
        config.deployment,
        config.url,
        config.port,
        config.queue.pub_addr,
        config.queue.sub_addr,
    );
    ExitCode::SUCCESS
}

fn container_engine(deployment: DeploymentType) -> &'static str {
    match deployment {
        DeploymentType::Podman => "podman",
        _ => "docker",
    }
}

fn container_name(name: &str) -> String {
    format!("fedra-{name}")
}
