//! # statebean CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve the demo beans (cart clustered, counter local) on two nodes
//! statebean serve -b 127.0.0.1:7800 --nodes 2
//!
//! # Serve a deployment file
//! statebean serve -c deployment.json
//!
//! # Create a cart, then call it with the printed session id
//! statebean call 127.0.0.1:7800 cart create -p json -a '"ana"'
//! statebean call 127.0.0.1:7800 cart addItem -p String -a '"apple"' -s <session>
//!
//! # Built-in endpoints
//! statebean stats 127.0.0.1:7800
//! statebean info 127.0.0.1:7800
//! ```

use anyhow::{Context, Result};
use argh::FromArgs;
use serde_json::Value;
use statebean_client::BeanClient;
use statebean_cli::{demo, LocalCluster};
use statebean_common::{AdminRequest, MethodSignature, Request, SessionId};
use statebean_container::DeploymentConfig;
use statebean_metrics::{INFO_ENDPOINT, METRICS_ENDPOINT};
use std::path::PathBuf;

#[derive(FromArgs)]
/// statebean - replicated stateful session containers
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Stats(StatsArgs),
    Info(InfoArgs),
}

// Without `--config` the demo deployment is used: a clustered `cart`
// container and a plain `counter` container.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// deploy containers and serve them over TCP
struct ServeArgs {
    /// path to a JSON deployment file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// address to bind to, overriding the deployment file
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// node name, overriding the deployment file
    #[argh(option, short = 'n')]
    node: Option<String>,

    /// number of nodes to start in this process (default 1)
    #[argh(option, default = "1")]
    nodes: usize,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// invoke one method and print the JSON result
struct CallArgs {
    /// server address (e.g. 127.0.0.1:7800)
    #[argh(positional)]
    server_address: String,

    /// container name
    #[argh(positional)]
    container: String,

    /// method name
    #[argh(positional)]
    method: String,

    /// parameter type names of the method, in order
    #[argh(option, short = 'p', long = "param")]
    params: Vec<String>,

    /// JSON arguments (default null)
    #[argh(option, short = 'a', long = "args", default = "\"null\".into()")]
    args: String,

    /// session id to call
    #[argh(option, short = 's', long = "session")]
    session: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "stats")]
/// print metrics of a server or one of its containers
struct StatsArgs {
    /// server address
    #[argh(positional)]
    server_address: String,

    /// restrict to one container
    #[argh(option, short = 'c')]
    container: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "info")]
/// print node information of a server
struct InfoArgs {
    /// server address
    #[argh(positional)]
    server_address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Client commands print raw JSON for piping; keep logs out of stdout
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Stats(args) => {
            let mut request = AdminRequest::new(METRICS_ENDPOINT);
            if let Some(container) = args.container {
                request = request.for_container(container);
            }
            print_admin(&args.server_address, request).await
        }
        Commands::Info(args) => print_admin(&args.server_address, AdminRequest::new(INFO_ENDPOINT)).await,
    }
}

fn deployment(args: &ServeArgs) -> Result<DeploymentConfig> {
    let mut config = match &args.config {
        Some(path) => DeploymentConfig::load(path)
            .with_context(|| format!("loading deployment {}", path.display()))?,
        None => demo::default_deployment(),
    };
    if let Some(bind) = &args.bind {
        config.bind = bind.clone();
    }
    if let Some(node) = &args.node {
        config.node = node.clone();
    }
    Ok(config)
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = deployment(&args)?;
    tracing::info!(
        "Deploying {} container(s) on {} node(s)",
        config.containers.len(),
        args.nodes
    );

    let cluster = LocalCluster::start(&config, args.nodes).await?;
    for node in cluster.nodes() {
        tracing::info!("Node '{}' listening on {}", node.name(), node.locator());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    cluster.shutdown().await;
    Ok(())
}

async fn run_call(args: CallArgs) -> Result<()> {
    let call_args: Value = serde_json::from_str(&args.args)
        .map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;
    let params: Vec<&str> = args.params.iter().map(String::as_str).collect();
    let method = MethodSignature::new(args.method, &params);

    let mut request = Request::new(args.container, method.hash(), call_args);
    if let Some(session) = &args.session {
        request = request.with_session(session.parse::<SessionId>()?);
    }

    let response = BeanClient::new().invoke(&args.server_address, request).await?;
    if let Some(session) = response.new_session_id {
        eprintln!("session {}", session);
    }
    let result = response.into_result()?;

    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}

async fn print_admin(server_address: &str, request: AdminRequest) -> Result<()> {
    let result = BeanClient::new().admin(server_address, request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve_defaults() {
        let args: Cli = Cli::from_args(&["statebean"], &["serve"]).unwrap();
        match args.command {
            Commands::Serve(ServeArgs { config, bind, node, nodes }) => {
                assert!(config.is_none());
                assert!(bind.is_none());
                assert!(node.is_none());
                assert_eq!(nodes, 1);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_flags_override_deployment() {
        let args: Cli = Cli::from_args(
            &["statebean"],
            &["serve", "-b", "127.0.0.1:9000", "-n", "edge", "--nodes", "3"],
        )
        .unwrap();
        match args.command {
            Commands::Serve(args) => {
                assert_eq!(args.nodes, 3);
                let config = deployment(&args).unwrap();
                assert_eq!(config.bind, "127.0.0.1:9000");
                assert_eq!(config.node, "edge");
                assert_eq!(config.containers.len(), 2);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_reads_config_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"{"node": "n7", "bind": "127.0.0.1:7807", "containers": [{"name": "counter"}]}"#,
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let args: Cli = Cli::from_args(&["statebean"], &["serve", "-c", path]).unwrap();
        match args.command {
            Commands::Serve(args) => {
                let config = deployment(&args).unwrap();
                assert_eq!(config.node, "n7");
                assert_eq!(config.containers[0].name, "counter");
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_serve_missing_config_file() {
        let args: Cli =
            Cli::from_args(&["statebean"], &["serve", "-c", "/nonexistent/deployment.json"]).unwrap();
        match args.command {
            Commands::Serve(args) => assert!(deployment(&args).is_err()),
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli = Cli::from_args(
            &["statebean"],
            &[
                "call",
                "127.0.0.1:7800",
                "cart",
                "addItem",
                "-p",
                "String",
                "-a",
                "\"apple\"",
            ],
        )
        .unwrap();
        match args.command {
            Commands::Call(CallArgs { server_address, container, method, params, args, session }) => {
                assert_eq!(server_address, "127.0.0.1:7800");
                assert_eq!(container, "cart");
                assert_eq!(method, "addItem");
                assert_eq!(params, vec!["String".to_string()]);
                assert_eq!(args, "\"apple\"");
                assert!(session.is_none());
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_default_args() {
        let args: Cli =
            Cli::from_args(&["statebean"], &["call", "127.0.0.1:7800", "counter", "get"]).unwrap();
        match args.command {
            Commands::Call(CallArgs { args, params, .. }) => {
                assert_eq!(args, "null");
                assert!(params.is_empty());
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_stats_for_container() {
        let args: Cli =
            Cli::from_args(&["statebean"], &["stats", "127.0.0.1:7800", "-c", "cart"]).unwrap();
        match args.command {
            Commands::Stats(StatsArgs { server_address, container }) => {
                assert_eq!(server_address, "127.0.0.1:7800");
                assert_eq!(container, Some("cart".to_string()));
            }
            _ => panic!("Expected Stats command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_command() {
        assert!(Cli::from_args(&["statebean"], &["top", "127.0.0.1:7800"]).is_err());
    }
}
