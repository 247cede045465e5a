//! suitesync CLI entry point

use anyhow::{Context, Result};
use std::process::Child;
use std::sync::Arc;
use suitesync::config::cli::{Cli, ExecutionMode};
use suitesync::config::{toml as config_toml, validator, RunConfig};
use suitesync::distributed::Hub;
use suitesync::launch;
use suitesync::node::NodeId;
use suitesync::output::{json, text, OutputAggregator};
use suitesync::report::RunSummary;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli.validate()?;

    let config = config_toml::build_config(&cli)?;
    validator::validate_config(&config).context("Configuration validation failed")?;

    init_logging(config.debug);

    let succeeded = match cli.mode {
        ExecutionMode::Run => {
            print_banner(&config);
            let summary = if cli.in_process {
                run_in_process(&config)?
            } else {
                run_processes(&config)?
            };
            finish_run(&config, &summary)?
        }
        ExecutionMode::Hub => {
            print_banner(&config);
            let summary = run_hub(&config)?;
            finish_run(&config, &summary)?
        }
        ExecutionMode::Node => run_node(&cli, &config)?,
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

/// Diagnostics go to stderr so stdout only carries the merged output
fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("suitesync={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn print_banner(config: &RunConfig) {
    println!("suitesync v{}", env!("CARGO_PKG_VERSION"));
    println!("Parallel suite coordinator");
    println!();
    text::print_configuration(config);
    println!();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create tokio runtime")
}

/// Print the summary, write JSON if requested, and report the verdict
fn finish_run(config: &RunConfig, summary: &RunSummary) -> Result<bool> {
    println!();
    text::print_summary(summary);

    if let Some(ref path) = config.json_output {
        json::write_json_output(path, summary)?;
        println!();
        println!("JSON output written to: {}", path.display());
    }

    Ok(summary.succeeded())
}

/// Every node as a task in this process
fn run_in_process(config: &RunConfig) -> Result<RunSummary> {
    let suite = Arc::new(config.fixture.suite()?);
    let specs = config.fixture.specs();
    let aggregator = Arc::new(OutputAggregator::stdout(config.output));

    runtime()?.block_on(launch::run_in_process(config, suite, &specs, aggregator))
}

/// One child process per node, relayed through a hub on localhost
fn run_processes(config: &RunConfig) -> Result<RunSummary> {
    let runtime = runtime()?;
    let aggregator = Arc::new(OutputAggregator::stdout(config.output));

    let hub = runtime.block_on(Hub::bind(
        &format!("127.0.0.1:{}", config.hub_port),
        config.nodes,
        aggregator.clone(),
    ))?;
    let hub_addr = hub.local_addr()?.to_string();
    tracing::debug!(addr = %hub_addr, "hub listening");

    let mut children = Vec::new();
    let mut launch_error = None;
    for node in NodeId::all(config.nodes) {
        match launch_node_process(node, &hub_addr, config) {
            Ok(child) => children.push(child),
            Err(e) => {
                launch_error = Some(e);
                break;
            }
        }
    }

    let summary = match launch_error {
        None => runtime.block_on(hub.serve(config.run_timeout())),
        Some(e) => Err(e),
    };

    for child in children {
        if let Err(e) = cleanup_node_process(child) {
            tracing::warn!(error = %e, "failed to clean up node process");
        }
    }

    let summary = summary?;
    aggregator.flush().context("Failed to flush node output")?;
    Ok(summary)
}

/// Relay for nodes started by someone else
fn run_hub(config: &RunConfig) -> Result<RunSummary> {
    let runtime = runtime()?;
    let aggregator = Arc::new(OutputAggregator::stdout(config.output));

    let summary = runtime.block_on(async {
        let hub = Hub::bind(&format!("0.0.0.0:{}", config.hub_port), config.nodes, aggregator.clone()).await?;
        println!("Hub listening on {}", hub.local_addr()?);
        println!("Waiting for {} nodes...", config.nodes);
        println!();
        hub.serve(config.run_timeout()).await
    })?;

    aggregator.flush().context("Failed to flush node output")?;
    Ok(summary)
}

/// Body of a node process
fn run_node(cli: &Cli, config: &RunConfig) -> Result<bool> {
    let node_id = cli.node_id.context("--node-id is required in node mode")?;
    let node = validator::validate_node_id(node_id, config)?;
    let hub = cli.hub.as_deref().context("--hub is required in node mode")?;

    let suite = Arc::new(config.fixture.suite()?);
    let specs = config.fixture.specs();

    let report = runtime()?.block_on(launch::run_tcp_node(hub, node, config, suite, &specs))?;
    Ok(report.succeeded())
}

/// Launch one node process in the background
fn launch_node_process(node: NodeId, hub_addr: &str, config: &RunConfig) -> Result<Child> {
    use std::process::{Command, Stdio};

    let exe_path = std::env::current_exe().context("Failed to get current executable path")?;

    let mut cmd = Command::new(&exe_path);
    cmd.arg("--mode").arg("node");
    cmd.arg("--node-id").arg(node.to_string());
    cmd.arg("--hub").arg(hub_addr);
    cmd.arg("--nodes").arg(config.nodes.to_string());
    cmd.arg("--fixture").arg(config.fixture.to_string());
    cmd.arg("--broadcast-timeout").arg(format!("{}ms", config.broadcast_timeout_ms));
    cmd.arg("--barrier-timeout").arg(format!("{}ms", config.barrier_timeout_ms));
    cmd.arg("--teardown-policy").arg(config.teardown_policy.to_string());

    if config.debug {
        cmd.arg("--debug");
    }

    // Node output travels through the hub; keep the process's own stdout quiet
    cmd.stdout(Stdio::null());
    if config.debug {
        let log_path = std::env::temp_dir().join(format!("suitesync_node_{}.log", node));
        let log_file = std::fs::File::create(&log_path).context("Failed to create node log file")?;
        cmd.stderr(Stdio::from(log_file));
        tracing::debug!(node = node.get(), log = %log_path.display(), "node log");
    } else {
        cmd.stderr(Stdio::null());
    }

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn node {} process", node))?;

    tracing::debug!(node = node.get(), pid = child.id(), "node launched");

    Ok(child)
}

/// Wait briefly for a node process to exit, then kill it
fn cleanup_node_process(mut child: Child) -> Result<()> {
    use std::time::{Duration, Instant};

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(status) = child.try_wait()? {
            tracing::debug!(pid = child.id(), %status, "node exited");
            return Ok(());
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    tracing::warn!(pid = child.id(), "node still running, killing it");
    child.kill()?;
    child.wait()?;
    Ok(())
}
