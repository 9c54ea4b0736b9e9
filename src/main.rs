use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use clustervisor::{
    Cluster, ClusterConfig, ExitReason, LogWriter, RawOptions, RestartPolicy, RoutingPolicy,
    Subscribe, frameworks, run_if_child,
};

#[derive(Parser)]
#[command(name = "clustervisor", version, about = "Agent + app worker cluster supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a cluster and serve until SIGINT/SIGTERM.
    Start(StartArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Hosted framework to run in every child.
    #[arg(long, default_value = "echo")]
    framework: String,
    #[arg(long)]
    base_dir: Option<PathBuf>,
    /// Listen port; defaults to 7001 (8443 with --https).
    #[arg(long)]
    port: Option<String>,
    /// Number of app workers; defaults to the CPU count.
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    https: bool,
    #[arg(long)]
    key: Option<PathBuf>,
    #[arg(long)]
    cert: Option<PathBuf>,
    /// The master owns the port and hands connections to workers.
    #[arg(long)]
    sticky: bool,
    /// never | on-failure | always
    #[arg(long, default_value = "on-failure")]
    restart: RestartPolicy,
    #[arg(long, default_value_t = 10_000)]
    ready_timeout_ms: u64,
    #[arg(long, default_value_t = 30_000)]
    grace_ms: u64,
    /// Route sticky connections by peer address, hashed with this seed.
    /// Round robin when absent.
    #[arg(long)]
    hash_seed: Option<u64>,
}

fn main() -> ExitCode {
    let frameworks = frameworks::builtin();
    if let Some(code) = run_if_child(&frameworks) {
        return exit_code(code);
    }

    let Command::Start(args) = Cli::parse().command;
    init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "[master] cannot build the runtime");
            return exit_code(ExitReason::Failure.code());
        }
    };
    exit_code(runtime.block_on(start(args)).code())
}

async fn start(args: StartArgs) -> ExitReason {
    let raw = RawOptions {
        framework: Some(args.framework),
        base_dir: args.base_dir,
        port: args.port,
        workers: args.workers,
        https: args.https,
        key: args.key,
        cert: args.cert,
        sticky: args.sticky,
    };
    let options = match raw.normalize() {
        Ok(options) => options,
        Err(e) => {
            error!(error = %e, "[master] invalid options");
            return ExitReason::Failure;
        }
    };
    let cfg = ClusterConfig {
        ready_timeout: Duration::from_millis(args.ready_timeout_ms),
        grace: Duration::from_millis(args.grace_ms),
        restart: args.restart,
        routing: match args.hash_seed {
            Some(seed) => RoutingPolicy::PeerHash { seed },
            None => RoutingPolicy::RoundRobin,
        },
        ..ClusterConfig::default()
    };

    let cluster = match Cluster::builder(options)
        .with_config(cfg)
        .with_subscribers(vec![Arc::new(LogWriter::new()) as Arc<dyn Subscribe>])
        .start()
        .await
    {
        Ok(cluster) => cluster,
        Err(e) => {
            error!(error = %e, label = e.as_label(), "[master] start failed");
            return ExitReason::Failure;
        }
    };
    if let Some(addr) = cluster.sticky_addr() {
        info!(%addr, "[master] sticky listener ready");
    }

    match cluster.run_until_signal().await {
        Ok(()) => ExitReason::Clean,
        Err(e) => {
            error!(error = %e, "[master] stop was not clean");
            ExitReason::Failure
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
