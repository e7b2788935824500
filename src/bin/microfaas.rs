//! microfaas - function-as-a-service orchestrator CLI
//!
//! ## Usage
//!
//! ```sh
//! microfaas serve [--config <path>] [--listen <addr>]
//! microfaas demo <bundle.zip> <function> [body-json]
//! ```
//!
//! Both commands drive unprivileged buildah containers and therefore need a
//! user namespace. Unless `--no-unshare` is given, the process re-executes
//! itself under `buildah unshare` before doing any work.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::{error, info};

use microfaas::logging::setup_tracing;
use microfaas::{BundleSource, Orchestrator, OrchestratorConfig, server};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        global = true,
        value_name = "config file",
        help = "Path to config file"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Emit JSON log lines")]
    json_logs: bool,

    #[arg(
        long,
        global = true,
        help = "Skip re-executing under `buildah unshare`"
    )]
    no_unshare: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP control plane.
    Serve {
        #[arg(short, long, value_name = "addr", help = "Override the listen address")]
        listen: Option<String>,
    },
    /// Deploy a bundle, call one function, wait for it and tear down.
    Demo {
        bundle: PathBuf,
        function: String,
        #[arg(default_value = "null", help = "JSON request body")]
        body: String,
        #[arg(long, default_value = "demo", help = "Bundle name")]
        name: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match OrchestratorConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("microfaas: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Command::Serve {
        listen: Some(listen),
    } = &cli.command
    {
        config.listen_addr = listen.clone();
    }

    #[cfg(unix)]
    if !cli.no_unshare && !microfaas::buildah::in_user_namespace() {
        let err = microfaas::buildah::reexec_in_user_namespace(&config.buildah_path);
        eprintln!(
            "microfaas: failed to re-execute under {} unshare: {err}",
            config.buildah_path.display()
        );
        return ExitCode::FAILURE;
    }

    if let Err(e) = setup_tracing(cli.json_logs || config.structured_logging) {
        eprintln!("microfaas: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        match cli.command {
            Command::Serve { .. } => serve(config).await,
            Command::Demo {
                bundle,
                function,
                body,
                name,
            } => demo(config, bundle, &name, &function, &body).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: OrchestratorConfig) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    let orchestrator = Orchestrator::start(config).context("failed to start orchestrator")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };
    let served = server::serve(orchestrator.clone(), shutdown).await;
    orchestrator.stop().await;
    served.context("control plane failed")
}

async fn demo(
    config: OrchestratorConfig,
    bundle: PathBuf,
    name: &str,
    function: &str,
    body: &str,
) -> anyhow::Result<()> {
    let body: Value = serde_json::from_str(body).context("body is not valid JSON")?;
    let orchestrator = Orchestrator::start(config).context("failed to start orchestrator")?;
    let manager = orchestrator.manager();

    println!("deploying {} as {name}", bundle.display());
    let deployed = manager.deploy(name, BundleSource::Path(bundle)).await;
    let info = match deployed {
        Ok(info) => info,
        Err(e) => {
            orchestrator.stop().await;
            return Err(e).context("deploy failed");
        }
    };
    println!("deployed {name} ({}, container {})", info.digest, info.runtime_id);

    manager.call(name, function, body, Map::new())?;
    println!("queued {function}");
    manager.join().await;
    println!("queue drained");

    manager.delete(name, true).await?;
    println!("deleted {name}");
    orchestrator.stop().await;
    Ok(())
}
