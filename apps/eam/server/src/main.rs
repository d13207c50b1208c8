use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use eam_client::ControlClient;
use eam_core::config::AppConfig;
use eam_server::{
    build_state,
    cli::{Cli, Command, CtlCommand, RunArgs, ServeArgs},
    daemon::{self, StartOptions},
    engine::dry_run_engine,
    routes::{BUILD_ID, EAM_VERSION},
    run, serve_with_shutdown,
    telemetry::{self, LogConfig, LogLevel},
};
use tokio::{net::TcpListener, signal};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref()).context("failed to load config")?;

    let _log_guard = telemetry::init(&LogConfig {
        level: cli
            .log_level
            .unwrap_or_else(|| LogLevel::from_config(&config.log.level)),
        dir: config.log.dir.clone(),
        dev: cli.dev || config.log.dev,
    })?;

    match cli.resolved_command() {
        Command::Serve(args) => serve(&mut config, args).await,
        Command::Run(args) => run_local(&config, args).await,
        Command::Start(args) => {
            apply_overrides(&mut config, &args);
            let pid = daemon::start(StartOptions {
                daemon_dir: config.daemon_dir.clone(),
                host: config.server.host.clone(),
                port: config.server.port,
                config: cli.config.clone(),
            })
            .await?;
            println!("eam started (pid {pid})");
            Ok(())
        }
        Command::Stop => {
            let pid = daemon::stop(&config.daemon_dir).await?;
            println!("eam stopped (pid {pid})");
            Ok(())
        }
        Command::Version => {
            let engine = dry_run_engine(&config, Duration::ZERO);
            println!("eam {EAM_VERSION} (build {BUILD_ID})");
            println!("engine {} {}", engine.name(), engine.version());
            Ok(())
        }
        Command::Ctl(command) => ctl(command).await,
    }
}

fn apply_overrides(config: &mut AppConfig, args: &ServeArgs) {
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
}

async fn serve(config: &mut AppConfig, args: ServeArgs) -> Result<()> {
    apply_overrides(config, &args);
    let engine = dry_run_engine(config, Duration::from_millis(args.dry_run_delay_ms));
    let state = build_state(config, engine);
    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        addr = %addr,
        version = EAM_VERSION,
        build = BUILD_ID,
        "starting eam server"
    );
    serve_with_shutdown(
        listener,
        state,
        shutdown_signal(),
        Duration::from_secs(config.server.shutdown_grace_secs),
    )
    .await
}

async fn run_local(config: &AppConfig, args: RunArgs) -> Result<()> {
    let engine = dry_run_engine(config, Duration::from_millis(args.dry_run_delay_ms));
    let outcome = run::run_once(
        config,
        engine,
        args.id.as_deref(),
        args.name.as_deref(),
        shutdown_signal(),
    )
    .await?;
    println!("{}", run::summary(&outcome));
    Ok(())
}

async fn ctl(command: CtlCommand) -> Result<()> {
    match command {
        CtlCommand::Start { id, url, wait } => {
            let mut client = ControlClient::connect(&url).await?;
            client.start(&id).await?;
            println!("started {id}");
            if wait {
                client.wait_completed(&id).await?;
                println!("completed {id}");
            }
            client.close().await?;
        }
        CtlCommand::Stop { id, url } => {
            let mut client = ControlClient::connect(&url).await?;
            client.stop(&id).await?;
            println!("stopped {id}");
            client.close().await?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
