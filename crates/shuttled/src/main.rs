//! shuttled — chunked file transfer server.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

use shuttle_core::config::ShuttleConfig;
use shuttle_services::{serve, FsStore, Registry, WorkerSettings};

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

fn print_usage() {
    println!("shuttled — chunked file transfer server");
    println!();
    println!("Usage: shuttled [--bind <addr>] [--root <dir>]");
    println!();
    println!("  --bind <addr>   UDP listen address (default from config, 0.0.0.0:2224)");
    println!("  --root <dir>    Only serve files under this directory");
    println!();
    println!("Config: $SHUTTLE_CONFIG or ~/.config/shuttle/config.toml");
    println!("Logging: RUST_LOG (default info)");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load config
    if let Err(e) = ShuttleConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = ShuttleConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ShuttleConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                i += 1;
                config.server.bind = args.get(i).context("--bind requires a value")?.clone();
            }
            "--root" => {
                i += 1;
                config.server.serve_root =
                    PathBuf::from(args.get(i).context("--root requires a value")?);
            }
            "--help" | "-h" | "help" => {
                print_usage();
                return Ok(());
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    config.validate().context("invalid configuration")?;

    let socket = Arc::new(
        UdpSocket::bind(&config.server.bind)
            .await
            .with_context(|| format!("failed to bind {}", config.server.bind))?,
    );
    tracing::info!(
        addr = %socket.local_addr()?,
        chunk_size = config.protocol.chunk_size,
        idle_timeout_ms = config.server.idle_timeout_ms,
        root = %config.server.serve_root.display(),
        "shuttled starting"
    );

    let settings = WorkerSettings::from_config(&config);
    let (registry, reaper) = Registry::new(socket.clone(), Arc::new(FsStore::new()), settings);

    // Shutdown signal
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let reaper_task = tokio::spawn(reaper.run(shutdown_tx.subscribe()));

    let server_task = tokio::spawn(serve(socket, registry.clone(), shutdown_tx.subscribe()));

    let snapshot_task = {
        let registry = registry.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {
                        if !registry.is_empty() {
                            tracing::info!(sessions = registry.len(), "session table snapshot");
                        }
                    }
                }
            }
        })
    };

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = server_task        => match r {
            Ok(Ok(())) => tracing::info!("server loop exited"),
            Ok(Err(e)) => tracing::error!(error = %e, "server loop failed"),
            Err(e)     => tracing::error!(error = %e, "server loop panicked"),
        },
        r = reaper_task        => tracing::error!("reaper exited: {:?}", r),
        r = snapshot_task      => tracing::error!("snapshot task exited: {:?}", r),
    }

    Ok(())
}
