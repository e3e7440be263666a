//! shuttle-ctl — fetch a file from a shuttled server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use tracing_subscriber::EnvFilter;

use shuttle_core::config::ShuttleConfig;
use shuttle_services::{FsStore, Receiver, ReceiverSettings};

const DEFAULT_SERVER: &str = "127.0.0.1:2224";

fn print_usage() {
    println!("Usage: shuttle-ctl --file <path> [--bind <server>] [--out <dir>] [--miss | --miss-at <n>]");
    println!();
    println!("Options:");
    println!("  --file <path>     Path of the file on the server");
    println!("  --bind <server>   Server address (default: {})", DEFAULT_SERVER);
    println!("  --out <dir>       Output directory (default from config, .)");
    println!("  --miss            Drop a random early chunk (1st-5th) to exercise recovery");
    println!("  --miss-at <n>     Drop the n-th chunk received");
}

struct Args {
    server: String,
    file: String,
    out: Option<PathBuf>,
    drop_nth: Option<usize>,
}

fn parse_args() -> Result<Option<Args>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut server = DEFAULT_SERVER.to_string();
    let mut file = None;
    let mut out = None;
    let mut drop_nth = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                i += 1;
                server = args.get(i).context("--bind requires a value")?.clone();
            }
            "--file" => {
                i += 1;
                file = Some(args.get(i).context("--file requires a value")?.clone());
            }
            "--out" => {
                i += 1;
                out = Some(PathBuf::from(args.get(i).context("--out requires a value")?));
            }
            "--miss" => {
                drop_nth = Some(rand::thread_rng().gen_range(1..=5));
            }
            "--miss-at" => {
                i += 1;
                let n: usize = args
                    .get(i)
                    .context("--miss-at requires a value")?
                    .parse()
                    .context("--miss-at must be a number")?;
                anyhow::ensure!(n > 0, "--miss-at counts from 1");
                drop_nth = Some(n);
            }
            "--help" | "-h" | "help" => {
                print_usage();
                return Ok(None);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                eprintln!();
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    let Some(file) = file else {
        eprintln!("--file is required");
        eprintln!();
        print_usage();
        std::process::exit(1);
    };
    Ok(Some(Args {
        server,
        file,
        out,
        drop_nth,
    }))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let Some(args) = parse_args()? else {
        return Ok(());
    };

    let config = ShuttleConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ShuttleConfig::default()
    });
    let mut settings = ReceiverSettings::from_config(&config);
    if let Some(out) = args.out {
        settings.output_dir = out;
    }
    settings.drop_nth_chunk = args.drop_nth;

    let server = tokio::net::lookup_host(&args.server)
        .await
        .with_context(|| format!("cannot resolve {}", args.server))?
        .next()
        .with_context(|| format!("{} resolved to no addresses", args.server))?;

    if let Some(n) = args.drop_nth {
        println!("Fault injection: dropping chunk #{}", n);
    }

    let mut receiver = Receiver::connect(server, Arc::new(FsStore::new()), settings).await?;
    let report = receiver
        .request_file(&args.file)
        .await
        .with_context(|| format!("transfer of {} from {} failed", args.file, server))?;

    println!("═══════════════════════════════════════");
    println!("  Transfer complete");
    println!("═══════════════════════════════════════");
    println!("  Source        : {}:{}", server, args.file);
    println!("  Output        : {}", report.output.display());
    println!("  Size          : {} bytes", report.bytes);
    println!("  Tokens        : {}", report.tokens);
    println!("  Checksum      : {}", report.checksum);
    println!("  Gap requests  : {}", report.gap_requests);
    println!("  Duplicates    : {}", report.duplicates);
    if report.dropped > 0 {
        println!("  Dropped       : {}", report.dropped);
    }

    Ok(())
}
