#[macro_use]
extern crate tracing;

use std::path::PathBuf;

use anyhow::Context as _;
use fluxgate::{config, listener, tls, EngineState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args().context("invalid arguments")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tls::install_default_crypto_provider();

    let conf = config::load_file(&args.config_path)?;
    anyhow::ensure!(!conf.listeners.is_empty(), "no listeners configured");

    let state = EngineState::new(conf)?;

    let mut tasks = tokio::task::JoinSet::new();
    for listener_conf in state.conf.listeners.iter() {
        let listener_conf = config::ListenerConfig {
            bind: listener_conf.bind.clone(),
            protocol: listener_conf.protocol,
            users: listener_conf.users.clone(),
        };
        tasks.spawn(listener::run(listener_conf, state.clone()));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
        Some(finished) = tasks.join_next() => {
            match finished {
                Ok(Ok(())) => warn!("A listener stopped unexpectedly"),
                Ok(Err(error)) => error!(error = format!("{error:#}"), "A listener failed"),
                Err(error) => error!(%error, "A listener task panicked"),
            }
        }
    }

    Ok(())
}

struct Args {
    config_path: PathBuf,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config_path = PathBuf::from("fluxgate.json");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = args.next().context("--config expects a path")?;
                config_path = PathBuf::from(value);
            }
            other => anyhow::bail!("unknown argument `{other}`"),
        }
    }

    Ok(Args { config_path })
}
