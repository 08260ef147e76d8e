use anyhow::Context;
use es_cli::{run_probe, ProbeConfig};
use es_search::CancelToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("EPSCOUT_CONFIG").ok());
    let config = match &path {
        Some(path) => ProbeConfig::from_json_file(path)
            .with_context(|| format!("failed to load probe config from {path}"))?,
        None => ProbeConfig::default(),
    };
    info!(config = path.as_deref().unwrap_or("<defaults>"), "Epsilon Scout probe starting");

    let cancel = CancelToken::new();
    let mut worker = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || run_probe(&config, cancel))
    };

    let report = tokio::select! {
        joined = &mut worker => joined??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, stopping search");
            cancel.cancel();
            worker.await??
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
