//! Reference host binary: wires one forwarder manager (+ optional
//! simulcast source, + optional transcoding outputs) per configured path
//! against the in-memory registry. This is a demo/test harness, not a
//! production media server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use relay_core::{
    forwarder::ForwarderManager, simulcast, synthetic::SyntheticStream, transcode, PathRegistry, SourceStream,
};
use relay_host::{load_config, validate_and_log, MemoryRegistry};
use relay_protocol::PathName;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn parse_args() -> PathBuf {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/relay.toml");

    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" || args[i] == "-c" {
            if i + 1 < args.len() {
                config_path = PathBuf::from(&args[i + 1]);
                i += 1;
            }
        }
        i += 1;
    }

    config_path
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = parse_args();
    let config = load_config(&config_path)?;

    if validate_and_log(&config) {
        tracing::error!("configuration has error(s), fix them above and restart");
        std::process::exit(1);
    }

    let registry = MemoryRegistry::new();
    let cancel = CancellationToken::new();

    for (path_name, relay_config) in &config.paths {
        let path = PathName::new(path_name.clone());
        let source = SyntheticStream::new(Default::default());
        registry
            .set_ready(path_name, source.clone(), source.description())
            .await?;

        let manager = ForwarderManager::new(path.clone(), relay_config);
        if !manager.is_empty() {
            manager.start(source.clone()).await;
            tracing::info!(path = %path, "forwarder manager started");
        }

        if relay_config.srt_transcoding.enable {
            for output_config in &relay_config.srt_transcoding.outputs {
                let output = transcode::TranscodingOutput::new(output_config.clone());
                let output_stream = output.stream();
                output.start(source.clone(), cancel.clone()).await?;
                transcode::publish(Arc::clone(&registry) as Arc<dyn PathRegistry>, &output_config.path, output_stream).await?;
                tracing::info!(path = %path, output = %output_config.path, "transcoding output started");
            }
        }

        if relay_config.simulcast.enable {
            let registry = Arc::clone(&registry) as Arc<dyn PathRegistry>;
            let config = relay_config.simulcast.clone();
            let output_path = path_name.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = simulcast::run(&config, registry, &output_path, cancel).await {
                    tracing::warn!(error = %e, path = %output_path, "simulcast source exited");
                }
            });
        }
    }

    tracing::info!("relay-host running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();

    Ok(())
}
