use clap::Parser;
use tracing::{error, info};

use zelty_client::{FrameSource, LoggingSink, StateSink, SyntheticFrameSource, ZeltyClient};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct ZeltyClientCliArgs {
    /// Client configuration file (TOML). Defaults are used when absent.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Override the server address from the configuration (ip:port).
    #[arg(long)]
    server: Option<String>,
    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    dump_config: bool,
}

/// Synthetic capture resolution: small enough that a raw RGB frame fits a
/// single datagram. The real capture component scales and compresses.
const CAPTURE_WIDTH: u16 = 128;
const CAPTURE_HEIGHT: u16 = 96;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = ZeltyClientCliArgs::parse();

    if args.dump_config {
        match zelty_config_data::default_client_config_toml() {
            Ok(toml) => {
                println!("{toml}");
                return;
            }
            Err(err) => {
                error!("could not render default config: {err}");
                std::process::exit(1);
            }
        }
    }

    let mut config = zelty_config_data::client_config_or_default(args.config.as_deref());
    if let Some(server) = args.server {
        match server.rsplit_once(':') {
            Some((ip, port)) => {
                config.server_ip = ip.to_string();
                config.server_port = port.parse().unwrap_or(config.server_port);
            }
            None => config.server_ip = server,
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("zelty-client")
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("could not build runtime: {err}");
            std::process::exit(1);
        }
    };

    info!("client config: {config:?}");
    if !config.auto_connect {
        info!("auto_connect disabled; exiting");
        return;
    }

    let endpoint = format!("{}:{}", config.server_ip, config.server_port);
    let auto_start = config.auto_start;
    let target_fps = config.target_fps;
    let keyframe_interval = config.compression.keyframe_interval;

    let client = match runtime.block_on(ZeltyClient::connect(config)) {
        Ok(client) => client,
        Err(err) => {
            error!("connection to {endpoint} failed: {err}");
            std::process::exit(1);
        }
    };
    let client = std::sync::Arc::new(client);

    // Stand-in capture: push synthetic frames at the target rate until
    // the real capture component takes over the submit_frame boundary.
    let capture = if auto_start {
        let client = client.clone();
        Some(runtime.spawn(async move {
            let mut source =
                SyntheticFrameSource::new(CAPTURE_WIDTH, CAPTURE_HEIGHT, keyframe_interval);
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                1000 / target_fps.max(1) as u64,
            ));
            loop {
                interval.tick().await;
                match source.next_frame() {
                    Some(frame) => {
                        if let Err(err) = client.submit_frame(frame) {
                            error!("frame submission failed: {err}");
                        }
                    }
                    None => break,
                }
            }
        }))
    } else {
        None
    };

    // Periodic status line; the fused state itself goes to the sink.
    let status = {
        let client = client.clone();
        runtime.spawn(async move {
            let mut sink = LoggingSink::default();
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                interval.tick().await;
                let state = client.latest_state();
                sink.consume(&state);
                info!(
                    "ping {:.1} ms, {} local tracks, {} fused detections",
                    client.ping_ms(),
                    client.local_track_count(),
                    state.detections.len()
                );
            }
        })
    };

    let outcome = runtime.block_on(async { tokio::signal::ctrl_c().await });

    if let Some(capture) = capture {
        capture.abort();
        let _ = runtime.block_on(capture);
    }
    status.abort();
    let _ = runtime.block_on(status);

    match std::sync::Arc::try_unwrap(client) {
        Ok(client) => runtime.block_on(client.disconnect()),
        Err(_) => error!("client still in use at shutdown"),
    }

    if let Err(err) = outcome {
        error!("runtime failure: {err}");
        std::process::exit(2);
    }
}
