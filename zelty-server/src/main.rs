use clap::Parser;
use tracing::{error, info};

use zelty_server::{BackendRegistry, ZeltyServer};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct ZeltyServerCliArgs {
    /// Server configuration file (TOML). Defaults are used when absent.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Override the UDP port from the configuration.
    #[arg(long)]
    port: Option<u16>,
    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    dump_config: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = ZeltyServerCliArgs::parse();

    if args.dump_config {
        match zelty_config_data::default_server_config_toml() {
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

    let mut config = zelty_config_data::server_config_or_default(args.config.as_deref());
    if let Some(port) = args.port {
        config.port = port;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(config.worker_threads + 4)
        .thread_name("zelty-server")
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("could not build runtime: {err}");
            std::process::exit(1);
        }
    };

    // Model backends (e.g. an ONNX runtime wrapper) are linked in by the
    // deployment; with none registered the engine runs in simulation mode.
    let backends = BackendRegistry::new();

    let server = match runtime.block_on(ZeltyServer::start(config, backends)) {
        Ok(server) => server,
        Err(err) => {
            error!("initialization failed: {err}");
            std::process::exit(1);
        }
    };

    let outcome = runtime.block_on(async {
        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        Ok::<(), std::io::Error>(())
    });

    runtime.block_on(server.shutdown());

    if let Err(err) = outcome {
        error!("runtime failure: {err}");
        std::process::exit(2);
    }
}
