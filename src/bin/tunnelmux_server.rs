use argh::FromArgs;
use std::error::Error;
use tracing_subscriber::EnvFilter;
use tunnelmux::Config;

/// Tunneling proxy server: demultiplexes many upstream TCP sessions over
/// one client tunnel connection.
#[derive(FromArgs)]
struct CliArgs {
    /// path to a TOML config file
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// local port to listen on (overrides config)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// server (tunnel-facing) port to listen on (overrides config)
    #[argh(option, short = 'P')]
    server_port: Option<u16>,

    /// local bind address (overrides config)
    #[argh(option, short = 'r')]
    local_address: Option<String>,

    /// server (tunnel-facing) bind address (overrides config)
    #[argh(option, short = 'l')]
    server_address: Option<String>,

    /// enable verbose logging
    #[argh(switch, short = 'V')]
    verbose: bool,

    /// run as a daemon (acknowledged, not implemented)
    #[argh(switch, short = 'd')]
    daemonize: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let mut config = match &cli_args.config {
        Some(path) => tunnelmux::Config::load(path)?,
        None => Config::default(),
    };

    if let Some(port) = cli_args.port {
        config.local_port = port;
    }
    if let Some(port) = cli_args.server_port {
        config.server_port = port;
    }
    if let Some(addr) = &cli_args.local_address {
        config.local_address = addr.parse()?;
    }
    if let Some(addr) = &cli_args.server_address {
        config.server_address = addr.parse()?;
    }
    if cli_args.verbose {
        config.verbose = true;
    }
    config.finalize();

    let filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cli_args.daemonize {
        tracing::warn!("-d/--daemonize was requested but daemonization is not implemented; running in the foreground");
    }

    tunnelmux::server::run(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    Ok(())
}
