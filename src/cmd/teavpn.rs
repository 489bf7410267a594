use clap::{Parser, Subcommand};
use std::process::ExitCode;
use teavpn::client::config::{ClientConfig, ClientOpts};
use teavpn::server::config::{ServerConfig, ServerOpts};
use teavpn::server::relay;
use teavpn::{client, utils};

/// TeaVPN point-to-multipoint layer-3 VPN
#[derive(Parser, Debug)]
#[command(name = "teavpn", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a TeaVPN server
    Server(ServerOpts),
    /// Connect to a TeaVPN server
    Connect(ClientOpts),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Server(opts) => ServerConfig::resolve(opts).and_then(|cfg| {
            utils::init_tracing(cfg.verbose, cfg.error_log.as_deref())?;
            relay::run(cfg)
        }),
        Command::Connect(opts) => ClientConfig::resolve(opts).and_then(|cfg| {
            utils::init_tracing(cfg.verbose, cfg.error_log.as_deref())?;
            client::run_client(cfg)
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
