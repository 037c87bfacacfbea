use std::{path::PathBuf, process};

use structopt::StructOpt;
use tokio::signal;
use tracing::warn;
use tracing_subscriber::FmtSubscriber;

use meshfl_server::{api, rendezvous::RendezvousHandle, settings::Settings};

#[derive(Debug, StructOpt)]
#[structopt(name = "Rendezvous")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        rendezvous: rendezvous_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let rendezvous = RendezvousHandle::new(rendezvous_settings.minimum_ready_peers);

    tokio::select! {
        result = api::serve(api_settings, rendezvous) => {
            if let Err(err) = result {
                warn!("shutting down: {}", err);
            }
        }
        _ = signal::ctrl_c() => {}
    }
}
