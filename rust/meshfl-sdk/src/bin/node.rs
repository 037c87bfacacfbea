use std::{path::PathBuf, process, sync::Arc};

use rand::Rng;
use structopt::StructOpt;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use meshfl_core::{stats::Informant, SharedWeights, WeightsContainer};
use meshfl_sdk::{
    client::DecentralizedClient,
    settings::{DemoSettings, Settings},
    signaling,
    transport::UdpTransport,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "Node")]
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
        rendezvous: rendezvous_settings,
        aggregator: aggregator_settings,
        protocol: protocol_settings,
        transport: transport_settings,
        privacy: privacy_settings,
        log: log_settings,
        demo: demo_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let aggregator = aggregator_settings.build().unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let mut client = DecentralizedClient::new(
        protocol_settings,
        aggregator,
        Box::new(privacy_settings),
        Arc::new(UdpTransport::from(&transport_settings)),
    );
    let model = SharedWeights::default();
    let informant = Informant::new();
    client.with_aggregator(|aggregator| {
        aggregator.core_mut().set_model(Box::new(model.clone()));
        aggregator.core_mut().set_observer(Box::new(informant.clone()));
    });

    let endpoint = rendezvous_settings.endpoint().unwrap_or_else(|err| {
        eprintln!("invalid rendezvous endpoint: {}", err);
        process::exit(1);
    });
    let (sender, receiver) = match signaling::connect(&endpoint).await {
        Ok(channel) => channel,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };
    if let Err(err) = client.connect(sender, receiver).await {
        eprintln!("{}", err);
        process::exit(1);
    }

    tokio::select! {
        _ = train(&mut client, &demo_settings, &model) => {
            info!("training finished: {:?}", informant.stats());
        }
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted");
        }
    }
    client.disconnect();
}

/// Runs the synthetic training loop: each round nudges the weights randomly and
/// exchanges the result with the peers.
async fn train(client: &mut DecentralizedClient, settings: &DemoSettings, model: &SharedWeights) {
    let mut weights = WeightsContainer::from(vec![vec![0.0; settings.model_length]]);
    for round in 1..=settings.rounds {
        let stale = weights.clone();
        let update = {
            let mut rng = rand::thread_rng();
            stale.map(|value| value + rng.gen_range(-1.0..1.0))
        };
        weights = client
            .on_round_end_communication(update, &stale, round)
            .await;
        let aggregated = model.get().map_or(false, |held| held == weights);
        info!(
            "round {} done (norm {:.4}, aggregated: {})",
            round,
            weights.frobenius_norm(),
            aggregated
        );
    }
}
