use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wisun_smartmeter_bridge::{
    Config, EchonetTransport, MackerelClient, PresentationAdapter, SamplingCoordinator,
    SamplingIntervals, SensorAccessory,
};

const CONNECT_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Starting Wi-SUN smart meter bridge");
    let config = Config::from_env()?;
    info!(
        "Meter at {}, alert threshold {}%, accessory '{}' on {}",
        config.meter.address,
        config.alert_threshold,
        config.accessory.name,
        config.accessory.listen
    );

    let forwarder = MackerelClient::new(&config.mackerel);
    if forwarder.is_enabled() {
        info!(
            "Forwarding readings to Mackerel service '{}'",
            config.mackerel.service
        );
    } else {
        info!("MACKEREL_APIKEY not set, metrics forwarding disabled");
    }

    // The accessory is available (reporting 0%) even before the meter answers
    let (accessory, characteristic_updates) = SensorAccessory::new(&config.accessory.name);
    let listener = TcpListener::bind(config.accessory.listen).await?;
    let server = tokio::spawn(accessory.serve(listener));

    let transport = match EchonetTransport::connect_with_retry(&config.meter, CONNECT_ATTEMPTS).await
    {
        Ok(transport) => transport,
        Err(e) => {
            error!("Failed to connect to smart meter: {e}");
            return Err(e.into());
        }
    };

    let _sampling = SamplingCoordinator::start(
        Arc::new(transport),
        PresentationAdapter::new(characteristic_updates, config.alert_threshold),
        forwarder,
        SamplingIntervals::default(),
    );

    tokio::select! {
        res = server => {
            res??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    Ok(())
}
