use color_eyre::Result;
use lightnode::config::Config;
use lightnode::controller::{event_channel, ControlSettings, Controller, Exit};
use lightnode::mqtt::MqttHandler;
use lightnode::network::{SessionManager, SysfsLink};
use lightnode::output;
use lightnode::persistence::SetpointStore;
use lightnode::restart::restart;
use lightnode::update::OtaReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    // Konfiguration laden, beim ersten Start Defaults anlegen
    let config_path = Config::default_path();
    let config = Config::load_or_init(&config_path).await?;
    info!("Using configuration {}", config_path.display());

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => warn!("Unable to listen for Ctrl-C: {}", e),
        }
        token.cancel();
    });

    let (notify, events) = event_channel(config.device.queue_capacity);
    let settings = ControlSettings::from_config(&config);

    // Komponenten aufbauen
    let output = output::from_config(&config.output);
    let session = SessionManager::from_config(SysfsLink::new(&config.link), &config.link);
    let channel = MqttHandler::spawn(
        &config.broker,
        &config.device.identity,
        &settings.topics.status,
        notify.clone(),
        shutdown.clone(),
    );
    let agent = OtaReceiver::new(&config.update, shutdown.clone());
    let firmware = config.update.firmware_image();
    let store = SetpointStore::new(config.store.path.clone());

    let controller = Controller::new(
        settings,
        store,
        output,
        session,
        channel,
        agent,
        (notify, events),
    );

    match controller.run(shutdown.clone()).await {
        Exit::Restart(reason) => {
            shutdown.cancel();
            restart(reason, firmware.as_deref())
        }
        Exit::Stopped => {
            shutdown.cancel();
            info!("Stopped");
            Ok(())
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}
