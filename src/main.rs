use color_eyre::Result;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::FmtSubscriber;

use trena::config::AppConfig;
use trena::console::{entry_form, input_lines, Console};
use trena::mqtt::MqttChannel;
use trena::session::{MeasurementSession, SessionHandle};

#[tokio::main]
async fn main() -> Result<()> {
    let set_log_level = setup()?;

    let config_path = AppConfig::default_path();
    let config = AppConfig::ensure_default_config(&config_path).await?;
    set_log_level(config.log.level());
    info!("Configuration loaded from {}", config_path.display());

    let mut lines = input_lines(tokio::io::stdin());
    let Some(context) = entry_form(&mut lines).await? else {
        info!("No visit entered, exiting");
        return Ok(());
    };

    info!(
        "Starting session for {} at {} via {}",
        context.client_name(),
        context.address(),
        config.mqtt.server
    );
    let (events_tx, events_rx) = mpsc::channel(config.mqtt.event_capacity.max(1));
    let channel = MqttChannel::new(config.mqtt.clone(), events_tx);
    let session = MeasurementSession::new(context, Box::new(channel), &config.mqtt);
    let handle = SessionHandle::spawn(session, events_rx);

    Console::new(handle, config.theme.clone(), config.report.output_dir.clone())
        .run(lines)
        .await?;

    info!("Bye");
    Ok(())
}

fn setup() -> Result<impl Fn(Level)> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    Ok(setup_logging_env())
}

// Installed before the config is read so its warnings are shown; the returned
// closure applies the configured level afterwards. Logs go to stderr so they
// do not mix with the console prompts.
fn setup_logging_env() -> impl Fn(Level) {
    let builder = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .with_filter_reloading();
    let handle = builder.reload_handle();
    builder.init();

    move |level| {
        if let Err(e) = handle.reload(LevelFilter::from_level(level)) {
            warn!("Could not apply log level {}: {}", level, e);
        }
    }
}
