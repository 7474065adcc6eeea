use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{error, info};
use vibmotor_remote::domain::settings::SettingsService;
use vibmotor_remote::infrastructure::bluetooth::{BtleplugPlatform, SessionHandle, SessionManager};
use vibmotor_remote::infrastructure::logging;
use vibmotor_remote::presentation::console;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?;
    let _log_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting VibMotor Remote");
    if settings.save_if_missing()? {
        info!("Wrote default settings to {}", settings.path().display());
    } else {
        info!("Settings: {}", settings.path().display());
    }

    let target = settings.target_descriptor()?;
    let (tx, rx) = mpsc::unbounded_channel();

    let platform = BtleplugPlatform::new(settings.get().ble.adapter_index, tx.clone()).await;
    let manager = SessionManager::new(platform, target, settings.pulse_duration(), tx.clone());
    let status = manager.subscribe();
    let session = SessionHandle::new(tx);

    let session_task = tokio::spawn(manager.run(rx));
    let status_task = tokio::spawn(console::print_status(status.clone()));

    let input = BufReader::new(tokio::io::stdin());
    tokio::select! {
        result = console::run(input, session.clone(), status) => {
            if let Err(e) = result {
                error!("Console stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            // Already gone if the session ended on its own.
            let _ = session.shutdown();
        }
    }

    session_task.await?;
    status_task.abort();
    info!("Bye");
    Ok(())
}
