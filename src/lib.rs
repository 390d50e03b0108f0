pub mod agent_engine;
pub mod config;
pub mod errors;
pub mod executor;
pub mod perception;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use crate::agent_engine::controller::{AutoplayController, DesktopPlatform};
use crate::agent_engine::engine::LoopExit;
use crate::config::LoggingConfig;
use crate::errors::AutoplayResult;
use crate::perception::calibration::Calibration;

/// `RUST_LOG` wins over `logging.filter`; `info` if neither parses.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| match config.filter.trim() {
            "" => EnvFilter::try_new("info"),
            directives => EnvFilter::try_new(directives),
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Binary entry: load config, drive the configured window until the run ends
/// or Ctrl-C stops it.
pub async fn run() -> AutoplayResult<LoopExit> {
    // a missing .env is fine
    let _ = dotenvy::dotenv();

    let config = config::load_config()?;
    init_tracing(&config.logging);

    let calibration = Calibration::load(
        &config.calibration,
        config.perception.working_width,
        &config::config_base_dir(),
    )?;
    let window = config.session.window_handle();
    let goal = config.session.goal;

    let mut controller = AutoplayController::new(config, Arc::new(calibration), Arc::new(DesktopPlatform));
    let session = controller.start(window, goal)?;

    if let Some(mut feed) = controller.subscribe() {
        tokio::spawn(async move {
            let mut last_state = None;
            loop {
                match feed.recv().await {
                    Ok(snap) => {
                        if last_state.as_ref() != Some(&snap.loop_state) {
                            tracing::info!(tick = snap.tick, state = ?snap.loop_state, "status");
                            last_state = Some(snap.loop_state.clone());
                        }
                        if let (Some(nav), Some(action)) = (&snap.navigation, &snap.last_action) {
                            tracing::debug!(tick = snap.tick, state = %nav.kind, action = %action, "status");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "status feed lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    if let Some(mut status) = controller.status() {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "ctrl-c handler failed");
                }
                tracing::info!(session = %session.id, "interrupt received; stopping");
                controller.stop()?;
            }
            _ = status.wait_for(|s| s.loop_state.is_stopped()) => {}
        }
    }

    controller.join().await
}
