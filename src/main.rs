use rpg_autoplay::agent_engine::state::StopReason;

#[tokio::main]
async fn main() {
    match rpg_autoplay::run().await {
        Ok(exit) => {
            tracing::info!(session = %exit.session_id, ticks = exit.ticks, reason = %exit.reason, "autoplay finished");
            if matches!(exit.reason, StopReason::Fatal(_)) {
                eprintln!("rpg-autoplay stopped: {}", exit.reason);
                std::process::exit(1);
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "autoplay failed");
            eprintln!("rpg-autoplay: {e}");
            std::process::exit(1);
        }
    }
}
