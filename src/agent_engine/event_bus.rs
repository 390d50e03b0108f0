use base64::Engine as _;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};

use crate::agent_engine::loop_control::HealthSnapshot;
use crate::agent_engine::state::{Action, ActionOutcome, LoopState, NavigationSummary};

const FEED_CAPACITY: usize = 100;
const COMMAND_CAPACITY: usize = 32;

/// Control messages from the operator side into the running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopCommand {
    Pause,
    Resume,
    Stop,
}

/// Immutable per-tick status, published once per tick and on every
/// lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub session_id: String,
    pub tick: u64,
    pub at: chrono::DateTime<chrono::Utc>,
    pub loop_state: LoopState,
    pub navigation: Option<NavigationSummary>,
    pub last_action: Option<Action>,
    pub last_reason: Option<String>,
    pub last_outcome: Option<ActionOutcome>,
    pub health: HealthSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_png_base64: Option<String>,
}

impl StatusSnapshot {
    pub fn idle(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            tick: 0,
            at: chrono::Utc::now(),
            loop_state: LoopState::Idle,
            navigation: None,
            last_action: None,
            last_reason: None,
            last_outcome: None,
            health: HealthSnapshot::default(),
            preview_png_base64: None,
        }
    }
}

/// Publishing half, owned by the loop.
pub struct EventBus {
    latest: watch::Sender<StatusSnapshot>,
    feed: broadcast::Sender<StatusSnapshot>,
}

/// Read-only observer half. Observers never reach loop state.
#[derive(Clone)]
pub struct StatusFeed {
    latest: watch::Receiver<StatusSnapshot>,
    feed: broadcast::Sender<StatusSnapshot>,
}

impl EventBus {
    pub fn new(initial: StatusSnapshot) -> (Self, StatusFeed) {
        let (latest_tx, latest_rx) = watch::channel(initial);
        let (feed_tx, _) = broadcast::channel(FEED_CAPACITY);
        let feed = StatusFeed {
            latest: latest_rx,
            feed: feed_tx.clone(),
        };
        (
            Self {
                latest: latest_tx,
                feed: feed_tx,
            },
            feed,
        )
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        self.latest.send_replace(snapshot.clone());
        // no subscribers is fine
        let _ = self.feed.send(snapshot);
    }
}

impl StatusFeed {
    /// Latest snapshot; `changed()` on the receiver waits for the next one.
    pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
        self.latest.clone()
    }

    pub fn latest(&self) -> StatusSnapshot {
        self.latest.borrow().clone()
    }

    /// Every snapshot from now on. Slow observers lag, the loop never waits.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.feed.subscribe()
    }
}

pub fn command_channel() -> (mpsc::Sender<LoopCommand>, mpsc::Receiver<LoopCommand>) {
    mpsc::channel(COMMAND_CAPACITY)
}

/// Base64 PNG of the working-resolution frame for HUD observers.
pub fn encode_preview(preview: &GrayImage) -> Option<String> {
    let mut png = Vec::new();
    match preview.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png) {
        Ok(()) => Some(base64::engine::general_purpose::STANDARD.encode(&png)),
        Err(e) => {
            tracing::warn!(error = %e, "preview encode failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_both_halves() {
        let (bus, feed) = EventBus::new(StatusSnapshot::idle("s"));
        let mut every = feed.subscribe();
        let mut latest = feed.status();

        let mut snap = StatusSnapshot::idle("s");
        snap.tick = 7;
        snap.loop_state = LoopState::Running;
        bus.publish(snap.clone());

        assert_eq!(every.recv().await.unwrap().tick, 7);
        latest.changed().await.unwrap();
        assert_eq!(latest.borrow().loop_state, LoopState::Running);
        assert_eq!(feed.latest(), snap);
    }

    #[test]
    fn snapshot_serializes_without_preview() {
        let json = serde_json::to_value(StatusSnapshot::idle("abc")).unwrap();
        assert_eq!(json["session_id"], "abc");
        assert_eq!(json["loop_state"]["state"], "idle");
        assert!(json.get("preview_png_base64").is_none());
    }

    #[test]
    fn preview_is_base64_png() {
        let b64 = encode_preview(&GrayImage::new(4, 4)).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD.decode(b64).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");
    }
}
