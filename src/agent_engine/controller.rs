// Control surface: owns the single control thread and the session's channels.
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch};

use crate::agent_engine::engine::{AutoplayLoop, LoopExit, PlatformHandles, Session};
use crate::agent_engine::event_bus::{command_channel, EventBus, LoopCommand, StatusFeed, StatusSnapshot};
use crate::agent_engine::state::{GoalHint, LoopState, StopReason};
use crate::config::AppConfig;
use crate::errors::{AutoplayError, AutoplayResult};
use crate::executor::input::{DisabledInput, EnigoBackend, InputBackend};
use crate::executor::safety::{AlwaysFocused, FocusProbe, XcapFocusProbe};
use crate::perception::calibration::Calibration;
use crate::perception::ocr::TesseractCli;
use crate::perception::screenshot::XcapFrameSource;
use crate::perception::traits::{TextRecognizer, WindowHandle};

// ── Platform ──────────────────────────────────────────────────────────────────

/// Opens the OS handles for one run. Called on the control thread, so the
/// handles themselves never cross threads.
pub trait Platform: Send + Sync + 'static {
    fn open(&self, session: &Session, config: &AppConfig) -> AutoplayResult<PlatformHandles>;
}

/// xcap capture, enigo input and the tesseract CLI.
pub struct DesktopPlatform;

impl Platform for DesktopPlatform {
    fn open(&self, session: &Session, config: &AppConfig) -> AutoplayResult<PlatformHandles> {
        let (input, focus): (Box<dyn InputBackend>, Box<dyn FocusProbe>) = if session.dry_run {
            (Box::new(DisabledInput), Box::new(AlwaysFocused))
        } else {
            (Box::new(EnigoBackend::new()?), Box::new(XcapFocusProbe))
        };
        let recognizer: Option<Box<dyn TextRecognizer>> = config.perception.ocr_enabled.then(|| {
            Box::new(TesseractCli::new(&config.perception.tesseract_path, &config.perception.ocr_lang))
                as Box<dyn TextRecognizer>
        });
        tracing::info!(
            dry_run = session.dry_run,
            ocr = recognizer.is_some(),
            "platform handles opened"
        );
        Ok(PlatformHandles {
            frames: Box::new(XcapFrameSource::new()),
            input,
            focus,
            recognizer,
        })
    }
}

// ── Controller ────────────────────────────────────────────────────────────────

struct ActiveRun {
    session: Session,
    commands: mpsc::Sender<LoopCommand>,
    thread: JoinHandle<LoopExit>,
}

pub struct AutoplayController {
    config: AppConfig,
    calibration: Arc<Calibration>,
    platform: Arc<dyn Platform>,
    active: Option<ActiveRun>,
    feed: Option<StatusFeed>,
}

impl AutoplayController {
    pub fn new(config: AppConfig, calibration: Arc<Calibration>, platform: Arc<dyn Platform>) -> Self {
        Self {
            config,
            calibration,
            platform,
            active: None,
            feed: None,
        }
    }

    /// Spawn the control thread for a new session. Only one run may be
    /// active at a time.
    pub fn start(&mut self, window: WindowHandle, goal: GoalHint) -> AutoplayResult<Session> {
        if self.is_running() {
            let id = self.active.as_ref().map(|r| r.session.id.clone()).unwrap_or_default();
            return Err(AutoplayError::Config(format!("session {id} is already running")));
        }

        let session = Session::new(window, goal, self.config.session.dry_run);
        let (bus, feed) = EventBus::new(StatusSnapshot::idle(&session.id));
        let (tx, rx) = command_channel();

        let config = self.config.clone();
        let calibration = Arc::clone(&self.calibration);
        let platform = Arc::clone(&self.platform);
        let thread_session = session.clone();
        let thread = std::thread::Builder::new()
            .name("autoplay-control".into())
            .spawn(move || control_thread(config, calibration, platform, thread_session, bus, rx))?;

        tracing::info!(session = %session.id, window = %session.window, goal = %session.goal, "session started");
        if session.focus_unguarded() {
            tracing::warn!(
                session = %session.id,
                "no target window configured; input goes to whichever window has focus"
            );
        }
        self.active = Some(ActiveRun {
            session: session.clone(),
            commands: tx,
            thread,
        });
        self.feed = Some(feed);
        Ok(session)
    }

    pub fn pause(&self) -> AutoplayResult<()> {
        self.send(LoopCommand::Pause)
    }

    pub fn resume(&self) -> AutoplayResult<()> {
        self.send(LoopCommand::Resume)
    }

    pub fn stop(&self) -> AutoplayResult<()> {
        self.send(LoopCommand::Stop)
    }

    fn send(&self, cmd: LoopCommand) -> AutoplayResult<()> {
        let run = self
            .active
            .as_ref()
            .ok_or_else(|| AutoplayError::Config("no autoplay session started".into()))?;
        match run.commands.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(?cmd, session = %run.session.id, "loop already exited");
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(AutoplayError::Config("command queue is full".into())),
        }
    }

    /// Latest snapshot of the current or most recent session.
    pub fn status(&self) -> Option<watch::Receiver<StatusSnapshot>> {
        self.feed.as_ref().map(StatusFeed::status)
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<StatusSnapshot>> {
        self.feed.as_ref().map(StatusFeed::subscribe)
    }

    pub fn session(&self) -> Option<&Session> {
        self.active.as_ref().map(|r| &r.session)
    }

    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|r| !r.thread.is_finished())
    }

    /// Wait for the active run to end.
    pub async fn join(&mut self) -> AutoplayResult<LoopExit> {
        let run = self
            .active
            .take()
            .ok_or_else(|| AutoplayError::Config("no autoplay session started".into()))?;
        let joined = tokio::task::spawn_blocking(move || run.thread.join())
            .await
            .map_err(|_| AutoplayError::Cancelled)?;
        joined.map_err(|_| {
            tracing::error!("control thread panicked");
            AutoplayError::Cancelled
        })
    }
}

fn control_thread(
    config: AppConfig,
    calibration: Arc<Calibration>,
    platform: Arc<dyn Platform>,
    session: Session,
    bus: EventBus,
    commands: mpsc::Receiver<LoopCommand>,
) -> LoopExit {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => return abort_start(&bus, &session, format!("control runtime: {e}")),
    };
    let handles = match platform.open(&session, &config) {
        Ok(handles) => handles,
        Err(e) => return abort_start(&bus, &session, e.to_string()),
    };
    runtime.block_on(async move {
        AutoplayLoop::new(&config, calibration, session, handles, bus)
            .run(commands)
            .await
    })
}

fn abort_start(bus: &EventBus, session: &Session, message: String) -> LoopExit {
    tracing::error!(session = %session.id, error = %message, "session failed to start");
    let reason = StopReason::Fatal(message);
    let mut snapshot = StatusSnapshot::idle(&session.id);
    snapshot.loop_state = LoopState::Stopped(reason.clone());
    bus.publish(snapshot);
    LoopExit {
        session_id: session.id.clone(),
        ticks: 0,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::perception::types::Side;
    use crate::test_support::{self, FocusSwitch, RecordingInput, ScriptedFrames};

    struct TestPlatform {
        frames: usize,
        fail: Option<&'static str>,
    }

    impl Platform for TestPlatform {
        fn open(&self, _session: &Session, _config: &AppConfig) -> AutoplayResult<PlatformHandles> {
            if let Some(msg) = self.fail {
                return Err(AutoplayError::PermissionDenied(msg.into()));
            }
            let mut frames = ScriptedFrames::new();
            for _ in 0..self.frames {
                frames = frames.then_frame(test_support::blank());
            }
            Ok(PlatformHandles {
                frames: Box::new(frames),
                input: Box::new(RecordingInput::new()),
                focus: Box::new(FocusSwitch::focused()),
                recognizer: None,
            })
        }
    }

    fn controller(platform: TestPlatform) -> AutoplayController {
        AutoplayController::new(AppConfig::default(), test_support::calibration(), Arc::new(platform))
    }

    async fn wait_for_state(ctl: &AutoplayController, want: fn(&LoopState) -> bool) {
        let mut rx = ctl.status().unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| want(&s.loop_state)))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn start_pause_resume_stop() {
        let mut ctl = controller(TestPlatform { frames: 200, fail: None });
        let session = ctl.start(WindowHandle::Keyword("game".into()), GoalHint::Explore).unwrap();
        wait_for_state(&ctl, |s| *s == LoopState::Running).await;
        assert!(ctl.is_running());

        let second = ctl.start(WindowHandle::PrimaryMonitor, GoalHint::Explore);
        assert!(matches!(second, Err(AutoplayError::Config(_))));

        ctl.pause().unwrap();
        wait_for_state(&ctl, |s| matches!(s, LoopState::Paused(_))).await;
        ctl.resume().unwrap();
        wait_for_state(&ctl, |s| *s == LoopState::Running).await;
        ctl.stop().unwrap();

        let exit = ctl.join().await.unwrap();
        assert_eq!(exit.session_id, session.id);
        assert_eq!(exit.reason, StopReason::Operator);
        assert!(!ctl.is_running());
        assert!(ctl.status().unwrap().borrow().loop_state.is_stopped());
    }

    #[tokio::test]
    async fn open_failure_is_reported_as_fatal_stop() {
        let mut ctl = controller(TestPlatform {
            frames: 0,
            fail: Some("accessibility not granted"),
        });
        ctl.start(WindowHandle::PrimaryMonitor, GoalHint::Explore).unwrap();
        let exit = ctl.join().await.unwrap();
        assert_eq!(exit.ticks, 0);
        assert!(matches!(exit.reason, StopReason::Fatal(ref m) if m.contains("accessibility")));
        assert!(ctl.status().unwrap().borrow().loop_state.is_stopped());
    }

    #[tokio::test]
    async fn closed_window_ends_the_run_and_allows_a_new_one() {
        let mut ctl = controller(TestPlatform { frames: 2, fail: None });
        ctl.start(WindowHandle::Keyword("game".into()), GoalHint::Explore).unwrap();
        let exit = ctl.join().await.unwrap();
        assert_eq!(exit.ticks, 3);
        assert!(matches!(exit.reason, StopReason::Fatal(ref m) if m.contains("game")));

        // a joined run no longer accepts commands
        assert!(ctl.stop().is_err());
        let next = ctl.start(WindowHandle::Keyword("game".into()), GoalHint::FollowWall(Side::Right));
        assert!(next.is_ok());
        ctl.stop().unwrap();
        ctl.join().await.unwrap();
    }

    #[test]
    fn whole_screen_live_sessions_are_unguarded() {
        assert!(Session::new(WindowHandle::PrimaryMonitor, GoalHint::Explore, false).focus_unguarded());
        assert!(!Session::new(WindowHandle::PrimaryMonitor, GoalHint::Explore, true).focus_unguarded());
        assert!(!Session::new(WindowHandle::Keyword("game".into()), GoalHint::Explore, false).focus_unguarded());
    }

    #[tokio::test]
    async fn commands_without_a_session_are_rejected() {
        let mut ctl = controller(TestPlatform { frames: 0, fail: None });
        assert!(ctl.pause().is_err());
        assert!(ctl.status().is_none());
        assert!(ctl.join().await.is_err());
    }
}
