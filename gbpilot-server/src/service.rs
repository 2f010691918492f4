//! gbpilot service core logic.
//!
//! Owns the listening socket, the single active emulator session, the
//! capture chain and the decision engine.
//!
//! ```text
//!  accept loop ──► Session ──► reader loop ──► decision cycle (one at a time)
//!       │                          │                 │
//!       │                          │                 ├─► capture / analyze
//!       │                          │                 ├─► DecisionEngine / FallbackPolicy
//!       │                          │                 └─► SessionSender ──► writer task ──► socket
//!       └── new client cancels the previous session
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gbpilot_core::capture::{CaptureChain, CaptureFrame};
use gbpilot_core::decision::{
    DecisionEngine, DecisionOracle, DecisionOutcome, FallbackPolicy, TimingModel,
};
use gbpilot_core::narration::{self, LogNarrator, NarrationKind, NarrationQueue};
use gbpilot_core::network::{self, ReadEvent, Session, SessionSender};
use gbpilot_core::protocol::{
    ButtonCommand, EnhancedScreenshotReport, Inbound, Outbound, RawState, ScreenshotReport,
};
use gbpilot_core::state::{GameState, GameStateTracker, SessionPhase};
use gbpilot_core::video::{FramePayload, SegmentAnalysis, VideoAnalyzer};
use gbpilot_core::PilotError;

use crate::config::PilotConfig;

type SharedConfig = watch::Receiver<Arc<PilotConfig>>;

// ── PilotService ─────────────────────────────────────────────────

/// The top-level gbpilot service.
pub struct PilotService {
    config: SharedConfig,
    oracle: Arc<dyn DecisionOracle>,
    capture: Option<Arc<CaptureChain>>,
    shutdown: CancellationToken,
}

impl PilotService {
    /// Create a service reading configuration snapshots from `config`.
    pub fn new(config: SharedConfig, oracle: Arc<dyn DecisionOracle>) -> Self {
        Self {
            config,
            oracle,
            capture: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Service with a fixed configuration.
    pub fn with_config(config: PilotConfig, oracle: Arc<dyn DecisionOracle>) -> Self {
        let (_tx, rx) = watch::channel(Arc::new(config));
        Self::new(rx, oracle)
    }

    /// Use an already-initialized capture chain instead of building one
    /// from `capture.type`.
    pub fn with_capture(mut self, capture: Arc<CaptureChain>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Obtain a handle that stops the service from another task.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Bind the configured address and run until stopped.
    ///
    /// Bind failure (after one retry) is the only fatal error.
    pub async fn run(&self) -> Result<(), PilotError> {
        let config = self.config.borrow().clone();
        let addr = config
            .bind_addr()
            .map_err(|e| PilotError::Other(format!("invalid listen address: {e}")))?;
        let listener = network::bind_listener(addr, config.bind_retry()).await?;
        self.run_with_listener(listener).await
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), PilotError> {
        let config = self.config.borrow().clone();
        let shutdown_timeout = config.shutdown_timeout();
        if let Ok(addr) = listener.local_addr() {
            info!("gbpilot listening on {addr}");
        }

        let capture = match &self.capture {
            Some(capture) => Arc::clone(capture),
            None => Arc::new(build_capture(&config).await),
        };
        info!(backend = capture.active_name(), "capture ready");

        let narrator_cancel = self.shutdown.child_token();
        let (narration, narrator) = if config.narration.enabled {
            let (queue, handle) =
                narration::spawn_narrator(LogNarrator, config.narration.queue_capacity, narrator_cancel.clone());
            (Some(queue), Some(handle))
        } else {
            (None, None)
        };

        let pilot = Arc::new(Mutex::new(Pilot {
            engine: DecisionEngine::new(Arc::clone(&self.oracle), config.to_retry_policy()),
            tracker: GameStateTracker::new(),
            session: 0,
        }));

        let session_ids = AtomicU64::new(0);
        let mut current: Option<(CancellationToken, JoinHandle<()>)> = None;

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => result,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept error: {e}");
                    continue;
                }
            };

            if let Some((token, mut handle)) = current.take() {
                info!(%peer, "new connection supersedes the active session");
                token.cancel();
                join_bounded(&mut handle, shutdown_timeout, "session").await;
            }

            let id = session_ids.fetch_add(1, Ordering::Relaxed) + 1;
            info!(session = id, %peer, "emulator connected");
            if let Some(n) = &narration {
                n.say(NarrationKind::Status, format!("Emulator connected from {peer}"));
            }

            let session = Session::new(stream, peer, id, &self.shutdown);
            let token = session.cancel_token();
            let ctx = SessionContext {
                config: self.config.clone(),
                capture: Arc::clone(&capture),
                pilot: Arc::clone(&pilot),
                session: id,
                narration: narration.clone(),
                in_flight: Arc::new(AtomicBool::new(false)),
            };
            current = Some((token, tokio::spawn(run_session(session, ctx))));
        }

        info!("shutting down");
        drop(listener);
        if let Some((token, mut handle)) = current.take() {
            token.cancel();
            join_bounded(&mut handle, shutdown_timeout, "session").await;
        }
        if tokio::time::timeout(shutdown_timeout, capture.shutdown()).await.is_err() {
            warn!("capture shutdown did not finish in time");
        }
        narrator_cancel.cancel();
        if let Some(handle) = narrator {
            narration::join_narrator(handle, shutdown_timeout).await;
        }
        info!("gbpilot service stopped");
        Ok(())
    }
}

async fn build_capture(config: &PilotConfig) -> CaptureChain {
    let mut chain = match CaptureChain::from_config(&config.to_capture_config()) {
        Ok(chain) => chain,
        Err(e) => {
            warn!("{e}; using emulator screenshots");
            CaptureChain::emulator_only()
        }
    };
    chain.initialize().await;
    chain
}

/// Wait up to `timeout` for a task, aborting it if it overruns.
async fn join_bounded(handle: &mut JoinHandle<()>, timeout: Duration, what: &str) {
    match tokio::time::timeout(timeout, &mut *handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => error!("{what} task panicked: {e}"),
        Ok(Err(_)) => {}
        Err(_) => {
            warn!("{what} did not stop within {timeout:?}; aborting");
            handle.abort();
        }
    }
}

/// Sleep unless `cancel` fires first. Returns `false` when cancelled.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

// ── Session handling ─────────────────────────────────────────────

/// State that outlives a single session.
struct Pilot {
    engine: DecisionEngine,
    tracker: GameStateTracker,
    /// Session the tracker history belongs to.
    session: u64,
}

impl Pilot {
    /// A fresh emulator connection starts a fresh position history.
    fn enter_session(&mut self, session: u64) {
        if self.session != session {
            self.session = session;
            self.tracker = GameStateTracker::new();
        }
    }
}

#[derive(Clone)]
struct SessionContext {
    config: SharedConfig,
    capture: Arc<CaptureChain>,
    pilot: Arc<Mutex<Pilot>>,
    session: u64,
    narration: Option<NarrationQueue>,
    in_flight: Arc<AtomicBool>,
}

impl SessionContext {
    fn narrate(&self, kind: NarrationKind, text: impl Into<String>) {
        if let Some(n) = &self.narration {
            n.say(kind, text);
        }
    }
}

/// What started a decision cycle.
enum Trigger {
    Screenshot(ScreenshotReport),
    Enhanced(EnhancedScreenshotReport),
    /// State after a continuous recording window.
    Recorded(RawState),
}

impl Trigger {
    fn raw_state(&self) -> &RawState {
        match self {
            Trigger::Screenshot(r) => &r.state,
            Trigger::Enhanced(r) => &r.state,
            Trigger::Recorded(s) => s,
        }
    }
}

/// Clears the in-flight flag when dropped.
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then(|| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The running decision cycle; aborted when dropped, so tearing down a
/// session never leaves a cycle holding the pilot.
struct CycleTask(JoinHandle<()>);

impl CycleTask {
    async fn join(mut self, timeout: Duration) {
        join_bounded(&mut self.0, timeout, "decision cycle").await;
    }
}

impl Drop for CycleTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_session(mut session: Session, ctx: SessionContext) {
    let id = session.id();
    let tx = session.sender();
    let cancel = session.cancel_token();
    let mut phase = SessionPhase::default();
    let mut cycle: Option<CycleTask> = None;
    if let Err(e) = phase.accept() {
        warn!(session = id, "{e}");
    }

    loop {
        let poll = ctx.config.borrow().poll_interval();
        let message = match session.next_event(poll).await {
            ReadEvent::Message(message) => message,
            ReadEvent::Idle => continue,
            ReadEvent::Closed => break,
            ReadEvent::Failed(e) => {
                warn!(session = id, "read error: {e}");
                break;
            }
        };
        debug!(session = id, kind = message.kind(), "received");

        let trigger = match message {
            Inbound::Ready => {
                let script = ctx.config.borrow().game_config_script();
                if let Err(e) = tx.send(script.into_message()).await {
                    warn!(session = id, "could not send game config: {e}");
                    break;
                }
                match phase.config_sent() {
                    Ok(()) => info!(session = id, "game config sent"),
                    Err(e) => warn!(session = id, "{e}"),
                }
                continue;
            }
            Inbound::ConfigLoaded => {
                if let Err(e) = phase.config_loaded() {
                    warn!(session = id, "{e}");
                }
                info!(session = id, "emulator script configured; requesting first screenshot");
                ctx.narrate(NarrationKind::Status, "Emulator ready");
                if tx.send(Outbound::RequestScreenshot).await.is_err() {
                    break;
                }
                continue;
            }
            Inbound::ConfigError(msg) => {
                error!(session = id, "emulator rejected game config: {msg}");
                ctx.narrate(NarrationKind::Status, format!("Emulator config error: {msg}"));
                continue;
            }
            Inbound::Screenshot(report) => Trigger::Screenshot(report),
            Inbound::EnhancedScreenshot(report) => Trigger::Enhanced(report),
            Inbound::State(raw) => Trigger::Recorded(raw),
        };

        // Frames only drive decisions once the script has loaded its config.
        if !phase.is_playing() {
            warn!(session = id, %phase, "frame report before config_loaded; ignoring");
            continue;
        }
        spawn_cycle(&ctx, &tx, &cancel, &mut cycle, trigger);
    }

    if phase.begin_disconnect().is_err() {
        phase.force_disconnect();
    }
    cancel.cancel();
    let timeout = ctx.config.borrow().shutdown_timeout();
    if let Some(task) = cycle.take() {
        task.join(timeout).await;
    }
    if ctx.capture.stop_recording().await.is_some() {
        debug!(session = id, "discarded in-progress recording");
    }
    session.close(timeout).await;
    if phase.finish_disconnect().is_err() {
        phase.force_disconnect();
    }
    info!(session = id, "emulator disconnected; waiting for reconnect");
    ctx.narrate(NarrationKind::Status, "Emulator disconnected");
}

fn spawn_cycle(
    ctx: &SessionContext,
    tx: &SessionSender,
    cancel: &CancellationToken,
    slot: &mut Option<CycleTask>,
    trigger: Trigger,
) {
    let Some(guard) = InFlight::acquire(&ctx.in_flight) else {
        debug!("decision in progress; ignoring trigger");
        return;
    };
    let ctx = ctx.clone();
    let tx = tx.clone();
    let cancel = cancel.clone();
    *slot = Some(CycleTask(tokio::spawn(async move {
        decision_cycle(ctx, tx, cancel, trigger, guard).await;
    })));
}

// ── Decision cycle ───────────────────────────────────────────────

async fn decision_cycle(
    ctx: SessionContext,
    tx: SessionSender,
    cancel: CancellationToken,
    trigger: Trigger,
    guard: InFlight,
) {
    // One snapshot for the whole cycle; reloads apply to the next one.
    let config = ctx.config.borrow().clone();
    let timing = TimingModel::new(config.to_timing_config());
    let analyzer = VideoAnalyzer::new(config.to_analyzer_config());
    let fallback = FallbackPolicy::new(config.to_fallback_config());

    let mut pilot = tokio::select! {
        _ = cancel.cancelled() => return,
        pilot = ctx.pilot.lock() => pilot,
    };
    pilot.enter_session(ctx.session);
    let parsed = GameState::from_raw(trigger.raw_state());
    if !parsed.is_clean() {
        warn!(fields = ?parsed.invalid_fields, "state fields defaulted to 0");
    }
    let state = parsed.state;
    let update = pilot.tracker.update(state);
    if let Some(t) = update.map_transition {
        info!(from = t.from, to = t.to, "map changed");
        ctx.narrate(NarrationKind::MapChange, format!("Entered map {} from map {}", t.to, t.from));
    }

    let gathered = gather_payload(&ctx, &config, &analyzer, &trigger).await;
    let Some((payload, analysis)) = gathered else {
        warn!("no frame available; asking for a new screenshot");
        drop(pilot);
        drop(guard);
        let wait = timing.config().stabilization_base;
        if sleep_or_cancel(wait, &cancel).await {
            if let Err(e) = tx.send(Outbound::RequestScreenshot).await {
                warn!("could not request a new screenshot ({e})");
            }
        }
        return;
    };
    if let Some(dir) = config.artifact_dir() {
        save_artifacts(&dir, &payload).await;
    }

    let Pilot { engine, tracker, .. } = &mut *pilot;
    engine.set_policy(config.to_retry_policy());

    let command = if fallback.applies(engine.consecutive_failures(), engine.last_was_fallback()) {
        let choice = fallback.choose(engine.recent_actions(), update.pattern, state.direction);
        info!(reason = %choice.reason, buttons = %choice.command.describe(), "fallback action");
        ctx.narrate(
            NarrationKind::Fallback,
            format!("Playing it safe: {} ({})", choice.command.describe(), choice.reason),
        );
        engine.record_fallback(&choice.command);
        Some(choice.command)
    } else {
        let mut situation = tracker.summary();
        if let Some(analysis) = &analysis {
            situation.push_str("\nLast action clip: ");
            situation.push_str(&analysis.summary());
        }
        if let Some(t) = update.map_transition {
            situation.push_str(&format!("\nJust moved from map {} to map {}.", t.from, t.to));
        }
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("session ended during decision; abandoning cycle");
                return;
            }
            outcome = engine.decide(&payload, Some(&state), &situation) => outcome,
        };
        match outcome {
            DecisionOutcome::Success { command, text, .. } => {
                if !text.trim().is_empty() {
                    ctx.narrate(NarrationKind::Decision, text);
                }
                Some(command)
            }
            DecisionOutcome::Failed { class, error, attempts } => {
                ctx.narrate(
                    NarrationKind::Failure,
                    format!("Decision failed after {attempts} call(s) ({class}): {error}"),
                );
                None
            }
        }
    };
    drop(pilot);

    let recording = match &command {
        Some(_) if config.capture.continuous_recording && ctx.capture.supports_recording() => {
            ctx.capture.start_recording().await
        }
        _ => false,
    };

    if let Some(command) = &command {
        if let Err(e) = tx.send(Outbound::Buttons(command.clone())).await {
            error!("button dispatch failed ({e}); marking session disconnected");
            cancel.cancel();
            return;
        }
        info!(buttons = %command.describe(), wire = %command.encode(), "buttons dispatched");
    }

    let (wait, next) = next_request(&timing, command.as_ref(), recording);
    if !sleep_or_cancel(wait, &cancel).await {
        return;
    }
    // Release before asking so the reply can start the next cycle.
    drop(guard);
    if let Err(e) = tx.send(next).await {
        debug!("could not request next frame: {e}");
    }
}

/// How long to wait after a command, and what to ask for next.
fn next_request(timing: &TimingModel, command: Option<&ButtonCommand>, recording: bool) -> (Duration, Outbound) {
    match command {
        Some(cmd) if recording => (timing.expected_recording_duration(cmd), Outbound::RequestState),
        Some(cmd) => (timing.settle_wait(cmd), Outbound::RequestScreenshot),
        None => {
            let cfg = timing.config();
            (
                (cfg.stabilization_base + cfg.cooldown).min(cfg.safety_max),
                Outbound::RequestScreenshot,
            )
        }
    }
}

/// Collect the frames for one decision, degrading from video to pairs to
/// single screenshots as sources fail.
async fn gather_payload(
    ctx: &SessionContext,
    config: &PilotConfig,
    analyzer: &VideoAnalyzer,
    trigger: &Trigger,
) -> Option<(FramePayload, Option<SegmentAnalysis>)> {
    let capture = &ctx.capture;
    let enhance = |frame: CaptureFrame| capture.enhance_frame(&frame, &config.enhance);

    match trigger {
        Trigger::Recorded(_) => {
            if let Some(segment) = capture.stop_recording().await.filter(|s| !s.is_empty()) {
                let analysis = analyzer.analyze(&segment);
                if let Some(payload) = analyzer.payload(&segment) {
                    let payload = match payload {
                        FramePayload::Single(frame) => FramePayload::Single(enhance(frame)),
                        other => other,
                    };
                    return Some((payload, Some(analysis)));
                }
            }
            warn!("no recorded segment; falling back to a single screenshot");
            capture.capture_frame().await.map(|f| (FramePayload::Single(enhance(f)), None))
        }
        Trigger::Enhanced(report) => {
            capture.point_at(&report.path);
            let emulator = capture.emulator();
            match (emulator.load(&report.previous_path).await, emulator.load(&report.path).await) {
                (Ok(before), Ok(after)) => Some((
                    FramePayload::Pair {
                        before: enhance(before),
                        after: enhance(after),
                    },
                    None,
                )),
                (Err(e), Ok(after)) => {
                    warn!(path = %report.previous_path.display(), "previous screenshot unreadable: {e}");
                    Some((FramePayload::Single(enhance(after)), None))
                }
                (_, Err(e)) => {
                    warn!(path = %report.path.display(), "screenshot unreadable: {e}");
                    capture.capture_frame().await.map(|f| (FramePayload::Single(enhance(f)), None))
                }
            }
        }
        Trigger::Screenshot(report) => {
            capture.point_at(&report.path);
            capture.capture_frame().await.map(|f| (FramePayload::Single(enhance(f)), None))
        }
    }
}

async fn save_artifacts(dir: &Path, payload: &FramePayload) {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        debug!(dir = %dir.display(), "artifact dir unavailable: {e}");
        return;
    }
    let latest = payload.latest();
    let stem = format!("frame_{:08}", latest.sequence);
    if let Err(e) = latest.save_png(&dir.join(format!("{stem}.png"))) {
        debug!("could not save frame artifact: {e}");
    }
    if let FramePayload::Animated { clip, .. } = payload {
        if let Err(e) = tokio::fs::write(dir.join(format!("{stem}.gif")), &clip.bytes).await {
            debug!("could not save gif artifact: {e}");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
