//! The motion protocol: positioner events, move bookkeeping, and a soft
//! positioner with simulated motion.
//!
//! [`PositionerCore`] owns the event machinery every positioner shares:
//! readback/start/done channels plus an internal per-request done channel
//! that carries exactly one move's completion. Concrete positioners embed a
//! core, command their hardware, and report through
//! [`PositionerCore::set_position`] and [`PositionerCore::done_moving`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{HalError, Result};
use crate::object::{Event, EventBus, EventCallback, SubscriptionId};
use crate::status::MoveStatus;

/// Fired on every position update. Default channel.
pub const SUB_READBACK: &str = "readback";
/// Fired when a positioner starts moving.
pub const SUB_START: &str = "start_moving";
/// Fired when a positioner stops moving successfully.
pub const SUB_DONE: &str = "done_moving";
/// Internal single-request completion channel, reset after every move.
pub(crate) const SUB_REQ_DONE: &str = "_req_done";

pub const POSITIONER_EVENTS: &[&str] = &[SUB_READBACK, SUB_START, SUB_DONE, SUB_REQ_DONE];

/// Options for one move request.
#[derive(Default)]
pub struct MoveOptions {
    pub wait: bool,
    pub timeout: Option<Duration>,
    pub moved_cb: Option<Box<dyn FnOnce() + Send>>,
}

impl MoveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the move resolves; a failed move escalates to `stop`.
    pub fn wait(mut self) -> Self {
        self.wait = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Callback fired once when the move completes, after the status
    /// resolves.
    pub fn on_complete(mut self, cb: impl FnOnce() + Send + 'static) -> Self {
        self.moved_cb = Some(Box::new(cb));
        self
    }
}

// =============================================================================
// PositionerCore
// =============================================================================

struct CoreState {
    position: f64,
    target: f64,
    moving: bool,
}

/// Shared positioner state machine. `set_position` is the only path that
/// mutates the readback, so every consumer observes position changes through
/// the readback event.
pub struct PositionerCore {
    events: EventBus,
    state: Mutex<CoreState>,
}

impl PositionerCore {
    pub fn new(name: impl Into<String>, initial: f64) -> Self {
        PositionerCore {
            events: EventBus::new(name, POSITIONER_EVENTS, Some(SUB_READBACK)),
            state: Mutex::new(CoreState {
                position: initial,
                target: initial,
                moving: false,
            }),
        }
    }

    pub fn position(&self) -> f64 {
        self.state.lock().position
    }

    pub fn target(&self) -> f64 {
        self.state.lock().target
    }

    pub fn moving(&self) -> bool {
        self.state.lock().moving
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Update the readback and fire the readback event.
    pub fn set_position(&self, value: f64) {
        let old = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.position, value)
        };
        let _ = self.events.run_subs(
            Event::new(SUB_READBACK)
                .with_value(value.into())
                .with_old_value(old.into()),
        );
    }

    /// Record a newly commanded move and fire the start event.
    pub fn start_move(&self, target: f64) {
        {
            let mut state = self.state.lock();
            state.target = target;
            state.moving = true;
        }
        let _ = self
            .events
            .run_subs(Event::new(SUB_START).with_value(target.into()));
    }

    /// Report the end of motion. The done event fires only for successful
    /// stops; the per-request channel fires with the outcome either way and
    /// is then reset so a stale subscriber can never see the next move.
    pub fn done_moving(&self, success: bool) {
        self.state.lock().moving = false;
        if success {
            let _ = self.events.run_subs(Event::new(SUB_DONE).with_success(true));
        }
        let _ = self
            .events
            .run_subs(Event::new(SUB_REQ_DONE).with_success(success));
        if let Err(err) = self.events.reset(SUB_REQ_DONE) {
            warn!(error = %err, "failed to reset move-completion channel");
        }
    }

    /// Arm a move: clear the per-request channel, build the status, and wire
    /// its completion to the channel. The caller commands motion afterwards.
    pub fn setup_move(
        self: &Arc<Self>,
        obj: impl Into<String>,
        target: f64,
        timeout: Option<Duration>,
        settle_time: Duration,
    ) -> Result<MoveStatus> {
        self.events.reset(SUB_REQ_DONE)?;
        let status = MoveStatus::new(obj, vec![target], timeout, settle_time);
        let core = self.clone();
        let handle = status.clone();
        self.events.subscribe(
            Arc::new(move |event: &Event| {
                let success = event.success.unwrap_or(true);
                handle.complete(success, Some(vec![core.position()]));
            }),
            Some(SUB_REQ_DONE),
            false,
        )?;
        Ok(status)
    }
}

impl std::fmt::Debug for PositionerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PositionerCore")
            .field("position", &state.position)
            .field("target", &state.target)
            .field("moving", &state.moving)
            .finish()
    }
}

// =============================================================================
// Positioner trait
// =============================================================================

/// Anything that can be commanded to a scalar position and reports motion
/// through the positioner event channels.
pub trait Positioner: Send + Sync {
    fn name(&self) -> String;

    /// Command a move. Limit checking happens before any hardware is
    /// touched, so an out-of-limits request leaves the positioner untouched.
    fn move_to(&self, position: f64, opts: MoveOptions) -> Result<MoveStatus>;

    /// Current readback position.
    fn position(&self) -> f64;

    /// Last commanded target.
    fn target(&self) -> f64;

    fn moving(&self) -> bool;

    fn stop(&self) -> Result<()>;

    /// Validate a candidate position without moving.
    fn check_value(&self, position: f64) -> Result<()>;

    fn settle_time(&self) -> Duration {
        Duration::ZERO
    }

    /// Engineering units of the position value.
    fn egu(&self) -> String {
        String::new()
    }

    /// Soft travel limits, when the positioner has any.
    fn limits(&self) -> Option<(f64, f64)> {
        None
    }

    fn low_limit(&self) -> Option<f64> {
        self.limits().map(|(lo, _)| lo)
    }

    fn high_limit(&self) -> Option<f64> {
        self.limits().map(|(_, hi)| hi)
    }

    fn subscribe_readback(&self, cb: EventCallback, run: bool) -> Result<SubscriptionId>;

    fn clear_sub(&self, cb: &EventCallback);
}

/// Limit check shared by positioner implementations.
pub fn check_limits(
    name: &str,
    position: f64,
    limits: Option<(f64, f64)>,
) -> Result<()> {
    let Some((low, high)) = limits else { return Ok(()) };
    if low >= high {
        return Ok(());
    }
    if position < low || position > high {
        return Err(HalError::LimitViolation {
            name: name.to_string(),
            value: position,
            low,
            high,
        });
    }
    Ok(())
}

// =============================================================================
// SoftPositioner
// =============================================================================

/// A positioner with no hardware behind it. Moves complete after an optional
/// simulated travel delay on a worker thread, or synchronously when the
/// delay is zero.
pub struct SoftPositioner {
    core: Arc<PositionerCore>,
    name: String,
    limits: Option<(f64, f64)>,
    egu: String,
    settle_time: Duration,
    delay: Duration,
    /// Bumped by `stop` and each new move; a worker only completes its move
    /// if its generation is still current.
    generation: Arc<AtomicU64>,
}

impl SoftPositioner {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        SoftPositioner {
            core: Arc::new(PositionerCore::new(name.clone(), 0.0)),
            name,
            limits: None,
            egu: String::new(),
            settle_time: Duration::ZERO,
            delay: Duration::ZERO,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some((low, high));
        self
    }

    pub fn with_egu(mut self, egu: impl Into<String>) -> Self {
        self.egu = egu.into();
        self
    }

    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Simulated travel time per move.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_initial_position(self, position: f64) -> Self {
        self.core.set_position(position);
        self
    }

    pub fn core(&self) -> &Arc<PositionerCore> {
        &self.core
    }
}

impl Positioner for SoftPositioner {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn move_to(&self, position: f64, opts: MoveOptions) -> Result<MoveStatus> {
        self.check_value(position)?;
        // A new command supersedes an in-flight move: fail the old request
        // before arming the new one.
        if self.core.moving() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.core.done_moving(false);
        }
        let status = self
            .core
            .setup_move(self.name.as_str(), position, opts.timeout, self.settle_time)?;
        if let Some(cb) = opts.moved_cb {
            status.add_callback(cb);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.core.start_move(position);
        debug!(positioner = %self.name, target = position, "move commanded");

        if self.delay.is_zero() {
            self.core.set_position(position);
            self.core.done_moving(true);
        } else {
            let core = self.core.clone();
            let counter = self.generation.clone();
            let delay = self.delay;
            let spawn = std::thread::Builder::new()
                .name(format!("{}-travel", self.name))
                .spawn(move || {
                    std::thread::sleep(delay);
                    if counter.load(Ordering::SeqCst) == generation {
                        core.set_position(position);
                        core.done_moving(true);
                    }
                });
            if spawn.is_err() {
                // No worker means the move can never finish on its own.
                self.core.done_moving(false);
            }
        }

        if opts.wait {
            if let Err(err) = status.wait(None) {
                warn!(positioner = %self.name, error = %err, "move failed, stopping");
                self.stop()?;
                return Err(err);
            }
        }
        Ok(status)
    }

    fn position(&self) -> f64 {
        self.core.position()
    }

    fn target(&self) -> f64 {
        self.core.target()
    }

    fn moving(&self) -> bool {
        self.core.moving()
    }

    fn stop(&self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.core.moving() {
            self.core.done_moving(false);
        }
        Ok(())
    }

    fn check_value(&self, position: f64) -> Result<()> {
        check_limits(&self.name, position, self.limits)
    }

    fn settle_time(&self) -> Duration {
        self.settle_time
    }

    fn egu(&self) -> String {
        self.egu.clone()
    }

    fn limits(&self) -> Option<(f64, f64)> {
        self.limits
    }

    fn subscribe_readback(&self, cb: EventCallback, run: bool) -> Result<SubscriptionId> {
        self.core.events().subscribe(cb, Some(SUB_READBACK), run)
    }

    fn clear_sub(&self, cb: &EventCallback) {
        self.core.events().clear_sub(cb, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn zero_delay_move_completes_synchronously() {
        let p = SoftPositioner::new("p");
        let status = p.move_to(2.5, MoveOptions::new()).unwrap();
        assert!(status.done());
        assert_eq!(status.success(), Some(true));
        assert_eq!(p.position(), 2.5);
        assert_eq!(status.finish_pos(), Some(vec![2.5]));
        assert_eq!(status.error(), Some(vec![0.0]));
        assert!(!p.moving());
    }

    #[test]
    fn delayed_move_reports_moving_then_arrives() {
        let p = SoftPositioner::new("p").with_delay(Duration::from_millis(60));
        let status = p.move_to(1.0, MoveOptions::new()).unwrap();
        assert!(p.moving());
        assert_eq!(p.target(), 1.0);
        status.wait(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(p.position(), 1.0);
        assert!(!p.moving());
    }

    #[test]
    fn limit_violation_leaves_positioner_untouched() {
        let p = SoftPositioner::new("p").with_limits(-1.0, 1.0);
        let err = p.move_to(5.0, MoveOptions::new()).unwrap_err();
        assert!(matches!(err, HalError::LimitViolation { .. }));
        assert_eq!(p.position(), 0.0);
        assert!(!p.moving());
    }

    #[test]
    fn stop_fails_the_inflight_move() {
        let p = SoftPositioner::new("p").with_delay(Duration::from_millis(200));
        let status = p.move_to(3.0, MoveOptions::new()).unwrap();
        p.stop().unwrap();
        let err = status.wait(Some(Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, HalError::FailedStatus { .. }));
        // The cancelled worker must not complete the move later.
        std::thread::sleep(Duration::from_millis(250));
        assert_ne!(p.position(), 3.0);
    }

    #[test]
    fn blocking_move_escalates_timeout_to_stop() {
        let p = SoftPositioner::new("p").with_delay(Duration::from_millis(300));
        let err = p
            .move_to(
                1.0,
                MoveOptions::new().wait().timeout(Duration::from_millis(50)),
            )
            .unwrap_err();
        assert!(matches!(err, HalError::FailedStatus { .. }));
        assert!(!p.moving());
    }

    #[test]
    fn moved_callback_fires_on_completion() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let p = SoftPositioner::new("p");
        p.move_to(
            1.0,
            MoveOptions::new().on_complete(move || flag.store(true, Ordering::SeqCst)),
        )
        .unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn readback_events_track_each_update() {
        let p = SoftPositioner::new("p");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        p.subscribe_readback(
            Arc::new(move |e: &Event| {
                if let Some(v) = e.value_as_f64() {
                    sink.lock().push(v);
                }
            }),
            false,
        )
        .unwrap();
        p.move_to(1.0, MoveOptions::new()).unwrap();
        p.move_to(-2.0, MoveOptions::new()).unwrap();
        assert_eq!(*seen.lock(), vec![1.0, -2.0]);
    }

    #[test]
    fn new_command_fails_the_inflight_move() {
        let p = SoftPositioner::new("p").with_delay(Duration::from_millis(150));
        let first = p.move_to(1.0, MoveOptions::new()).unwrap();
        let second = p.move_to(2.0, MoveOptions::new()).unwrap();
        assert!(first.done());
        assert_eq!(first.success(), Some(false));
        second.wait(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(p.position(), 2.0);
    }

    #[test]
    fn consecutive_moves_complete_independently() {
        let p = SoftPositioner::new("p");
        let first = p.move_to(1.0, MoveOptions::new()).unwrap();
        let second = p.move_to(2.0, MoveOptions::new()).unwrap();
        assert_eq!(first.finish_pos(), Some(vec![1.0]));
        assert_eq!(second.finish_pos(), Some(vec![2.0]));
        assert_eq!(p.position(), 2.0);
    }

    #[test]
    fn done_event_fires_only_on_success() {
        let core = Arc::new(PositionerCore::new("c", 0.0));
        let done_count = Arc::new(AtomicU64::new(0));
        let counter = done_count.clone();
        core.events()
            .subscribe(
                Arc::new(move |_e: &Event| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                Some(SUB_DONE),
                false,
            )
            .unwrap();
        core.start_move(1.0);
        core.done_moving(false);
        assert_eq!(done_count.load(Ordering::SeqCst), 0);
        core.start_move(1.0);
        core.done_moving(true);
        assert_eq!(done_count.load(Ordering::SeqCst), 1);
    }
}
