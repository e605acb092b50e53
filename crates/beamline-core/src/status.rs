//! Asynchronous completion handles.
//!
//! A [`Status`] is a single-slot future: it transitions `done: false -> true`
//! exactly once, and every registered callback fires exactly once, in
//! registration order, the instant it completes (immediately, if the status
//! was already done at registration time). Completion callbacks run on
//! whichever thread resolved the status.
//!
//! Two statuses compose with `&` into a combined status that succeeds only
//! when both succeed and fails as soon as either fails.
//! [`MoveStatus`] extends the base handle with the commanded target and the
//! final position, captured before `done` flips.
//!
//! # Deadlock warning
//!
//! **Never call [`Status::wait`] from inside a subscription or completion
//! callback.** Callbacks are delivered on the thread that resolved the status
//! (often the control-system dispatch thread); blocking it can deadlock event
//! delivery for every object in the process.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{HalError, Result};

/// Poll interval for [`Status::wait`].
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Wall-clock time as fractional UNIX seconds.
pub fn unix_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Callback invoked once when a status completes. Takes no arguments; query
/// the status itself for the outcome.
pub type DoneCallback = Box<dyn FnOnce() + Send + 'static>;

struct StatusState {
    done: bool,
    success: Option<bool>,
    /// A completion has been accepted but is still settling; later
    /// completions (including the timeout watcher) must not override it.
    resolving: bool,
    finish_ts: Option<f64>,
    callbacks: Vec<DoneCallback>,
}

struct StatusInner {
    obj: String,
    start_ts: f64,
    settle_time: Duration,
    state: Mutex<StatusState>,
}

/// A cheaply clonable single-slot completion handle.
#[derive(Clone)]
pub struct Status {
    inner: Arc<StatusInner>,
}

impl Status {
    /// Create a pending status. `obj` labels the owning object in logs and
    /// error messages.
    pub fn new(obj: impl Into<String>) -> Self {
        Status {
            inner: Arc::new(StatusInner {
                obj: obj.into(),
                start_ts: unix_ts(),
                settle_time: Duration::ZERO,
                state: Mutex::new(StatusState {
                    done: false,
                    success: None,
                    resolving: false,
                    finish_ts: None,
                    callbacks: Vec::new(),
                }),
            }),
        }
    }

    /// Delay successful completion by `settle` once the underlying operation
    /// reports done. Failure completions are never delayed.
    ///
    /// Callbacks and completion state already on the handle carry over to the
    /// returned one.
    pub fn with_settle_time(self, settle: Duration) -> Self {
        // settle_time is immutable after construction; rebuild the inner,
        // moving the registered callbacks along.
        let state = {
            let mut old = self.inner.state.lock();
            StatusState {
                done: old.done,
                success: old.success,
                resolving: old.resolving,
                finish_ts: old.finish_ts,
                callbacks: std::mem::take(&mut old.callbacks),
            }
        };
        let inner = StatusInner {
            obj: self.inner.obj.clone(),
            start_ts: self.inner.start_ts,
            settle_time: settle,
            state: Mutex::new(state),
        };
        Status {
            inner: Arc::new(inner),
        }
    }

    /// Arm a watcher that force-fails this status if it has not completed
    /// after `timeout` (plus the settle time, so a settling success is not
    /// raced). The watcher holds only a weak reference and never fires after
    /// the status has completed through another path.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let weak: Weak<StatusInner> = Arc::downgrade(&self.inner);
        let deadline = timeout + self.inner.settle_time;
        thread::Builder::new()
            .name(format!("status-timeout-{}", self.inner.obj))
            .spawn(move || {
                thread::sleep(deadline);
                if let Some(inner) = weak.upgrade() {
                    let st = Status { inner };
                    if !st.done() {
                        warn!(obj = %st.inner.obj, ?timeout, "status timed out");
                        st.force_resolve(false);
                    }
                }
            })
            .ok();
        self
    }

    /// Object label this status belongs to.
    pub fn obj(&self) -> &str {
        &self.inner.obj
    }

    /// Whether the status has completed (successfully or not).
    pub fn done(&self) -> bool {
        self.inner.state.lock().done
    }

    /// `Some(true)` / `Some(false)` once done, `None` while pending.
    pub fn success(&self) -> Option<bool> {
        self.inner.state.lock().success
    }

    /// Creation timestamp (UNIX seconds).
    pub fn start_ts(&self) -> f64 {
        self.inner.start_ts
    }

    /// Completion timestamp, once done.
    pub fn finish_ts(&self) -> Option<f64> {
        self.inner.state.lock().finish_ts
    }

    /// Seconds since creation, or total duration once finished.
    pub fn elapsed(&self) -> f64 {
        match self.finish_ts() {
            Some(ts) => ts - self.inner.start_ts,
            None => unix_ts() - self.inner.start_ts,
        }
    }

    /// Register `cb` to run when the status completes. Runs synchronously,
    /// right now, if the status is already done.
    pub fn add_callback(&self, cb: impl FnOnce() + Send + 'static) {
        let run_now = {
            let mut state = self.inner.state.lock();
            if state.done {
                true
            } else {
                state.callbacks.push(Box::new(cb));
                return;
            }
        };
        if run_now {
            cb();
        }
    }

    /// Mark the operation finished successfully. A no-op (logged at debug) if
    /// the status already completed.
    pub fn set_finished(&self) {
        self.complete(true);
    }

    /// Mark the operation finished with failure. A no-op (logged at debug) if
    /// the status already completed.
    pub fn set_failed(&self) {
        self.complete(false);
    }

    /// Complete with the given outcome. The first call wins; every later call
    /// is ignored so callbacks fire exactly once.
    pub fn complete(&self, success: bool) {
        let claimed = {
            let mut state = self.inner.state.lock();
            if state.done || state.resolving {
                false
            } else {
                state.resolving = true;
                true
            }
        };
        if !claimed {
            debug!(obj = %self.inner.obj, success, "duplicate completion ignored");
            return;
        }
        if success && !self.inner.settle_time.is_zero() {
            let st = self.clone();
            thread::Builder::new()
                .name(format!("status-settle-{}", self.inner.obj))
                .spawn(move || {
                    thread::sleep(st.inner.settle_time);
                    st.resolve(true);
                })
                .ok();
        } else {
            self.resolve(success);
        }
    }

    /// Claim-and-resolve in one step, bypassing settle. Used by the timeout
    /// watcher.
    fn force_resolve(&self, success: bool) {
        let claimed = {
            let mut state = self.inner.state.lock();
            if state.done || state.resolving {
                false
            } else {
                state.resolving = true;
                true
            }
        };
        if claimed {
            self.resolve(success);
        }
    }

    /// Flip `done`, record the outcome, and drain callbacks in registration
    /// order outside the lock.
    fn resolve(&self, success: bool) {
        let callbacks = {
            let mut state = self.inner.state.lock();
            state.done = true;
            state.success = Some(success);
            state.finish_ts = Some(unix_ts());
            std::mem::take(&mut state.callbacks)
        };
        for cb in callbacks {
            cb();
        }
    }

    /// Block until done, polling every 50 ms.
    ///
    /// Returns `Err(StatusTimeout)` if `timeout` elapses first, and
    /// `Err(FailedStatus)` if the status completes unsuccessfully.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        while !self.done() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(HalError::StatusTimeout(
                        timeout.unwrap_or(Duration::ZERO),
                    ));
                }
            }
            thread::sleep(WAIT_POLL);
        }
        if self.success() == Some(false) {
            return Err(HalError::FailedStatus {
                obj: self.inner.obj.clone(),
            });
        }
        Ok(())
    }

    /// Combine two statuses: done-success only when both succeed, failed as
    /// soon as either fails (without waiting for the slower operand).
    pub fn and(a: &Status, b: &Status) -> Status {
        let combined = Status::new(format!("({} & {})", a.obj(), b.obj()));
        for (this, other) in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            let combined = combined.clone();
            let me = this.clone();
            this.add_callback(move || {
                if me.success() == Some(false) {
                    combined.complete(false);
                } else if other.done() {
                    combined.complete(other.success() == Some(true));
                }
            });
        }
        combined
    }
}

impl std::ops::BitAnd for &Status {
    type Output = Status;

    fn bitand(self, rhs: &Status) -> Status {
        Status::and(self, rhs)
    }
}

impl std::fmt::Debug for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Status")
            .field("obj", &self.inner.obj)
            .field("done", &state.done)
            .field("success", &state.success)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// MoveStatus
// =============================================================================

struct MoveInner {
    target: Vec<f64>,
    finish_pos: Mutex<Option<Vec<f64>>>,
}

/// Completion handle for a motion request, carrying the commanded target and
/// the position captured at completion time.
#[derive(Clone)]
pub struct MoveStatus {
    status: Status,
    motion: Arc<MoveInner>,
}

impl MoveStatus {
    /// Build a move status for `obj` toward `target`, with an optional
    /// overall timeout and the positioner's settle time.
    pub fn new(
        obj: impl Into<String>,
        target: Vec<f64>,
        timeout: Option<Duration>,
        settle_time: Duration,
    ) -> Self {
        let mut status = Status::new(obj).with_settle_time(settle_time);
        if let Some(timeout) = timeout {
            status = status.with_timeout(timeout);
        }
        MoveStatus {
            status,
            motion: Arc::new(MoveInner {
                target,
                finish_pos: Mutex::new(None),
            }),
        }
    }

    /// The commanded target position.
    pub fn target(&self) -> &[f64] {
        &self.motion.target
    }

    /// Scalar view of a single-axis target.
    pub fn target_scalar(&self) -> Option<f64> {
        match self.motion.target.as_slice() {
            [v] => Some(*v),
            _ => None,
        }
    }

    /// Position recorded when the move completed, if any.
    pub fn finish_pos(&self) -> Option<Vec<f64>> {
        self.motion.finish_pos.lock().clone()
    }

    /// Per-axis difference between the final position and the target, once
    /// the final position is known.
    pub fn error(&self) -> Option<Vec<f64>> {
        let finish = self.motion.finish_pos.lock().clone()?;
        Some(
            finish
                .iter()
                .zip(self.motion.target.iter())
                .map(|(f, t)| f - t)
                .collect(),
        )
    }

    /// Complete the move. The final position is captured *before* `done`
    /// flips so callbacks observe consistent state.
    pub fn complete(&self, success: bool, finish_pos: Option<Vec<f64>>) {
        if let Some(pos) = finish_pos {
            *self.motion.finish_pos.lock() = Some(pos);
        }
        self.status.complete(success);
    }

    /// The underlying status handle.
    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn done(&self) -> bool {
        self.status.done()
    }

    pub fn success(&self) -> Option<bool> {
        self.status.success()
    }

    pub fn elapsed(&self) -> f64 {
        self.status.elapsed()
    }

    pub fn add_callback(&self, cb: impl FnOnce() + Send + 'static) {
        self.status.add_callback(cb)
    }

    /// Block until the move resolves. See [`Status::wait`].
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.status.wait(timeout)
    }
}

impl std::fmt::Debug for MoveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoveStatus")
            .field("obj", &self.status.obj())
            .field("target", &self.motion.target)
            .field("done", &self.status.done())
            .field("success", &self.status.success())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_fire_exactly_once_in_order() {
        let st = Status::new("sig");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            st.add_callback(move || order.lock().push(i));
        }
        st.set_finished();
        // Extra completion attempts are ignored.
        st.set_finished();
        st.set_failed();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(st.success(), Some(true));
    }

    #[test]
    fn callback_after_done_runs_immediately() {
        let st = Status::new("sig");
        st.set_finished();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        st.add_callback(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_reports_failure() {
        let st = Status::new("sig");
        st.set_failed();
        match st.wait(Some(Duration::from_millis(200))) {
            Err(HalError::FailedStatus { obj }) => assert_eq!(obj, "sig"),
            other => panic!("expected FailedStatus, got {other:?}"),
        }
    }

    #[test]
    fn wait_times_out_while_pending() {
        let st = Status::new("sig");
        match st.wait(Some(Duration::from_millis(120))) {
            Err(HalError::StatusTimeout(_)) => {}
            other => panic!("expected StatusTimeout, got {other:?}"),
        }
    }

    #[test]
    fn constructor_timeout_forces_failure() {
        let st = Status::new("sig").with_timeout(Duration::from_millis(50));
        st.wait(Some(Duration::from_secs(2))).unwrap_err();
        assert!(st.done());
        assert_eq!(st.success(), Some(false));
    }

    #[test]
    fn timeout_watcher_does_not_override_success() {
        let st = Status::new("sig").with_timeout(Duration::from_millis(60));
        st.set_finished();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(st.success(), Some(true));
    }

    #[test]
    fn and_status_requires_both_successes() {
        let a = Status::new("a");
        let b = Status::new("b");
        let both = &a & &b;
        a.set_finished();
        assert!(!both.done());
        b.set_finished();
        assert_eq!(both.success(), Some(true));
    }

    #[test]
    fn and_status_short_circuits_on_failure() {
        let a = Status::new("a");
        let b = Status::new("b");
        let both = &a & &b;
        a.set_failed();
        // b is still pending; the combination must already be failed.
        assert!(both.done());
        assert_eq!(both.success(), Some(false));
        assert!(!b.done());
    }

    #[test]
    fn settle_time_delays_done() {
        let st = Status::new("sig").with_settle_time(Duration::from_millis(80));
        st.set_finished();
        assert!(!st.done());
        st.wait(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(st.success(), Some(true));
    }

    #[test]
    fn settle_time_keeps_earlier_callbacks() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let st = Status::new("sig");
        st.add_callback(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let st = st.with_settle_time(Duration::from_millis(40));
        st.set_finished();
        st.wait(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn move_status_captures_final_position() {
        let ms = MoveStatus::new("mtr", vec![2.0], None, Duration::ZERO);
        ms.complete(true, Some(vec![2.05]));
        assert_eq!(ms.finish_pos(), Some(vec![2.05]));
        let err = ms.error().unwrap();
        assert!((err[0] - 0.05).abs() < 1e-12);
        assert_eq!(ms.target_scalar(), Some(2.0));
    }
}
