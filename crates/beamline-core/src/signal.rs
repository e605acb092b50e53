//! Signals: the leaf control points of the hardware tree.
//!
//! A [`Signal`] is a soft, in-process value holder. A [`LinkedSignal`] binds
//! the same interface to a [`ControlLink`], the boundary trait a control
//! backend implements. Devices compose signals through component slots and
//! talk to them through the [`SignalLike`] trait.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{HalError, Result};
use crate::kind::Kind;
use crate::object::{Event, EventBus, EventCallback, ObjectMeta, SubscriptionId};
use crate::status::{unix_ts, Status};

/// Event fired on every value change.
pub const SUB_VALUE: &str = "value";
/// Event fired on metadata changes (connection state, limits).
pub const SUB_META: &str = "meta";

pub const SIGNAL_EVENTS: &[&str] = &[SUB_VALUE, SUB_META];

/// Poll interval for blocking confirmation loops.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One timestamped sample, as produced by `read()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub value: Value,
    pub timestamp: f64,
}

/// Static description of one reading entry, as produced by `describe()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryDescription {
    pub source: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lower_ctrl_limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper_ctrl_limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

/// JSON dtype name for a value, matching the describe() vocabulary.
pub fn dtype_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn shape_of(value: &Value) -> Vec<usize> {
    match value {
        Value::Array(items) => vec![items.len()],
        _ => Vec::new(),
    }
}

/// Equality test used by set-and-confirm: numeric values compare within
/// `tolerance`, everything else compares exactly.
pub fn values_match(a: &Value, b: &Value, tolerance: Option<f64>) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => {
            let tol = tolerance.unwrap_or(0.0);
            (x - y).abs() <= tol
        }
        _ => a == b,
    }
}

// =============================================================================
// ControlLink
// =============================================================================

/// Completion callback for an acknowledged put.
pub type PutCallback = Box<dyn FnOnce(bool) + Send>;

/// Boundary contract between a signal and a control backend.
///
/// Value and connection callbacks run on the backend's dispatch thread; they
/// must not block and must not call back into `put`.
pub trait ControlLink: Send + Sync {
    /// Identity string, e.g. `"SIM:motor.RBV"`.
    fn source(&self) -> String;

    /// Begin connecting. Non-blocking; completion is observed via
    /// [`ControlLink::connected`] or a connection subscription.
    fn connect(&self) -> Result<()>;

    fn connected(&self) -> bool;

    fn get(&self) -> Result<Value>;

    /// Write `value`. When `wait` is set the call blocks until the backend
    /// acknowledges. `callback`, if given, fires once with the outcome.
    fn put(&self, value: Value, wait: bool, callback: Option<PutCallback>) -> Result<()>;

    /// Subscribe to value updates `(value, timestamp)`.
    fn subscribe_value(&self, cb: Box<dyn Fn(Value, f64) + Send + Sync>);

    /// Subscribe to connection-state transitions.
    fn subscribe_connection(&self, cb: Box<dyn Fn(bool) + Send + Sync>);
}

/// Builds control links from resolved addresses. Component factories carry
/// one of these so a device schema stays backend-agnostic.
pub trait LinkFactory: Send + Sync {
    fn make(&self, address: &str) -> Result<Arc<dyn ControlLink>>;
}

// =============================================================================
// SignalLike
// =============================================================================

/// Uniform interface devices use to drive their leaf children.
pub trait SignalLike: Send + Sync {
    fn name(&self) -> String;
    fn kind(&self) -> Kind;
    fn set_kind(&self, kind: Kind);
    fn source(&self) -> String;

    fn get(&self) -> Result<Value>;
    fn put(&self, value: Value) -> Result<()>;
    /// Write and return a status resolving when the value is in effect.
    fn set(&self, value: Value) -> Result<Status>;

    fn read(&self) -> Result<Vec<(String, Reading)>>;
    fn describe(&self) -> Result<Vec<(String, EntryDescription)>>;

    /// A signal's configuration view is its ordinary reading; the owning
    /// device decides which view it lands in via `kind`.
    fn read_configuration(&self) -> Result<Vec<(String, Reading)>> {
        self.read()
    }

    fn describe_configuration(&self) -> Result<Vec<(String, EntryDescription)>> {
        self.describe()
    }

    /// Timestamp of the most recent value.
    fn timestamp(&self) -> f64;

    /// Validate a candidate value without writing it.
    fn check_value(&self, value: &Value) -> Result<()>;

    fn connected(&self) -> bool {
        true
    }

    fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        while !self.connected() {
            if std::time::Instant::now() >= deadline {
                return Err(HalError::ConnectionTimeout {
                    signal: self.name(),
                    timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    fn subscribe_value(&self, cb: EventCallback, run: bool) -> Result<SubscriptionId>;
    fn clear_sub(&self, cb: &EventCallback);
    fn destroy(&self);
}

/// Write `value` through `set` and block until confirmed, mapping a timeout
/// to [`HalError::SetTimeout`] with the attempted value attached. This is the
/// primitive staging uses to apply `stage_sigs`.
pub fn set_and_wait(signal: &dyn SignalLike, value: Value, timeout: Duration) -> Result<()> {
    let status = signal.set(value.clone())?;
    match status.wait(Some(timeout)) {
        Ok(()) => Ok(()),
        Err(HalError::StatusTimeout(_)) => Err(HalError::SetTimeout {
            signal: signal.name(),
            value,
            timeout,
        }),
        Err(err) => Err(err),
    }
}

// =============================================================================
// Signal (soft)
// =============================================================================

struct SignalState {
    value: Value,
    timestamp: f64,
}

/// Soft in-process signal. Reads and writes complete synchronously; `set`
/// returns an already-finished status so soft and linked signals share one
/// calling convention.
pub struct Signal {
    meta: ObjectMeta,
    events: EventBus,
    state: Mutex<SignalState>,
    read_only: bool,
    tolerance: Option<f64>,
    limits: Option<(f64, f64)>,
    units: Option<String>,
}

impl Signal {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_value(name, Value::Null)
    }

    pub fn with_value(name: impl Into<String>, value: Value) -> Self {
        let name = name.into();
        Signal {
            events: EventBus::new(name.clone(), SIGNAL_EVENTS, Some(SUB_VALUE)),
            meta: ObjectMeta::new(name),
            state: Mutex::new(SignalState {
                value,
                timestamp: unix_ts(),
            }),
            read_only: false,
            tolerance: None,
            limits: None,
            units: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Soft limits enforced by `check_value`. Equal bounds disable the check.
    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some((low, high));
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_kind(self, kind: Kind) -> Self {
        self.meta.set_kind(kind);
        self
    }

    /// Rename, also updating the label future events carry.
    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.events.set_obj(name.clone());
        self.meta.set_name(name);
    }

    pub fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    pub fn limits(&self) -> Option<(f64, f64)> {
        self.limits
    }

    pub fn tolerance(&self) -> Option<f64> {
        self.tolerance
    }

    fn check_writable(&self, value: &Value) -> Result<()> {
        if self.read_only {
            return Err(HalError::ReadOnly(self.meta.name()));
        }
        self.check_value(value)
    }

    /// Store `value` and fire the value event with old and new values.
    fn store(&self, value: Value) {
        let ts = unix_ts();
        let old = {
            let mut state = self.state.lock();
            let old = std::mem::replace(&mut state.value, value.clone());
            state.timestamp = ts;
            old
        };
        // Subscribers see failures logged, never propagated.
        let _ = self.events.run_subs(
            Event::new(SUB_VALUE)
                .with_value(value)
                .with_old_value(old)
                .with_timestamp(ts),
        );
    }

    fn reading(&self) -> Reading {
        let state = self.state.lock();
        Reading {
            value: state.value.clone(),
            timestamp: state.timestamp,
        }
    }
}

impl SignalLike for Signal {
    fn name(&self) -> String {
        self.meta.name()
    }

    fn kind(&self) -> Kind {
        self.meta.kind()
    }

    fn set_kind(&self, kind: Kind) {
        self.meta.set_kind(kind);
    }

    fn source(&self) -> String {
        format!("soft://{}", self.meta.name())
    }

    fn get(&self) -> Result<Value> {
        Ok(self.state.lock().value.clone())
    }

    fn put(&self, value: Value) -> Result<()> {
        self.check_writable(&value)?;
        self.store(value);
        Ok(())
    }

    fn set(&self, value: Value) -> Result<Status> {
        self.put(value)?;
        let status = Status::new(self.meta.name());
        status.set_finished();
        Ok(status)
    }

    fn read(&self) -> Result<Vec<(String, Reading)>> {
        Ok(vec![(self.meta.name(), self.reading())])
    }

    fn describe(&self) -> Result<Vec<(String, EntryDescription)>> {
        let value = self.state.lock().value.clone();
        Ok(vec![(
            self.meta.name(),
            EntryDescription {
                source: self.source(),
                dtype: dtype_of(&value).to_string(),
                shape: shape_of(&value),
                lower_ctrl_limit: self.limits.map(|(lo, _)| lo),
                upper_ctrl_limit: self.limits.map(|(_, hi)| hi),
                units: self.units.clone(),
            },
        )])
    }

    fn timestamp(&self) -> f64 {
        self.state.lock().timestamp
    }

    fn check_value(&self, value: &Value) -> Result<()> {
        let Some((low, high)) = self.limits else {
            return Ok(());
        };
        if low >= high {
            // Degenerate bounds disable limit checking.
            return Ok(());
        }
        let Some(v) = value.as_f64() else {
            return Err(HalError::InvalidValue {
                name: self.meta.name(),
                message: format!("limits are set but value {value} is not numeric"),
            });
        };
        if v < low || v > high {
            return Err(HalError::LimitViolation {
                name: self.meta.name(),
                value: v,
                low,
                high,
            });
        }
        Ok(())
    }

    fn subscribe_value(&self, cb: EventCallback, run: bool) -> Result<SubscriptionId> {
        self.events.subscribe(cb, Some(SUB_VALUE), run)
    }

    fn clear_sub(&self, cb: &EventCallback) {
        self.events.clear_sub(cb, None);
    }

    fn destroy(&self) {
        self.events.destroy();
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.meta.name())
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// LinkedSignal
// =============================================================================

struct LinkedShared {
    events: EventBus,
    state: Mutex<SignalState>,
}

/// A signal backed by a [`ControlLink`]. Readback updates arrive on the
/// link's dispatch thread and are re-fired as this signal's value event;
/// `set` resolves when the backend confirms the write, or by polling the
/// readback against the target when the backend has no put acknowledgement.
pub struct LinkedSignal {
    meta: ObjectMeta,
    shared: Arc<LinkedShared>,
    link: Arc<dyn ControlLink>,
    read_only: bool,
    tolerance: Option<f64>,
    set_timeout: Option<Duration>,
    /// Whether the backend acknowledges puts. Without it, `set` confirms by
    /// readback comparison.
    put_complete: bool,
    units: Option<String>,
}

impl LinkedSignal {
    pub fn new(name: impl Into<String>, link: Arc<dyn ControlLink>) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(LinkedShared {
            events: EventBus::new(name.clone(), SIGNAL_EVENTS, Some(SUB_VALUE)),
            state: Mutex::new(SignalState {
                value: Value::Null,
                timestamp: unix_ts(),
            }),
        });

        let monitor = shared.clone();
        link.subscribe_value(Box::new(move |value, timestamp| {
            let old = {
                let mut state = monitor.state.lock();
                let old = std::mem::replace(&mut state.value, value.clone());
                state.timestamp = timestamp;
                old
            };
            let _ = monitor.events.run_subs(
                Event::new(SUB_VALUE)
                    .with_value(value)
                    .with_old_value(old)
                    .with_timestamp(timestamp),
            );
        }));

        let conn = shared.clone();
        link.subscribe_connection(Box::new(move |connected| {
            let _ = conn.events.run_subs(
                Event::new(SUB_META).with_value(Value::Bool(connected)),
            );
        }));

        link.connect()?;
        Ok(LinkedSignal {
            meta: ObjectMeta::new(name),
            shared,
            link,
            read_only: false,
            tolerance: None,
            set_timeout: None,
            put_complete: true,
            units: None,
        })
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    /// Default timeout applied to `set` confirmation.
    pub fn with_set_timeout(mut self, timeout: Duration) -> Self {
        self.set_timeout = Some(timeout);
        self
    }

    /// Confirm writes by readback comparison instead of put acknowledgement.
    pub fn confirm_by_readback(mut self) -> Self {
        self.put_complete = false;
        self
    }

    pub fn with_kind(self, kind: Kind) -> Self {
        self.meta.set_kind(kind);
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    pub fn link(&self) -> &Arc<dyn ControlLink> {
        &self.link
    }

    /// Spawn a thread that resolves `status` once the cached readback reaches
    /// `target` within tolerance. The constructor timeout on `status` fails
    /// it if the readback never arrives.
    fn confirm_readback(&self, status: Status, target: Value) {
        let shared = self.shared.clone();
        let tolerance = self.tolerance;
        let builder = std::thread::Builder::new().name(format!("{}-confirm", self.meta.name()));
        let spawned = builder.spawn(move || {
            while !status.done() {
                let current = shared.state.lock().value.clone();
                if values_match(&current, &target, tolerance) {
                    status.set_finished();
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        });
        if spawned.is_err() {
            debug!("failed to spawn readback confirmation thread");
        }
    }
}

impl SignalLike for LinkedSignal {
    fn name(&self) -> String {
        self.meta.name()
    }

    fn kind(&self) -> Kind {
        self.meta.kind()
    }

    fn set_kind(&self, kind: Kind) {
        self.meta.set_kind(kind);
    }

    fn source(&self) -> String {
        self.link.source()
    }

    fn get(&self) -> Result<Value> {
        let value = self.link.get()?;
        let mut state = self.shared.state.lock();
        state.value = value.clone();
        state.timestamp = unix_ts();
        Ok(value)
    }

    fn put(&self, value: Value) -> Result<()> {
        if self.read_only {
            return Err(HalError::ReadOnly(self.meta.name()));
        }
        self.check_value(&value)?;
        self.link.put(value, true, None)
    }

    fn set(&self, value: Value) -> Result<Status> {
        if self.read_only {
            return Err(HalError::ReadOnly(self.meta.name()));
        }
        self.check_value(&value)?;
        let mut status = Status::new(self.meta.name());
        if let Some(timeout) = self.set_timeout {
            status = status.with_timeout(timeout);
        }
        if self.put_complete {
            let done = status.clone();
            self.link.put(
                value,
                false,
                Some(Box::new(move |ok| {
                    if ok {
                        done.set_finished();
                    } else {
                        done.set_failed();
                    }
                })),
            )?;
        } else {
            self.link.put(value.clone(), false, None)?;
            self.confirm_readback(status.clone(), value);
        }
        Ok(status)
    }

    fn read(&self) -> Result<Vec<(String, Reading)>> {
        let state = self.shared.state.lock();
        Ok(vec![(
            self.meta.name(),
            Reading {
                value: state.value.clone(),
                timestamp: state.timestamp,
            },
        )])
    }

    fn describe(&self) -> Result<Vec<(String, EntryDescription)>> {
        let value = self.shared.state.lock().value.clone();
        Ok(vec![(
            self.meta.name(),
            EntryDescription {
                source: self.source(),
                dtype: dtype_of(&value).to_string(),
                shape: shape_of(&value),
                lower_ctrl_limit: None,
                upper_ctrl_limit: None,
                units: self.units.clone(),
            },
        )])
    }

    fn timestamp(&self) -> f64 {
        self.shared.state.lock().timestamp
    }

    fn check_value(&self, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn connected(&self) -> bool {
        self.link.connected()
    }

    fn subscribe_value(&self, cb: EventCallback, run: bool) -> Result<SubscriptionId> {
        self.shared.events.subscribe(cb, Some(SUB_VALUE), run)
    }

    fn clear_sub(&self, cb: &EventCallback) {
        self.shared.events.clear_sub(cb, None);
    }

    fn destroy(&self) {
        self.shared.events.destroy();
    }
}

impl std::fmt::Debug for LinkedSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedSignal")
            .field("name", &self.meta.name())
            .field("source", &self.link.source())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_updates_value_and_timestamp() {
        let sig = Signal::with_value("s", json!(0.0));
        let before = sig.timestamp();
        std::thread::sleep(Duration::from_millis(2));
        sig.put(json!(1.5)).unwrap();
        assert_eq!(sig.get().unwrap(), json!(1.5));
        assert!(sig.timestamp() > before);
    }

    #[test]
    fn set_returns_finished_status() {
        let sig = Signal::new("s");
        let status = sig.set(json!(3)).unwrap();
        assert!(status.done());
        assert_eq!(status.success(), Some(true));
    }

    #[test]
    fn read_only_rejects_put() {
        let sig = Signal::with_value("ro", json!(1)).read_only();
        let err = sig.put(json!(2)).unwrap_err();
        assert!(matches!(err, HalError::ReadOnly(name) if name == "ro"));
        assert_eq!(sig.get().unwrap(), json!(1));
    }

    #[test]
    fn limits_enforced_on_put() {
        let sig = Signal::with_value("lim", json!(0.0)).with_limits(-1.0, 1.0);
        sig.put(json!(0.5)).unwrap();
        let err = sig.put(json!(2.0)).unwrap_err();
        assert!(matches!(err, HalError::LimitViolation { .. }));

        let err = sig.check_value(&json!("text")).unwrap_err();
        assert!(matches!(err, HalError::InvalidValue { .. }));
    }

    #[test]
    fn degenerate_limits_disable_checking() {
        let sig = Signal::with_value("open", json!(0.0)).with_limits(0.0, 0.0);
        sig.put(json!(1e9)).unwrap();
    }

    #[test]
    fn value_event_carries_old_and_new() {
        let sig = Signal::with_value("s", json!(1));
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        sig.subscribe_value(
            Arc::new(move |e: &Event| {
                *seen2.lock() = Some((e.old_value.clone(), e.value.clone()));
            }),
            false,
        )
        .unwrap();
        sig.put(json!(2)).unwrap();
        let (old, new) = seen.lock().clone().unwrap();
        assert_eq!(old, Some(json!(1)));
        assert_eq!(new, Some(json!(2)));
    }

    #[test]
    fn read_and_describe_share_the_key() {
        let sig = Signal::with_value("motor_setpoint", json!([1.0, 2.0]))
            .with_limits(-10.0, 10.0)
            .with_units("mm");
        let readings = sig.read().unwrap();
        let describes = sig.describe().unwrap();
        assert_eq!(readings[0].0, "motor_setpoint");
        assert_eq!(describes[0].0, "motor_setpoint");
        let desc = &describes[0].1;
        assert_eq!(desc.dtype, "array");
        assert_eq!(desc.shape, vec![2]);
        assert_eq!(desc.lower_ctrl_limit, Some(-10.0));
        assert_eq!(desc.units.as_deref(), Some("mm"));
    }

    #[test]
    fn values_match_uses_tolerance_for_numbers_only() {
        assert!(values_match(&json!(1.0), &json!(1.05), Some(0.1)));
        assert!(!values_match(&json!(1.0), &json!(1.5), Some(0.1)));
        assert!(values_match(&json!("a"), &json!("a"), Some(10.0)));
        assert!(!values_match(&json!("a"), &json!("b"), Some(10.0)));
    }

    struct EchoLink {
        value: Mutex<Value>,
    }

    impl ControlLink for EchoLink {
        fn source(&self) -> String {
            "test://echo".into()
        }
        fn connect(&self) -> Result<()> {
            Ok(())
        }
        fn connected(&self) -> bool {
            true
        }
        fn get(&self) -> Result<Value> {
            Ok(self.value.lock().clone())
        }
        fn put(&self, value: Value, _wait: bool, callback: Option<PutCallback>) -> Result<()> {
            *self.value.lock() = value;
            if let Some(cb) = callback {
                cb(true);
            }
            Ok(())
        }
        fn subscribe_value(&self, _cb: Box<dyn Fn(Value, f64) + Send + Sync>) {}
        fn subscribe_connection(&self, _cb: Box<dyn Fn(bool) + Send + Sync>) {}
    }

    #[test]
    fn read_only_linked_signal_rejects_writes_first() {
        let link = Arc::new(EchoLink {
            value: Mutex::new(json!(0)),
        });
        let sig = LinkedSignal::new("ro", link).unwrap().read_only();
        let err = sig.put(json!(1)).unwrap_err();
        assert!(matches!(err, HalError::ReadOnly(name) if name == "ro"));
        let err = sig.set(json!(1)).unwrap_err();
        assert!(matches!(err, HalError::ReadOnly(_)));
        assert_eq!(sig.get().unwrap(), json!(0));
    }

    #[test]
    fn set_and_wait_times_out_with_value_attached() {
        struct Pending;
        impl SignalLike for Pending {
            fn name(&self) -> String {
                "pending".into()
            }
            fn kind(&self) -> Kind {
                Kind::NORMAL
            }
            fn set_kind(&self, _kind: Kind) {}
            fn source(&self) -> String {
                "test://pending".into()
            }
            fn get(&self) -> Result<Value> {
                Ok(Value::Null)
            }
            fn put(&self, _value: Value) -> Result<()> {
                Ok(())
            }
            fn set(&self, _value: Value) -> Result<Status> {
                // Never resolves.
                Ok(Status::new("pending"))
            }
            fn read(&self) -> Result<Vec<(String, Reading)>> {
                Ok(Vec::new())
            }
            fn describe(&self) -> Result<Vec<(String, EntryDescription)>> {
                Ok(Vec::new())
            }
            fn timestamp(&self) -> f64 {
                0.0
            }
            fn check_value(&self, _value: &Value) -> Result<()> {
                Ok(())
            }
            fn subscribe_value(&self, _cb: EventCallback, _run: bool) -> Result<SubscriptionId> {
                Ok(0)
            }
            fn clear_sub(&self, _cb: &EventCallback) {}
            fn destroy(&self) {}
        }

        let err = set_and_wait(&Pending, json!(9), Duration::from_millis(80)).unwrap_err();
        match err {
            HalError::SetTimeout { signal, value, .. } => {
                assert_eq!(signal, "pending");
                assert_eq!(value, json!(9));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
