//! Object identity and the subscription/event bus.
//!
//! Every node in the hardware tree (signal, device, positioner) owns an
//! [`ObjectMeta`] for identity and an [`EventBus`] for pub/sub. The bus is
//! built from a *declared* set of event types; firing or subscribing to an
//! undeclared type is an error, which keeps event names honest across the
//! tree.
//!
//! Callbacks for one event type on one object fire in registration order.
//! A panicking callback is caught, logged, and never prevents the remaining
//! callbacks from running; hardware-originated events must not be able to
//! take down the dispatch thread.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::error;

use crate::error::{HalError, Result};
use crate::kind::Kind;
use crate::status::unix_ts;

/// Stable id returned by [`EventBus::subscribe`], valid until unsubscribed.
pub type SubscriptionId = usize;

/// Subscription callback. Shared so callers can keep a clone for
/// identity-based removal via [`EventBus::clear_sub`].
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

/// Payload delivered to subscription callbacks.
///
/// `obj` and `timestamp` are filled in by the bus when the firing code leaves
/// them empty, so callbacks can always rely on them.
#[derive(Debug, Clone)]
pub struct Event {
    pub sub_type: &'static str,
    pub obj: String,
    pub value: Option<Value>,
    pub old_value: Option<Value>,
    pub timestamp: Option<f64>,
    pub success: Option<bool>,
}

impl Event {
    pub fn new(sub_type: &'static str) -> Self {
        Event {
            sub_type,
            obj: String::new(),
            value: None,
            old_value: None,
            timestamp: None,
            success: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_old_value(mut self, old_value: Value) -> Self {
        self.old_value = Some(old_value);
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    /// The event value as `f64`, when numeric.
    pub fn value_as_f64(&self) -> Option<f64> {
        self.value.as_ref().and_then(Value::as_f64)
    }
}

// =============================================================================
// ObjectMeta
// =============================================================================

/// Identity of a node in the hardware tree.
///
/// `parent` is the parent's full name only, a non-owning back-reference.
/// Children are owned by the parent's component map, never the other way
/// around, so the tree stays cycle-free.
#[derive(Debug)]
pub struct ObjectMeta {
    name: RwLock<String>,
    attr_name: String,
    parent: Option<String>,
    kind: RwLock<Kind>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>) -> Self {
        ObjectMeta {
            name: RwLock::new(name.into()),
            attr_name: String::new(),
            parent: None,
            kind: RwLock::new(Kind::NORMAL),
        }
    }

    /// Identity for a child built from a component slot.
    pub fn child(name: impl Into<String>, attr_name: impl Into<String>, parent: impl Into<String>) -> Self {
        ObjectMeta {
            name: RwLock::new(name.into()),
            attr_name: attr_name.into(),
            parent: Some(parent.into()),
            kind: RwLock::new(Kind::NORMAL),
        }
    }

    pub fn with_kind(self, kind: Kind) -> Self {
        *self.kind.write() = kind;
        self
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// Name of the attribute slot this object occupies on its parent, empty
    /// for root objects.
    pub fn attr_name(&self) -> &str {
        &self.attr_name
    }

    /// Full name of the parent object, `None` at the top of a hierarchy.
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn kind(&self) -> Kind {
        *self.kind.read()
    }

    pub fn set_kind(&self, kind: Kind) {
        *self.kind.write() = kind;
    }
}

// =============================================================================
// EventBus
// =============================================================================

struct BusInner {
    next_id: SubscriptionId,
    subs: HashMap<&'static str, Vec<(SubscriptionId, EventCallback)>>,
    cache: HashMap<&'static str, Event>,
}

/// Pub/sub hub for one object.
///
/// The set of event types is frozen at construction. The most recent event of
/// each type is cached so a late subscriber with `run = true` is immediately
/// brought up to date.
pub struct EventBus {
    obj: RwLock<String>,
    declared: &'static [&'static str],
    default_type: Option<&'static str>,
    inner: Mutex<BusInner>,
}

impl EventBus {
    /// Build a bus for `obj` with the given declared event types and an
    /// optional default used when subscribers omit the type.
    pub fn new(
        obj: impl Into<String>,
        declared: &'static [&'static str],
        default_type: Option<&'static str>,
    ) -> Self {
        let mut subs = HashMap::new();
        for ty in declared {
            subs.insert(*ty, Vec::new());
        }
        EventBus {
            obj: RwLock::new(obj.into()),
            declared,
            default_type,
            inner: Mutex::new(BusInner {
                next_id: 0,
                subs,
                cache: HashMap::new(),
            }),
        }
    }

    /// Update the object label used in delivered events (after a rename).
    pub fn set_obj(&self, obj: impl Into<String>) {
        *self.obj.write() = obj.into();
    }

    /// Declared event types.
    pub fn event_types(&self) -> &'static [&'static str] {
        self.declared
    }

    fn resolve(&self, event_type: Option<&str>) -> Result<&'static str> {
        let wanted = match event_type {
            Some(ty) => ty,
            None => {
                return self
                    .default_type
                    .ok_or_else(|| HalError::NoDefaultEventType(self.obj.read().clone()))
            }
        };
        self.declared
            .iter()
            .find(|ty| **ty == wanted)
            .copied()
            .ok_or_else(|| HalError::UnknownEventType {
                obj: self.obj.read().clone(),
                event_type: wanted.to_string(),
            })
    }

    /// Register `cb` for `event_type` (the default type when `None`).
    ///
    /// With `run = true`, the cached last event of that type (if any) is
    /// replayed to `cb` synchronously before this returns.
    pub fn subscribe(
        &self,
        cb: EventCallback,
        event_type: Option<&str>,
        run: bool,
    ) -> Result<SubscriptionId> {
        let ty = self.resolve(event_type)?;
        let (id, replay) = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            let replay = if run { inner.cache.get(ty).cloned() } else { None };
            if let Some(slot) = inner.subs.get_mut(ty) {
                slot.push((id, cb.clone()));
            }
            (id, replay)
        };
        if let Some(event) = replay {
            Self::run_one(&cb, &event);
        }
        Ok(id)
    }

    /// Remove a subscription by id. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock();
        for slot in inner.subs.values_mut() {
            slot.retain(|(sid, _)| *sid != id);
        }
    }

    /// Remove every registration of `cb` (identity match on the supplied
    /// `Arc`), from one event type or from all of them.
    pub fn clear_sub(&self, cb: &EventCallback, event_type: Option<&str>) {
        let ty = event_type.and_then(|t| self.resolve(Some(t)).ok());
        let mut inner = self.inner.lock();
        for (slot_ty, slot) in inner.subs.iter_mut() {
            if ty.is_some() && ty != Some(*slot_ty) {
                continue;
            }
            slot.retain(|(_, existing)| !Arc::ptr_eq(existing, cb));
        }
    }

    /// Drop every subscriber.
    pub fn unsubscribe_all(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.subs.values_mut() {
            slot.clear();
        }
    }

    /// Drop every subscriber of one event type (the cache survives). Used to
    /// reset single-request channels such as a positioner's req-done.
    pub fn reset(&self, event_type: &str) -> Result<()> {
        let ty = self.resolve(Some(event_type))?;
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.subs.get_mut(ty) {
            slot.clear();
        }
        Ok(())
    }

    /// Number of live subscriptions for one event type.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        match self.resolve(Some(event_type)) {
            Ok(ty) => self
                .inner
                .lock()
                .subs
                .get(ty)
                .map(Vec::len)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Fire an event: fill in `obj` and `timestamp` if absent, cache it for
    /// replay, then invoke the current subscribers in insertion order.
    ///
    /// Firing an undeclared event type is an error.
    pub fn run_subs(&self, mut event: Event) -> Result<()> {
        let ty = self.resolve(Some(event.sub_type))?;
        event.sub_type = ty;
        if event.obj.is_empty() {
            event.obj = self.obj.read().clone();
        }
        if event.timestamp.is_none() {
            event.timestamp = Some(unix_ts());
        }
        let callbacks: Vec<EventCallback> = {
            let mut inner = self.inner.lock();
            inner.cache.insert(ty, event.clone());
            inner
                .subs
                .get(ty)
                .map(|slot| slot.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };
        for cb in callbacks {
            Self::run_one(&cb, &event);
        }
        Ok(())
    }

    /// Invoke one callback, isolating panics.
    fn run_one(cb: &EventCallback, event: &Event) {
        let result = catch_unwind(AssertUnwindSafe(|| cb(event)));
        if result.is_err() {
            error!(
                obj = %event.obj,
                sub_type = event.sub_type,
                "subscription callback panicked"
            );
        }
    }

    /// Tear down the bus: clear all subscriptions and the replay cache.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.subs.values_mut() {
            slot.clear();
        }
        inner.cache.clear();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("obj", &*self.obj.read())
            .field("event_types", &self.declared)
            .finish_non_exhaustive()
    }
}
