//! Devices: composite hardware objects with a staging protocol.
//!
//! A [`Device`] owns children declared by a [`DeviceSchema`]: signals at the
//! leaves and sub-devices below it. Reading walks the tree in declaration
//! order, filtered by each child's [`Kind`]. Staging applies `stage_sigs`
//! with confirmation, keeping a restoration list so `unstage` can put the
//! hardware back exactly, and rolls itself back on any failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::component::{ChildFactory, ComponentSpec, DeviceSchema};
use crate::error::{HalError, Result};
use crate::kind::Kind;
use crate::object::{Event, EventBus, EventCallback, ObjectMeta, SubscriptionId};
use crate::signal::{set_and_wait, EntryDescription, LinkFactory, Reading, SignalLike};
use crate::status::Status;

/// Fired when an acquisition started by `trigger` completes.
pub const SUB_ACQ_DONE: &str = "acq_done";
/// Fired on staging-state transitions, value is the new state.
pub const SUB_STATE: &str = "state";

pub const DEVICE_EVENTS: &[&str] = &[SUB_ACQ_DONE, SUB_STATE];

const DEFAULT_SET_TIMEOUT: Duration = Duration::from_secs(10);

/// Staging state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Staged {
    No,
    Partially,
    Yes,
}

impl std::fmt::Display for Staged {
    /// Adverb form, reads naturally in "device is {} staged".
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = match self {
            Staged::No => "not",
            Staged::Partially => "partially",
            Staged::Yes => "already",
        };
        f.write_str(word)
    }
}

/// A built child instance: a leaf signal or a nested device.
#[derive(Clone)]
pub enum Child {
    Signal(Arc<dyn SignalLike>),
    Device(Arc<Device>),
}

impl Child {
    pub fn kind(&self) -> Kind {
        match self {
            Child::Signal(sig) => sig.kind(),
            Child::Device(dev) => dev.kind(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Child::Signal(sig) => sig.name(),
            Child::Device(dev) => dev.name(),
        }
    }
}

impl std::fmt::Debug for Child {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Child::Signal(sig) => write!(f, "Signal({})", sig.name()),
            Child::Device(dev) => write!(f, "Device({})", dev.name()),
        }
    }
}

// =============================================================================
// Device
// =============================================================================

pub struct Device {
    meta: ObjectMeta,
    events: Arc<EventBus>,
    prefix: String,
    schema: Arc<DeviceSchema>,
    children: Mutex<HashMap<String, Child>>,
    /// Instance fields available to formatted component suffixes.
    fields: HashMap<String, String>,
    link_factory: Option<Arc<dyn LinkFactory>>,
    /// Dotted signal path → value to apply while staged. Order matters.
    stage_sigs: Mutex<Vec<(String, Value)>>,
    staged: Mutex<Staged>,
    /// Originals committed during stage, in application order.
    restore: Mutex<Vec<(String, Value)>>,
    /// Dotted signal path → value written by `stop`.
    stop_values: Vec<(String, Value)>,
    set_timeout: Duration,
}

pub struct DeviceBuilder {
    name: String,
    prefix: String,
    schema: Arc<DeviceSchema>,
    kind: Kind,
    fields: HashMap<String, String>,
    link_factory: Option<Arc<dyn LinkFactory>>,
    stage_sigs: Vec<(String, Value)>,
    stop_values: Vec<(String, Value)>,
    set_timeout: Duration,
}

impl DeviceBuilder {
    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    /// Instance field consumed by formatted component suffixes.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_link_factory(mut self, factory: Arc<dyn LinkFactory>) -> Self {
        self.link_factory = Some(factory);
        self
    }

    /// Append a staged setting: `path` is a dotted component path resolved
    /// at stage time.
    pub fn with_stage_sig(mut self, path: impl Into<String>, value: Value) -> Self {
        self.stage_sigs.push((path.into(), value));
        self
    }

    /// Value written to `path` when the device is stopped.
    pub fn with_stop_value(mut self, path: impl Into<String>, value: Value) -> Self {
        self.stop_values.push((path.into(), value));
        self
    }

    /// Timeout for confirmed writes issued by staging and configure.
    pub fn with_set_timeout(mut self, timeout: Duration) -> Self {
        self.set_timeout = timeout;
        self
    }

    /// Build the device, constructing eager children in declaration order.
    pub fn build(self) -> Result<Device> {
        let meta = ObjectMeta::new(self.name.clone()).with_kind(self.kind);
        let device = Device {
            events: Arc::new(EventBus::new(self.name, DEVICE_EVENTS, Some(SUB_ACQ_DONE))),
            meta,
            prefix: self.prefix,
            schema: self.schema,
            children: Mutex::new(HashMap::new()),
            fields: self.fields,
            link_factory: self.link_factory,
            stage_sigs: Mutex::new(self.stage_sigs),
            staged: Mutex::new(Staged::No),
            restore: Mutex::new(Vec::new()),
            stop_values: self.stop_values,
            set_timeout: self.set_timeout,
        };
        let eager: Vec<String> = device
            .schema
            .components()
            .filter(|spec| !spec.is_lazy())
            .map(|spec| spec.attr().to_string())
            .collect();
        for attr in eager {
            device.get_child(&attr)?;
        }
        Ok(device)
    }
}

impl Device {
    pub fn builder(
        name: impl Into<String>,
        prefix: impl Into<String>,
        schema: Arc<DeviceSchema>,
    ) -> DeviceBuilder {
        DeviceBuilder {
            name: name.into(),
            prefix: prefix.into(),
            schema,
            kind: Kind::NORMAL,
            fields: HashMap::new(),
            link_factory: None,
            stage_sigs: Vec::new(),
            stop_values: Vec::new(),
            set_timeout: DEFAULT_SET_TIMEOUT,
        }
    }

    pub fn name(&self) -> String {
        self.meta.name()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn kind(&self) -> Kind {
        self.meta.kind()
    }

    pub fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    pub fn schema(&self) -> &Arc<DeviceSchema> {
        &self.schema
    }

    pub fn staged(&self) -> Staged {
        *self.staged.lock()
    }

    pub fn component_names(&self) -> Vec<&str> {
        self.schema.component_names()
    }

    pub fn stage_sigs(&self) -> Vec<(String, Value)> {
        self.stage_sigs.lock().clone()
    }

    /// Add or override one staged setting.
    pub fn set_stage_sig(&self, path: impl Into<String>, value: Value) {
        let path = path.into();
        let mut sigs = self.stage_sigs.lock();
        if let Some(entry) = sigs.iter_mut().find(|(existing, _)| *existing == path) {
            entry.1 = value;
        } else {
            sigs.push((path, value));
        }
    }

    pub fn subscribe(
        &self,
        cb: EventCallback,
        event_type: Option<&str>,
        run: bool,
    ) -> Result<SubscriptionId> {
        self.events.subscribe(cb, event_type, run)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.events.unsubscribe(id);
    }

    // -- children -------------------------------------------------------------

    /// Fetch a child by slot name, building it now if the slot is lazy and
    /// this is the first access. Built children are never replaced.
    pub fn get_child(&self, attr: &str) -> Result<Child> {
        let mut children = self.children.lock();
        if let Some(child) = children.get(attr) {
            return Ok(child.clone());
        }
        let spec = self.schema.get(attr).ok_or_else(|| HalError::UnknownComponent {
            device: self.meta.name(),
            attr: attr.to_string(),
        })?;
        let ctx = spec.resolve(
            &self.meta.name(),
            &self.prefix,
            &self.fields,
            self.link_factory.clone(),
        )?;
        let child = spec.build(&ctx)?;
        children.insert(attr.to_string(), child.clone());
        Ok(child)
    }

    /// Resolve a dotted component path (`"inner.setpoint"`) to a leaf signal.
    pub fn resolve_signal(&self, path: &str) -> Result<Arc<dyn SignalLike>> {
        let unknown = || HalError::UnknownComponent {
            device: self.meta.name(),
            attr: path.to_string(),
        };
        let mut segments = path.split('.');
        let first = segments.next().filter(|s| !s.is_empty()).ok_or_else(unknown)?;
        let mut child = self.get_child(first)?;
        for segment in segments {
            match child {
                Child::Device(dev) => child = dev.get_child(segment)?,
                Child::Signal(_) => return Err(unknown()),
            }
        }
        match child {
            Child::Signal(sig) => Ok(sig),
            Child::Device(_) => Err(unknown()),
        }
    }

    /// All components, recursively, as (dotted path, child) pairs. Forces
    /// lazy slots to build.
    pub fn walk_components(&self) -> Result<Vec<(String, Child)>> {
        let mut out = Vec::new();
        for spec in self.schema.components() {
            let child = self.get_child(spec.attr())?;
            out.push((spec.attr().to_string(), child.clone()));
            if let Child::Device(dev) = child {
                for (path, sub) in dev.walk_components()? {
                    out.push((format!("{}.{path}", spec.attr()), sub));
                }
            }
        }
        Ok(out)
    }

    fn kind_attrs(&self, leaf: fn(Kind) -> bool, recurse: fn(Kind) -> bool) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for spec in self.schema.components() {
            let child = self.get_child(spec.attr())?;
            match child {
                Child::Signal(sig) => {
                    if leaf(sig.kind()) {
                        out.push(spec.attr().to_string());
                    }
                }
                Child::Device(dev) => {
                    if recurse(dev.kind()) {
                        for path in dev.kind_attrs(leaf, recurse)? {
                            out.push(format!("{}.{path}", spec.attr()));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// Dotted paths of the children included in `read()`.
    pub fn read_attrs(&self) -> Result<Vec<String>> {
        self.kind_attrs(Kind::normal, Kind::normal)
    }

    /// Dotted paths of the children included in `read_configuration()`.
    /// Non-omitted sub-devices always contribute their configuration
    /// children, whatever their own kind says about readings.
    pub fn configuration_attrs(&self) -> Result<Vec<String>> {
        self.kind_attrs(Kind::config, |kind| !kind.is_empty())
    }

    /// Reading keys of hinted children, for downstream display layers.
    pub fn hints(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for (_, child) in self.walk_components()? {
            if let Child::Signal(sig) = child {
                if sig.kind().hinted() {
                    out.push(sig.name());
                }
            }
        }
        Ok(out)
    }

    // -- reading --------------------------------------------------------------

    fn collect_readings(
        &self,
        leaf: fn(Kind) -> bool,
        recurse: fn(Kind) -> bool,
    ) -> Result<Vec<(String, Reading)>> {
        let mut out = Vec::new();
        for spec in self.schema.components() {
            match self.get_child(spec.attr())? {
                Child::Signal(sig) => {
                    if leaf(sig.kind()) {
                        out.extend(sig.read()?);
                    }
                }
                Child::Device(dev) => {
                    if recurse(dev.kind()) {
                        out.extend(dev.collect_readings(leaf, recurse)?);
                    }
                }
            }
        }
        Ok(out)
    }

    fn collect_descriptions(
        &self,
        leaf: fn(Kind) -> bool,
        recurse: fn(Kind) -> bool,
    ) -> Result<Vec<(String, EntryDescription)>> {
        let mut out = Vec::new();
        for spec in self.schema.components() {
            match self.get_child(spec.attr())? {
                Child::Signal(sig) => {
                    if leaf(sig.kind()) {
                        out.extend(sig.describe()?);
                    }
                }
                Child::Device(dev) => {
                    if recurse(dev.kind()) {
                        out.extend(dev.collect_descriptions(leaf, recurse)?);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Flat declaration-ordered readings over the normal children.
    pub fn read(&self) -> Result<Vec<(String, Reading)>> {
        self.collect_readings(Kind::normal, Kind::normal)
    }

    pub fn describe(&self) -> Result<Vec<(String, EntryDescription)>> {
        self.collect_descriptions(Kind::normal, Kind::normal)
    }

    pub fn read_configuration(&self) -> Result<Vec<(String, Reading)>> {
        self.collect_readings(Kind::config, |kind| !kind.is_empty())
    }

    pub fn describe_configuration(&self) -> Result<Vec<(String, EntryDescription)>> {
        self.collect_descriptions(Kind::config, |kind| !kind.is_empty())
    }

    /// Apply configuration changes keyed by dotted component path; each
    /// target must be a configuration child. Returns the configuration
    /// readings before and after.
    pub fn configure(
        &self,
        changes: &[(String, Value)],
    ) -> Result<(Vec<(String, Reading)>, Vec<(String, Reading)>)> {
        let old = self.read_configuration()?;
        for (path, value) in changes {
            let sig = self.resolve_signal(path)?;
            if !sig.kind().config() {
                return Err(HalError::NotConfigurable {
                    device: self.meta.name(),
                    attr: path.clone(),
                });
            }
            set_and_wait(sig.as_ref(), value.clone(), self.set_timeout)?;
        }
        let new = self.read_configuration()?;
        Ok((old, new))
    }

    // -- staging --------------------------------------------------------------

    fn fire_state(&self) {
        let state = *self.staged.lock();
        if let Ok(value) = serde_json::to_value(state) {
            let _ = self.events.run_subs(Event::new(SUB_STATE).with_value(value));
        }
    }

    /// Prepare the device for acquisition: apply every `stage_sigs` entry in
    /// order with confirmation, then stage sub-devices in declaration order.
    ///
    /// On any failure the device unstages itself, restoring whatever was
    /// already applied, and the original error is returned; the device ends
    /// back in the unstaged state. Staging an already-staged device is an
    /// error. Returns the names of everything staged, self first.
    pub fn stage(&self) -> Result<Vec<String>> {
        {
            let mut staged = self.staged.lock();
            match *staged {
                Staged::No => {}
                state => {
                    return Err(HalError::RedundantStaging {
                        device: self.meta.name(),
                        state,
                    })
                }
            }
            *staged = Staged::Partially;
        }
        self.fire_state();
        debug!(device = %self.meta.name(), "staging");

        match self.apply_stage() {
            Ok(names) => {
                *self.staged.lock() = Staged::Yes;
                self.fire_state();
                Ok(names)
            }
            Err(err) => {
                warn!(device = %self.meta.name(), error = %err, "staging failed, rolling back");
                if let Err(rollback) = self.unstage() {
                    warn!(device = %self.meta.name(), error = %rollback, "rollback incomplete");
                }
                Err(err)
            }
        }
    }

    fn apply_stage(&self) -> Result<Vec<String>> {
        let sigs = self.stage_sigs.lock().clone();

        // Snapshot every original before touching anything.
        let mut originals = Vec::with_capacity(sigs.len());
        for (path, _) in &sigs {
            let sig = self.resolve_signal(path)?;
            originals.push(sig.get()?);
        }

        // Apply in order; each original is committed to the restoration list
        // only after its setting is confirmed, so rollback touches exactly
        // the signals that were changed.
        for ((path, value), original) in sigs.iter().zip(originals) {
            let sig = self.resolve_signal(path)?;
            debug!(device = %self.meta.name(), signal = %path, "applying stage value");
            set_and_wait(sig.as_ref(), value.clone(), self.set_timeout)?;
            self.restore.lock().push((path.clone(), original));
        }

        let mut names = vec![self.meta.name()];
        for attr in self.schema.sub_device_attrs() {
            if let Child::Device(dev) = self.get_child(attr)? {
                names.extend(dev.stage()?);
            }
        }
        Ok(names)
    }

    /// Undo `stage`: unstage sub-devices in reverse declaration order, then
    /// restore this device's originals in reverse application order.
    /// Safe to call from any staging state; unstaging an unstaged device is
    /// a no-op that still reports success.
    pub fn unstage(&self) -> Result<Vec<String>> {
        *self.staged.lock() = Staged::Partially;
        self.fire_state();
        debug!(device = %self.meta.name(), "unstaging");

        let mut names = vec![self.meta.name()];
        for attr in self.schema.sub_device_attrs().iter().rev() {
            if let Child::Device(dev) = self.get_child(attr)? {
                names.extend(dev.unstage()?);
            }
        }

        // Pop each original only after it is restored, so a failure leaves
        // the rest restorable and the device partially staged.
        loop {
            let entry = self.restore.lock().last().cloned();
            let Some((path, original)) = entry else { break };
            let sig = self.resolve_signal(&path)?;
            set_and_wait(sig.as_ref(), original, self.set_timeout)?;
            self.restore.lock().pop();
        }

        *self.staged.lock() = Staged::No;
        self.fire_state();
        Ok(names)
    }

    // -- acquisition / control ------------------------------------------------

    /// Start an acquisition by writing each component's trigger value.
    /// The returned status completes when every triggered write is in
    /// effect, and the acquisition-done event fires with it.
    pub fn trigger(&self) -> Result<Status> {
        let mut combined: Option<Status> = None;
        for spec in self.schema.components() {
            let Some(value) = spec.trigger_value() else { continue };
            if let Child::Signal(sig) = self.get_child(spec.attr())? {
                let status = sig.set(value.clone())?;
                combined = Some(match combined {
                    Some(acc) => Status::and(&acc, &status),
                    None => status,
                });
            }
        }
        let status = match combined {
            Some(status) => status,
            None => {
                let status = Status::new(self.meta.name());
                status.set_finished();
                status
            }
        };
        let events = self.events.clone();
        let done = status.clone();
        status.add_callback(move || {
            let success = done.success().unwrap_or(false);
            let _ = events.run_subs(Event::new(SUB_ACQ_DONE).with_success(success));
        });
        Ok(status)
    }

    /// Halt activity: write the configured stop values, then stop every
    /// sub-device. All failures are collected rather than short-circuiting,
    /// so one bad child never prevents stopping the rest.
    pub fn stop(&self) -> Result<()> {
        let mut errors = Vec::new();
        for (path, value) in &self.stop_values {
            let outcome = self
                .resolve_signal(path)
                .and_then(|sig| sig.put(value.clone()));
            if let Err(err) = outcome {
                errors.push(err);
            }
        }
        for attr in self.schema.sub_device_attrs() {
            match self.get_child(attr) {
                Ok(Child::Device(dev)) => {
                    if let Err(err) = dev.stop() {
                        errors.push(err);
                    }
                }
                Ok(Child::Signal(_)) => {}
                Err(err) => errors.push(err),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(HalError::StopErrors {
                device: self.meta.name(),
                errors,
            })
        }
    }

    pub fn connected(&self) -> bool {
        let children = self.children.lock().values().cloned().collect::<Vec<_>>();
        children.iter().all(|child| match child {
            Child::Signal(sig) => sig.connected(),
            Child::Device(dev) => dev.connected(),
        })
    }

    /// Block until every signal in the tree reports connected. Forces lazy
    /// slots to build.
    pub fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        for (_, child) in self.walk_components()? {
            if let Child::Signal(sig) = child {
                let remaining = deadline
                    .saturating_duration_since(std::time::Instant::now());
                sig.wait_for_connection(remaining)?;
            }
        }
        Ok(())
    }

    /// Tear down subscriptions on this device and every built child.
    pub fn destroy(&self) {
        let children = self.children.lock().values().cloned().collect::<Vec<_>>();
        for child in children {
            match child {
                Child::Signal(sig) => sig.destroy(),
                Child::Device(dev) => dev.destroy(),
            }
        }
        self.events.destroy();
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.meta.name())
            .field("prefix", &self.prefix)
            .field("staged", &*self.staged.lock())
            .field("components", &self.schema.component_names())
            .finish_non_exhaustive()
    }
}

/// Component spec for a nested device slot built from `schema`, inheriting
/// the parent's link factory and the slot kind.
pub fn sub_device(
    attr: impl Into<String>,
    suffix: impl Into<String>,
    schema: Arc<DeviceSchema>,
) -> ComponentSpec {
    let factory: ChildFactory = Arc::new(move |ctx| {
        let mut builder = Device::builder(ctx.child_name.clone(), ctx.address.clone(), schema.clone())
            .with_kind(ctx.kind);
        if let Some(links) = ctx.link_factory.clone() {
            builder = builder.with_link_factory(links);
        }
        Ok(Child::Device(Arc::new(builder.build()?)))
    });
    ComponentSpec::new(attr, suffix, factory).device()
}
