//! Declarative component slots and device schemas.
//!
//! A [`DeviceSchema`] is an ordered registry of [`ComponentSpec`]s describing
//! the children a device owns: the slot name, the address suffix, laziness,
//! per-child [`Kind`], and a factory closure that builds the child. Schemas
//! compose: a builder seeded with [`SchemaBuilder::inherit`] walks the base
//! schema first, and same-named slots added later override in place so the
//! base-relative declaration order is preserved.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use strfmt::strfmt;

use crate::device::Child;
use crate::error::{HalError, Result};
use crate::kind::Kind;
use crate::signal::LinkFactory;

/// Attribute names that collide with the device protocol itself and can
/// never be component slots.
static RESERVED_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "name",
        "parent",
        "kind",
        "prefix",
        "read",
        "describe",
        "read_configuration",
        "describe_configuration",
        "configure",
        "stage",
        "unstage",
        "trigger",
        "stop",
        "subscribe",
        "unsubscribe",
        "destroy",
        "wait_for_connection",
        "get_child",
        "component_names",
        "walk_components",
    ])
});

/// Everything a component factory needs to build its child.
pub struct BuildContext {
    /// Full name of the parent device.
    pub parent_name: String,
    /// Name the child should take, `"{parent_name}_{attr}"`.
    pub child_name: String,
    /// Slot name on the parent.
    pub attr: String,
    /// Resolved suffix (formatted templates already substituted).
    pub suffix: String,
    /// Full control address. Prefix-concatenated unless the slot opted out.
    pub address: String,
    pub kind: Kind,
    /// Backend link factory, when the owning device carries one.
    pub link_factory: Option<Arc<dyn LinkFactory>>,
}

/// Factory closure building one child from its resolved context.
pub type ChildFactory = Arc<dyn Fn(&BuildContext) -> Result<Child> + Send + Sync>;

/// One declared child slot on a device schema.
#[derive(Clone)]
pub struct ComponentSpec {
    attr: String,
    suffix: String,
    lazy: bool,
    kind: Kind,
    trigger_value: Option<Value>,
    /// Treat `suffix` as a `strfmt` template over the parent's fields.
    formatted: bool,
    /// Prepend the parent prefix when forming the address.
    add_prefix: bool,
    /// The factory builds a sub-device, so staging recurses into it.
    is_device: bool,
    factory: ChildFactory,
}

impl ComponentSpec {
    pub fn new(
        attr: impl Into<String>,
        suffix: impl Into<String>,
        factory: ChildFactory,
    ) -> Self {
        ComponentSpec {
            attr: attr.into(),
            suffix: suffix.into(),
            lazy: false,
            kind: Kind::NORMAL,
            trigger_value: None,
            formatted: false,
            add_prefix: true,
            is_device: false,
            factory,
        }
    }

    /// Defer construction until first access instead of building eagerly.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn with_kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    /// Value written to this child by `Device::trigger`.
    pub fn with_trigger_value(mut self, value: Value) -> Self {
        self.trigger_value = Some(value);
        self
    }

    /// Interpret the suffix as a template over `{prefix}` and the parent's
    /// instance fields.
    pub fn formatted(mut self) -> Self {
        self.formatted = true;
        self
    }

    /// Use the suffix as a complete address, without the parent prefix.
    pub fn bare_suffix(mut self) -> Self {
        self.add_prefix = false;
        self
    }

    /// Mark this slot as a sub-device.
    pub fn device(mut self) -> Self {
        self.is_device = true;
        self
    }

    pub fn attr(&self) -> &str {
        &self.attr
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn trigger_value(&self) -> Option<&Value> {
        self.trigger_value.as_ref()
    }

    pub fn is_device(&self) -> bool {
        self.is_device
    }

    /// Resolve this slot against a parent instance. `fields` feeds formatted
    /// suffix templates alongside `{prefix}`.
    pub fn resolve(
        &self,
        parent_name: &str,
        parent_prefix: &str,
        fields: &HashMap<String, String>,
        link_factory: Option<Arc<dyn LinkFactory>>,
    ) -> Result<BuildContext> {
        let suffix = if self.formatted {
            let mut vars = fields.clone();
            vars.insert("prefix".to_string(), parent_prefix.to_string());
            strfmt(&self.suffix, &vars).map_err(|err| HalError::InvalidValue {
                name: format!("{parent_name}.{}", self.attr),
                message: format!("suffix template {:?}: {err}", self.suffix),
            })?
        } else {
            self.suffix.clone()
        };
        let address = if self.add_prefix {
            format!("{parent_prefix}{suffix}")
        } else {
            suffix.clone()
        };
        Ok(BuildContext {
            parent_name: parent_name.to_string(),
            child_name: format!("{parent_name}_{}", self.attr),
            attr: self.attr.clone(),
            suffix,
            address,
            kind: self.kind,
            link_factory,
        })
    }

    /// Build the child from a resolved context.
    pub fn build(&self, ctx: &BuildContext) -> Result<Child> {
        (self.factory)(ctx)
    }
}

impl std::fmt::Debug for ComponentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentSpec")
            .field("attr", &self.attr)
            .field("suffix", &self.suffix)
            .field("lazy", &self.lazy)
            .field("kind", &self.kind)
            .field("is_device", &self.is_device)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// DeviceSchema
// =============================================================================

/// Ordered, validated component registry shared by all instances of one
/// device type.
#[derive(Debug, Clone)]
pub struct DeviceSchema {
    components: Vec<ComponentSpec>,
}

impl DeviceSchema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Components in declaration order.
    pub fn components(&self) -> impl Iterator<Item = &ComponentSpec> {
        self.components.iter()
    }

    pub fn get(&self, attr: &str) -> Option<&ComponentSpec> {
        self.components.iter().find(|spec| spec.attr == attr)
    }

    pub fn component_names(&self) -> Vec<&str> {
        self.components.iter().map(|spec| spec.attr.as_str()).collect()
    }

    /// Slots holding sub-devices, in declaration order. Staging recurses
    /// through these.
    pub fn sub_device_attrs(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|spec| spec.is_device)
            .map(|spec| spec.attr.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

/// Builds a [`DeviceSchema`], with in-place override semantics for
/// inherited or repeated slot names.
#[derive(Default)]
pub struct SchemaBuilder {
    components: Vec<ComponentSpec>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        SchemaBuilder { components: Vec::new() }
    }

    /// Seed from a base schema; later `component` calls with the same attr
    /// replace the base entry without moving it.
    pub fn inherit(base: &DeviceSchema) -> Self {
        SchemaBuilder {
            components: base.components.clone(),
        }
    }

    pub fn component(mut self, spec: ComponentSpec) -> Self {
        if let Some(existing) = self
            .components
            .iter_mut()
            .find(|existing| existing.attr == spec.attr)
        {
            *existing = spec;
        } else {
            self.components.push(spec);
        }
        self
    }

    /// Validate and freeze. Slot names that collide with the device
    /// protocol are rejected here, at type-definition time.
    pub fn build(self) -> Result<DeviceSchema> {
        for spec in &self.components {
            if RESERVED_NAMES.contains(spec.attr.as_str()) {
                return Err(HalError::ReservedName(spec.attr.clone()));
            }
        }
        Ok(DeviceSchema {
            components: self.components,
        })
    }
}

// =============================================================================
// Dynamic groups
// =============================================================================

/// Cache of synthesized group schemas, one entry per distinct definition.
static GROUP_SCHEMAS: Lazy<Mutex<HashMap<String, Arc<DeviceSchema>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Synthesize the schema for a numbered group of identical slots:
/// `attr_prefix{i}` with suffix `suffix_template` (`{index}` substituted),
/// one per `range` element. Definitions are memoized, so every group
/// component with the same shape shares one schema.
pub fn dynamic_schema(
    attr_prefix: &str,
    range: Range<usize>,
    suffix_template: &str,
    kind: Kind,
    factory: ChildFactory,
) -> Result<Arc<DeviceSchema>> {
    let key = format!(
        "{attr_prefix}|{}..{}|{suffix_template}|{:?}",
        range.start, range.end, kind
    );
    if let Some(schema) = GROUP_SCHEMAS.lock().get(&key) {
        return Ok(schema.clone());
    }

    let mut builder = SchemaBuilder::new();
    for index in range {
        let mut vars = HashMap::new();
        vars.insert("index".to_string(), index.to_string());
        let suffix = strfmt(suffix_template, &vars).map_err(|err| HalError::InvalidValue {
            name: format!("{attr_prefix}{index}"),
            message: format!("suffix template {suffix_template:?}: {err}"),
        })?;
        builder = builder.component(
            ComponentSpec::new(format!("{attr_prefix}{index}"), suffix, factory.clone())
                .with_kind(kind),
        );
    }
    let schema = Arc::new(builder.build()?);
    GROUP_SCHEMAS.lock().insert(key, schema.clone());
    Ok(schema)
}
