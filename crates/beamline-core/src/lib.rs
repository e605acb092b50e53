//! `beamline-core`
//!
//! Hardware-abstraction core for beamline instrumentation: a typed object
//! model for signals, composite devices, and positioners, independent of any
//! particular control-system backend.
//!
//! ## Building blocks
//!
//! - [`Status`] / [`MoveStatus`]: completion handles for asynchronous
//!   operations, with callbacks, timeouts, and combination via `&`
//! - [`EventBus`]: per-object pub/sub with cached replay for late subscribers
//! - [`Signal`] / [`LinkedSignal`]: leaf control points, soft or bound to a
//!   [`ControlLink`] backend
//! - [`DeviceSchema`] / [`Device`]: declarative composition with kind-based
//!   read filtering and a transactional staging protocol
//! - [`Positioner`] / [`SoftPositioner`]: the scalar motion protocol
//! - [`PseudoPositioner`]: virtual coordinate systems over real axes
//!
//! A control backend integrates by implementing [`ControlLink`] and
//! [`LinkFactory`]; everything above that boundary is backend-agnostic.

pub mod component;
pub mod device;
pub mod error;
pub mod kind;
pub mod object;
pub mod positioner;
pub mod pseudo;
pub mod signal;
pub mod status;

pub use component::{BuildContext, ChildFactory, ComponentSpec, DeviceSchema, SchemaBuilder};
pub use device::{Child, Device, DeviceBuilder, Staged};
pub use error::{HalError, Result};
pub use kind::Kind;
pub use object::{Event, EventBus, EventCallback, ObjectMeta, SubscriptionId};
pub use positioner::{MoveOptions, Positioner, PositionerCore, SoftPositioner};
pub use pseudo::{PseudoAxis, PseudoPositioner};
pub use signal::{
    ControlLink, EntryDescription, LinkFactory, LinkedSignal, Reading, Signal, SignalLike,
};
pub use status::{MoveStatus, Status};
