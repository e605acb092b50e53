//! Assembled simulated devices built from linked signals.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use beamline_core::component::{BuildContext, ChildFactory, ComponentSpec, DeviceSchema};
use beamline_core::device::{Child, Device};
use beamline_core::error::{HalError, Result};
use beamline_core::kind::Kind;
use beamline_core::signal::LinkedSignal;

const LINK_SET_TIMEOUT: Duration = Duration::from_secs(5);

fn make_linked(ctx: &BuildContext, kind: Kind, read_only: bool) -> Result<Child> {
    let factory = ctx.link_factory.as_ref().ok_or_else(|| HalError::Link {
        signal: ctx.child_name.clone(),
        message: "no link factory on the owning device".to_string(),
    })?;
    let link = factory.make(&ctx.address)?;
    let mut signal = LinkedSignal::new(ctx.child_name.clone(), link)?
        .with_kind(kind)
        .with_set_timeout(LINK_SET_TIMEOUT);
    if read_only {
        signal = signal.read_only();
    }
    Ok(Child::Signal(Arc::new(signal)))
}

/// Component factory producing a writable linked signal.
pub fn linked_signal(kind: Kind) -> ChildFactory {
    Arc::new(move |ctx: &BuildContext| make_linked(ctx, kind, false))
}

/// Component factory producing a read-only linked signal (hardware feeds it,
/// callers cannot write).
pub fn linked_signal_ro(kind: Kind) -> ChildFactory {
    Arc::new(move |ctx: &BuildContext| make_linked(ctx, kind, true))
}

/// Schema of the simulated area detector: an acquire trigger, exposure and
/// gain configuration, and a read-only data channel.
pub fn detector_schema() -> Result<Arc<DeviceSchema>> {
    Ok(Arc::new(
        DeviceSchema::builder()
            .component(
                ComponentSpec::new("acquire", ".ACQ", linked_signal(Kind::NORMAL))
                    .with_trigger_value(json!(1)),
            )
            .component(
                ComponentSpec::new("exposure_time", ".EXP", linked_signal(Kind::CONFIG))
                    .with_kind(Kind::CONFIG),
            )
            .component(
                ComponentSpec::new("gain", ".GAIN", linked_signal(Kind::CONFIG))
                    .with_kind(Kind::CONFIG),
            )
            .component(ComponentSpec::new(
                "data",
                ".DATA",
                linked_signal_ro(Kind::HINTED),
            ))
            .build()?,
    ))
}

/// Build the simulated detector. Staging drops the exposure to a known
/// value and restores the operator's setting on unstage.
pub fn sim_detector(
    name: &str,
    prefix: &str,
    links: Arc<dyn beamline_core::signal::LinkFactory>,
) -> Result<Device> {
    Device::builder(name, prefix, detector_schema()?)
        .with_link_factory(links)
        .with_stage_sig("exposure_time", json!(0.1))
        .build()
}
