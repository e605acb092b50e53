//! End-to-end staging behavior over nested device trees.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use beamline_core::component::{BuildContext, ChildFactory, ComponentSpec, DeviceSchema};
use beamline_core::device::{sub_device, Child, Device, Staged};
use beamline_core::{HalError, Kind, Signal, SignalLike};

fn soft(kind: Kind) -> ChildFactory {
    Arc::new(move |ctx: &BuildContext| {
        Ok(Child::Signal(Arc::new(
            Signal::with_value(ctx.child_name.clone(), json!(0.0)).with_kind(kind),
        )))
    })
}

fn read_only_factory() -> ChildFactory {
    Arc::new(|ctx: &BuildContext| {
        Ok(Child::Signal(Arc::new(
            Signal::with_value(ctx.child_name.clone(), json!(0.0)).read_only(),
        )))
    })
}

fn axis_schema() -> Arc<DeviceSchema> {
    Arc::new(
        DeviceSchema::builder()
            .component(ComponentSpec::new("setpoint", ".VAL", soft(Kind::NORMAL)))
            .component(
                ComponentSpec::new("velocity", ".VELO", soft(Kind::CONFIG)).with_kind(Kind::CONFIG),
            )
            .build()
            .unwrap(),
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn rig() -> Device {
    init_tracing();
    let schema = Arc::new(
        DeviceSchema::builder()
            .component(ComponentSpec::new("mode", ".MODE", soft(Kind::CONFIG)))
            .component(sub_device("x", ":X", axis_schema()))
            .component(sub_device("y", ":Y", axis_schema()))
            .build()
            .unwrap(),
    );
    Device::builder("rig", "SIM:rig", schema)
        .with_stage_sig("mode", json!("step"))
        .with_stage_sig("x.velocity", json!(0.5))
        .build()
        .unwrap()
}

fn value_of(dev: &Device, path: &str) -> Value {
    dev.resolve_signal(path).unwrap().get().unwrap()
}

#[test]
fn stage_unstage_cycle_restores_the_whole_tree() {
    let dev = rig();
    dev.resolve_signal("x.velocity").unwrap().put(json!(2.0)).unwrap();

    let staged = dev.stage().unwrap();
    assert_eq!(staged, vec!["rig", "rig_x", "rig_y"]);
    assert_eq!(value_of(&dev, "mode"), json!("step"));
    assert_eq!(value_of(&dev, "x.velocity"), json!(0.5));

    dev.unstage().unwrap();
    assert_eq!(dev.staged(), Staged::No);
    assert_eq!(value_of(&dev, "mode"), json!(0.0));
    assert_eq!(value_of(&dev, "x.velocity"), json!(2.0));
}

#[test]
fn repeated_cycles_stay_consistent() {
    let dev = rig();
    for _ in 0..3 {
        dev.stage().unwrap();
        assert_eq!(dev.staged(), Staged::Yes);
        dev.unstage().unwrap();
        assert_eq!(dev.staged(), Staged::No);
    }
    // Extra unstages between cycles are harmless.
    dev.unstage().unwrap();
    dev.stage().unwrap();
    dev.unstage().unwrap();
    assert_eq!(value_of(&dev, "x.velocity"), json!(0.0));
}

#[test]
fn sub_device_failure_rolls_back_parent_and_siblings() {
    // The second sub-device has an unwritable stage signal, so staging the
    // parent must fail after the parent's own sigs and the first sub-device
    // were already applied.
    let good = Arc::new(
        DeviceSchema::builder()
            .component(ComponentSpec::new("gain", ".GAIN", soft(Kind::CONFIG)))
            .build()
            .unwrap(),
    );
    let bad = Arc::new(
        DeviceSchema::builder()
            .component(ComponentSpec::new("interlock", ".ILK", read_only_factory()))
            .build()
            .unwrap(),
    );
    let schema = Arc::new(
        DeviceSchema::builder()
            .component(ComponentSpec::new("mode", ".MODE", soft(Kind::CONFIG)))
            .component(sub_device("amp", ":AMP", good))
            .component(sub_device("det", ":DET", bad))
            .build()
            .unwrap(),
    );
    let dev = Device::builder("tree", "SIM:", schema)
        .with_stage_sig("mode", json!(1))
        .with_stage_sig("amp.gain", json!(10))
        .build()
        .unwrap();
    let Child::Device(det) = dev.get_child("det").unwrap() else {
        panic!("expected sub-device");
    };
    det.set_stage_sig("interlock", json!(1));

    let err = dev.stage().unwrap_err();
    assert!(matches!(err, HalError::ReadOnly(_)));

    assert_eq!(dev.staged(), Staged::No);
    assert_eq!(det.staged(), Staged::No);
    assert_eq!(value_of(&dev, "mode"), json!(0.0));
    assert_eq!(value_of(&dev, "amp.gain"), json!(0.0));
}

#[test]
fn staging_an_already_staged_tree_names_the_state() {
    let dev = rig();
    dev.stage().unwrap();
    let message = dev.stage().unwrap_err().to_string();
    assert!(message.contains("already staged"), "got: {message}");
}

#[test]
fn formatted_components_resolve_against_instance_fields() {
    let schema = Arc::new(
        DeviceSchema::builder()
            .component(
                ComponentSpec::new("gain", "{card}:GAIN", soft(Kind::CONFIG)).formatted(),
            )
            .build()
            .unwrap(),
    );
    let dev = Device::builder("amp", "SIM:", schema)
        .with_field("card", "C7")
        .build()
        .unwrap();
    let sig = dev.resolve_signal("gain").unwrap();
    assert_eq!(sig.name(), "amp_gain");

    let mut fields = HashMap::new();
    fields.insert("card".to_string(), "C7".to_string());
    let ctx = dev
        .schema()
        .get("gain")
        .unwrap()
        .resolve("amp", "SIM:", &fields, None)
        .unwrap();
    assert_eq!(ctx.address, "SIM:C7:GAIN");
}

#[test]
fn configuration_round_trip_through_configure() {
    let dev = rig();
    let before = dev.read_configuration().unwrap();
    let keys: Vec<_> = before.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(
        keys,
        vec!["rig_mode", "rig_x_velocity", "rig_y_velocity"]
    );

    let (old, new) = dev
        .configure(&[("x.velocity".to_string(), json!(3.0))])
        .unwrap();
    assert_eq!(old[1].1.value, json!(0.0));
    assert_eq!(new[1].1.value, json!(3.0));
}
