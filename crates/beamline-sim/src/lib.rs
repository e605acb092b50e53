//! `beamline-sim`
//!
//! Simulated backends for `beamline-core`: an in-process [`ControlLink`]
//! implementation with configurable latency, connection delay, and failure
//! injection, a constant-velocity [`SimMotor`], and assembled example
//! devices. Everything here drives the real core code paths, so it doubles
//! as the integration-test harness and as a template for writing an actual
//! control-system backend.
//!
//! [`ControlLink`]: beamline_core::signal::ControlLink

pub mod detector;
pub mod link;
pub mod motor;

pub use detector::{detector_schema, linked_signal, linked_signal_ro, sim_detector};
pub use link::{SimLink, SimLinkConfig, SimLinkFactory};
pub use motor::SimMotor;
