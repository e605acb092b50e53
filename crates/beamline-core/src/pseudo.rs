//! Pseudo positioners: virtual coordinate systems over real axes.
//!
//! A [`PseudoPositioner`] exposes a vector of named pseudo axes mapped onto
//! an ordered set of real positioners by user-supplied forward and inverse
//! kinematics. The pseudo readback is always derived from the real readbacks
//! through the inverse transform; nothing in here holds a position of its
//! own. Moves run either sequentially (each leg commanded after the previous
//! confirms) or concurrently (all legs issued at once).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{HalError, Result};
use crate::object::{Event, EventBus, EventCallback, SubscriptionId};
use crate::positioner::{
    check_limits, MoveOptions, Positioner, SUB_DONE, SUB_READBACK, SUB_START,
};
use crate::status::MoveStatus;

pub const PSEUDO_EVENTS: &[&str] = &[SUB_READBACK, SUB_START, SUB_DONE];

/// Coordinate transform between pseudo and real vectors.
pub type Kinematics = Arc<dyn Fn(&[f64]) -> Result<Vec<f64>> + Send + Sync>;

#[derive(Debug, Clone)]
struct AxisDef {
    name: String,
    limits: Option<(f64, f64)>,
}

struct PseudoState {
    /// Derived from real readbacks via the inverse transform.
    position: Vec<f64>,
    /// Last commanded pseudo target.
    target: Vec<f64>,
    moving: bool,
}

pub struct PseudoPositioner {
    name: String,
    events: EventBus,
    axes: Vec<AxisDef>,
    reals: Vec<Arc<dyn Positioner>>,
    forward: Kinematics,
    inverse: Kinematics,
    concurrent: bool,
    state: Mutex<PseudoState>,
}

pub struct PseudoPositionerBuilder {
    name: String,
    axes: Vec<AxisDef>,
    reals: Vec<Arc<dyn Positioner>>,
    forward: Option<Kinematics>,
    inverse: Option<Kinematics>,
    concurrent: bool,
}

impl PseudoPositionerBuilder {
    pub fn axis(mut self, name: impl Into<String>) -> Self {
        self.axes.push(AxisDef {
            name: name.into(),
            limits: None,
        });
        self
    }

    pub fn axis_with_limits(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.axes.push(AxisDef {
            name: name.into(),
            limits: Some((low, high)),
        });
        self
    }

    pub fn real(mut self, positioner: Arc<dyn Positioner>) -> Self {
        self.reals.push(positioner);
        self
    }

    /// Pseudo → real transform.
    pub fn forward(mut self, f: impl Fn(&[f64]) -> Result<Vec<f64>> + Send + Sync + 'static) -> Self {
        self.forward = Some(Arc::new(f));
        self
    }

    /// Real → pseudo transform.
    pub fn inverse(mut self, f: impl Fn(&[f64]) -> Result<Vec<f64>> + Send + Sync + 'static) -> Self {
        self.inverse = Some(Arc::new(f));
        self
    }

    /// Issue all real legs at once instead of chaining them.
    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    /// Finalize, hook the real readbacks, and compute the initial pseudo
    /// position.
    pub fn build(self) -> Result<Arc<PseudoPositioner>> {
        let missing = |what: &str| {
            HalError::Kinematics(format!("pseudo positioner '{}' has no {what}", self.name))
        };
        let forward = self.forward.ok_or_else(|| missing("forward transform"))?;
        let inverse = self.inverse.ok_or_else(|| missing("inverse transform"))?;
        if self.axes.is_empty() {
            return Err(missing("pseudo axes"));
        }
        if self.reals.is_empty() {
            return Err(missing("real positioners"));
        }

        let n_axes = self.axes.len();
        let pseudo = Arc::new(PseudoPositioner {
            events: EventBus::new(self.name.clone(), PSEUDO_EVENTS, Some(SUB_READBACK)),
            name: self.name,
            axes: self.axes,
            reals: self.reals,
            forward,
            inverse,
            concurrent: self.concurrent,
            state: Mutex::new(PseudoState {
                position: vec![0.0; n_axes],
                target: vec![0.0; n_axes],
                moving: false,
            }),
        });

        for real in &pseudo.reals {
            let weak = Arc::downgrade(&pseudo);
            real.subscribe_readback(
                Arc::new(move |_event: &Event| {
                    if let Some(p) = weak.upgrade() {
                        p.update_readback();
                    }
                }),
                false,
            )?;
        }
        pseudo.update_readback();
        {
            let mut state = pseudo.state.lock();
            let position = state.position.clone();
            state.target = position;
        }
        Ok(pseudo)
    }
}

impl PseudoPositioner {
    pub fn builder(name: impl Into<String>) -> PseudoPositionerBuilder {
        PseudoPositionerBuilder {
            name: name.into(),
            axes: Vec::new(),
            reals: Vec::new(),
            forward: None,
            inverse: None,
            concurrent: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn axis_names(&self) -> Vec<&str> {
        self.axes.iter().map(|axis| axis.name.as_str()).collect()
    }

    /// Current pseudo position, the inverse transform of the real readbacks.
    pub fn position(&self) -> Vec<f64> {
        self.state.lock().position.clone()
    }

    /// Last commanded pseudo target.
    pub fn target(&self) -> Vec<f64> {
        self.state.lock().target.clone()
    }

    pub fn moving(&self) -> bool {
        self.state.lock().moving
    }

    pub fn subscribe_readback(&self, cb: EventCallback, run: bool) -> Result<SubscriptionId> {
        self.events.subscribe(cb, Some(SUB_READBACK), run)
    }

    /// Recompute the pseudo position from the real readbacks and fire the
    /// readback event. Called from every real positioner's readback.
    fn update_readback(&self) {
        let reals: Vec<f64> = self.reals.iter().map(|real| real.position()).collect();
        let pseudo = match (self.inverse)(&reals) {
            Ok(pseudo) if pseudo.len() == self.axes.len() => pseudo,
            Ok(pseudo) => {
                warn!(
                    pseudo = %self.name,
                    got = pseudo.len(),
                    expected = self.axes.len(),
                    "inverse transform returned wrong dimensionality"
                );
                return;
            }
            Err(err) => {
                warn!(pseudo = %self.name, error = %err, "inverse transform failed");
                return;
            }
        };
        self.state.lock().position = pseudo.clone();
        let _ = self
            .events
            .run_subs(Event::new(SUB_READBACK).with_value(json!(pseudo)));
    }

    /// Validate a full pseudo-space request against axis limits and then
    /// against each real positioner.
    pub fn check_value(&self, pseudo: &[f64]) -> Result<Vec<f64>> {
        if pseudo.len() != self.axes.len() {
            return Err(HalError::DimensionMismatch {
                expected: self.axes.len(),
                got: pseudo.len(),
            });
        }
        for (axis, value) in self.axes.iter().zip(pseudo) {
            check_limits(&axis.name, *value, axis.limits)?;
        }
        let targets = (self.forward)(pseudo)?;
        if targets.len() != self.reals.len() {
            return Err(HalError::DimensionMismatch {
                expected: self.reals.len(),
                got: targets.len(),
            });
        }
        for (real, target) in self.reals.iter().zip(&targets) {
            real.check_value(*target)?;
        }
        Ok(targets)
    }

    /// Command a coordinated move in pseudo coordinates.
    pub fn move_to(self: &Arc<Self>, pseudo: &[f64], opts: MoveOptions) -> Result<MoveStatus> {
        let targets = self.check_value(pseudo)?;
        let status = MoveStatus::new(
            self.name.clone(),
            pseudo.to_vec(),
            opts.timeout,
            Duration::ZERO,
        );
        if let Some(cb) = opts.moved_cb {
            status.add_callback(cb);
        }
        {
            let mut state = self.state.lock();
            state.target = pseudo.to_vec();
            state.moving = true;
        }
        let _ = self
            .events
            .run_subs(Event::new(SUB_START).with_value(json!(pseudo)));
        debug!(pseudo = %self.name, ?targets, concurrent = self.concurrent, "coordinated move");

        if self.concurrent {
            self.issue_concurrent(&targets, &status);
        } else {
            self.clone().issue_sequential(0, Arc::new(targets), status.clone());
        }

        if opts.wait {
            if let Err(err) = status.wait(None) {
                warn!(pseudo = %self.name, error = %err, "coordinated move failed, stopping");
                self.stop()?;
                return Err(err);
            }
        }
        Ok(status)
    }

    /// Move one pseudo axis; the other axes hold their last commanded
    /// targets, not their readbacks.
    pub fn move_single(
        self: &Arc<Self>,
        axis: &str,
        value: f64,
        opts: MoveOptions,
    ) -> Result<MoveStatus> {
        let index = self.axis_index(axis)?;
        let mut pseudo = self.target();
        pseudo[index] = value;
        self.move_to(&pseudo, opts)
    }

    /// Handle exposing one pseudo axis as a scalar.
    pub fn pseudo_axis(self: &Arc<Self>, axis: &str) -> Result<PseudoAxis> {
        let index = self.axis_index(axis)?;
        Ok(PseudoAxis {
            parent: self.clone(),
            index,
            name: format!("{}_{axis}", self.name),
        })
    }

    fn axis_index(&self, axis: &str) -> Result<usize> {
        self.axes
            .iter()
            .position(|def| def.name == axis)
            .ok_or_else(|| HalError::UnknownComponent {
                device: self.name.clone(),
                attr: axis.to_string(),
            })
    }

    /// Stop every real axis, collecting failures instead of aborting the
    /// fan-out.
    pub fn stop(&self) -> Result<()> {
        let mut errors = Vec::new();
        for real in &self.reals {
            if let Err(err) = real.stop() {
                errors.push(err);
            }
        }
        self.state.lock().moving = false;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(HalError::StopErrors {
                device: self.name.clone(),
                errors,
            })
        }
    }

    fn finish_move(&self, status: &MoveStatus, success: bool) {
        self.state.lock().moving = false;
        let finish = self.position();
        status.complete(success, Some(finish));
        if success {
            let _ = self.events.run_subs(Event::new(SUB_DONE).with_success(true));
        }
    }

    /// Sequential policy: command leg `index`, recurse on confirmation,
    /// abort the chain on the first failed leg.
    fn issue_sequential(self: Arc<Self>, index: usize, targets: Arc<Vec<f64>>, status: MoveStatus) {
        if index == self.reals.len() {
            self.finish_move(&status, true);
            return;
        }
        let leg = match self.reals[index].move_to(targets[index], MoveOptions::new()) {
            Ok(leg) => leg,
            Err(err) => {
                warn!(pseudo = %self.name, leg = index, error = %err, "leg rejected, aborting chain");
                self.finish_move(&status, false);
                return;
            }
        };
        let outcome = leg.clone();
        let this = self.clone();
        leg.add_callback(move || {
            if outcome.success() == Some(true) {
                this.issue_sequential(index + 1, targets, status);
            } else {
                this.finish_move(&status, false);
            }
        });
    }

    /// Concurrent policy: issue every leg, track the in-flight set, resolve
    /// once it empties. A failed leg fails the overall move but already
    /// issued legs keep running.
    fn issue_concurrent(self: &Arc<Self>, targets: &[f64], status: &MoveStatus) {
        let inflight: Arc<Mutex<HashSet<usize>>> =
            Arc::new(Mutex::new((0..self.reals.len()).collect()));
        let failed = Arc::new(AtomicBool::new(false));

        for (index, target) in targets.iter().enumerate() {
            let leg_done = {
                let inflight = inflight.clone();
                let failed = failed.clone();
                let status = status.clone();
                let this = self.clone();
                move |success: bool| {
                    if !success {
                        failed.store(true, Ordering::SeqCst);
                    }
                    let empty = {
                        let mut set = inflight.lock();
                        set.remove(&index);
                        set.is_empty()
                    };
                    if empty {
                        this.finish_move(&status, !failed.load(Ordering::SeqCst));
                    }
                }
            };
            match self.reals[index].move_to(*target, MoveOptions::new()) {
                Ok(leg) => {
                    let outcome = leg.clone();
                    leg.add_callback(move || leg_done(outcome.success() == Some(true)));
                }
                Err(err) => {
                    warn!(pseudo = %self.name, leg = index, error = %err, "leg rejected");
                    leg_done(false);
                }
            }
        }
    }
}

impl std::fmt::Debug for PseudoPositioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PseudoPositioner")
            .field("name", &self.name)
            .field("axes", &self.axis_names())
            .field("reals", &self.reals.len())
            .field("concurrent", &self.concurrent)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// PseudoAxis
// =============================================================================

/// Scalar view of one pseudo axis. Motion on the axis goes through the
/// parent's coordinated move with the other axes held at their targets.
pub struct PseudoAxis {
    parent: Arc<PseudoPositioner>,
    index: usize,
    name: String,
}

impl PseudoAxis {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> f64 {
        self.parent.position()[self.index]
    }

    pub fn target(&self) -> f64 {
        self.parent.target()[self.index]
    }

    pub fn limits(&self) -> Option<(f64, f64)> {
        self.parent.axes[self.index].limits
    }

    pub fn move_to(&self, value: f64, opts: MoveOptions) -> Result<MoveStatus> {
        self.parent
            .move_single(&self.parent.axes[self.index].name, value, opts)
    }
}
