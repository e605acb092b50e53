//! A simulated motor that travels at finite velocity on a worker thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use beamline_core::error::Result;
use beamline_core::object::{EventCallback, SubscriptionId};
use beamline_core::positioner::{MoveOptions, Positioner, PositionerCore, SUB_READBACK};
use beamline_core::status::MoveStatus;

const TICK: Duration = Duration::from_millis(10);

/// Scalar positioner with simulated constant-velocity travel. Intermediate
/// readbacks stream out on every tick, optionally with encoder-style noise;
/// the final readback is always the exact commanded target.
pub struct SimMotor {
    core: Arc<PositionerCore>,
    name: String,
    velocity: f64,
    limits: Option<(f64, f64)>,
    egu: String,
    settle_time: Duration,
    noise: f64,
    /// Cancellation token: a worker only keeps stepping while its generation
    /// is current.
    generation: Arc<AtomicU64>,
}

impl SimMotor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        SimMotor {
            core: Arc::new(PositionerCore::new(name.clone(), 0.0)),
            name,
            velocity: 100.0,
            limits: None,
            egu: "mm".to_string(),
            settle_time: Duration::ZERO,
            noise: 0.0,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Travel speed in units per second.
    pub fn with_velocity(mut self, velocity: f64) -> Self {
        self.velocity = velocity.abs();
        self
    }

    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some((low, high));
        self
    }

    pub fn with_egu(mut self, egu: impl Into<String>) -> Self {
        self.egu = egu.into();
        self
    }

    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Uniform noise amplitude added to intermediate readbacks.
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise = amplitude.abs();
        self
    }

    pub fn with_initial_position(self, position: f64) -> Self {
        self.core.set_position(position);
        self
    }

    pub fn core(&self) -> &Arc<PositionerCore> {
        &self.core
    }
}

impl Positioner for SimMotor {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn move_to(&self, position: f64, opts: MoveOptions) -> Result<MoveStatus> {
        self.check_value(position)?;
        // A new command supersedes an in-flight move: fail the old request
        // before arming the new one.
        if self.core.moving() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.core.done_moving(false);
        }
        let status = self
            .core
            .setup_move(self.name.as_str(), position, opts.timeout, self.settle_time)?;
        if let Some(cb) = opts.moved_cb {
            status.add_callback(cb);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.core.start_move(position);
        debug!(motor = %self.name, target = position, "travel started");

        let core = self.core.clone();
        let counter = self.generation.clone();
        let step = self.velocity * TICK.as_secs_f64();
        let noise = self.noise;
        let spawned = std::thread::Builder::new()
            .name(format!("{}-travel", self.name))
            .spawn(move || {
                let mut actual = core.position();
                loop {
                    std::thread::sleep(TICK);
                    // Cancelled by stop or a superseding move; whoever bumped
                    // the generation already failed this request.
                    if counter.load(Ordering::SeqCst) != generation {
                        return;
                    }
                    let remaining = position - actual;
                    if remaining.abs() <= step {
                        core.set_position(position);
                        core.done_moving(true);
                        return;
                    }
                    actual += step.copysign(remaining);
                    let readback = if noise > 0.0 {
                        actual + rand::thread_rng().gen_range(-noise..=noise)
                    } else {
                        actual
                    };
                    core.set_position(readback);
                }
            });
        if spawned.is_err() {
            self.core.done_moving(false);
        }

        if opts.wait {
            if let Err(err) = status.wait(None) {
                warn!(motor = %self.name, error = %err, "travel failed, stopping");
                self.stop()?;
                return Err(err);
            }
        }
        Ok(status)
    }

    fn position(&self) -> f64 {
        self.core.position()
    }

    fn target(&self) -> f64 {
        self.core.target()
    }

    fn moving(&self) -> bool {
        self.core.moving()
    }

    /// Cancel travel. The worker observes the bumped generation on its next
    /// tick and exits; the in-flight request is failed here.
    fn stop(&self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.core.moving() {
            self.core.done_moving(false);
        }
        Ok(())
    }

    fn check_value(&self, position: f64) -> Result<()> {
        beamline_core::positioner::check_limits(&self.name, position, self.limits)
    }

    fn settle_time(&self) -> Duration {
        self.settle_time
    }

    fn egu(&self) -> String {
        self.egu.clone()
    }

    fn limits(&self) -> Option<(f64, f64)> {
        self.limits
    }

    fn subscribe_readback(&self, cb: EventCallback, run: bool) -> Result<SubscriptionId> {
        self.core.events().subscribe(cb, Some(SUB_READBACK), run)
    }

    fn clear_sub(&self, cb: &EventCallback) {
        self.core.events().clear_sub(cb, None);
    }
}
