//! Simulated control links with configurable latency and failure injection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use beamline_core::error::{HalError, Result};
use beamline_core::signal::{ControlLink, LinkFactory, PutCallback};
use beamline_core::status::unix_ts;

type ValueSub = Box<dyn Fn(Value, f64) + Send + Sync>;
type ConnSub = Box<dyn Fn(bool) + Send + Sync>;

struct LinkState {
    value: Mutex<Value>,
    connected: AtomicBool,
    value_subs: Mutex<Vec<ValueSub>>,
    conn_subs: Mutex<Vec<ConnSub>>,
}

impl LinkState {
    fn publish(&self, value: Value) {
        let ts = unix_ts();
        *self.value.lock() = value.clone();
        for sub in self.value_subs.lock().iter() {
            sub(value.clone(), ts);
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        for sub in self.conn_subs.lock().iter() {
            sub(connected);
        }
    }
}

/// An in-process stand-in for one control-system channel. Writes land after
/// `latency` on a worker thread, connection completes after `connect_delay`,
/// and a link marked failing rejects every put.
pub struct SimLink {
    source: String,
    state: Arc<LinkState>,
    latency: Duration,
    connect_delay: Duration,
    failing: Arc<AtomicBool>,
}

impl SimLink {
    fn new(address: &str, config: &SimLinkConfig, failing: bool) -> Self {
        SimLink {
            source: format!("sim://{address}"),
            state: Arc::new(LinkState {
                value: Mutex::new(config.initial_value.clone()),
                connected: AtomicBool::new(false),
                value_subs: Mutex::new(Vec::new()),
                conn_subs: Mutex::new(Vec::new()),
            }),
            latency: config.latency,
            connect_delay: config.connect_delay,
            failing: Arc::new(AtomicBool::new(failing)),
        }
    }

    /// Toggle put failure at runtime.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Push a value change as if the hardware moved on its own.
    pub fn inject_value(&self, value: Value) {
        self.state.publish(value);
    }

    fn apply_put(&self, value: Value, callback: Option<PutCallback>) {
        if self.failing.load(Ordering::SeqCst) {
            debug!(source = %self.source, "put rejected by failure injection");
            if let Some(cb) = callback {
                cb(false);
            }
            return;
        }
        self.state.publish(value);
        if let Some(cb) = callback {
            cb(true);
        }
    }
}

impl ControlLink for SimLink {
    fn source(&self) -> String {
        self.source.clone()
    }

    fn connect(&self) -> Result<()> {
        if self.state.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let state = self.state.clone();
        let delay = self.connect_delay;
        if delay.is_zero() {
            state.set_connected(true);
            return Ok(());
        }
        std::thread::Builder::new()
            .name("sim-link-connect".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                state.set_connected(true);
            })
            .map_err(|err| HalError::Link {
                signal: self.source.clone(),
                message: format!("failed to spawn connect worker: {err}"),
            })?;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn get(&self) -> Result<Value> {
        if !self.connected() {
            return Err(HalError::Link {
                signal: self.source.clone(),
                message: "not connected".to_string(),
            });
        }
        Ok(self.state.value.lock().clone())
    }

    fn put(&self, value: Value, wait: bool, callback: Option<PutCallback>) -> Result<()> {
        if !self.connected() {
            return Err(HalError::Link {
                signal: self.source.clone(),
                message: "not connected".to_string(),
            });
        }
        if wait || self.latency.is_zero() {
            if !self.latency.is_zero() {
                std::thread::sleep(self.latency);
            }
            self.apply_put(value, callback);
            return Ok(());
        }
        let latency = self.latency;
        let state = self.state.clone();
        let failing = self.failing.clone();
        let source = self.source.clone();
        std::thread::Builder::new()
            .name("sim-link-put".to_string())
            .spawn(move || {
                std::thread::sleep(latency);
                if failing.load(Ordering::SeqCst) {
                    debug!(source = %source, "put rejected by failure injection");
                    if let Some(cb) = callback {
                        cb(false);
                    }
                    return;
                }
                state.publish(value);
                if let Some(cb) = callback {
                    cb(true);
                }
            })
            .map_err(|err| HalError::Link {
                signal: self.source.clone(),
                message: format!("failed to spawn put worker: {err}"),
            })?;
        Ok(())
    }

    fn subscribe_value(&self, cb: ValueSub) {
        // Replay the current value so new subscribers start consistent.
        cb(self.state.value.lock().clone(), unix_ts());
        self.state.value_subs.lock().push(cb);
    }

    fn subscribe_connection(&self, cb: ConnSub) {
        cb(self.connected());
        self.state.conn_subs.lock().push(cb);
    }
}

/// Settings shared by every link a [`SimLinkFactory`] hands out.
#[derive(Debug, Clone)]
pub struct SimLinkConfig {
    pub latency: Duration,
    pub connect_delay: Duration,
    pub initial_value: Value,
}

impl Default for SimLinkConfig {
    fn default() -> Self {
        SimLinkConfig {
            latency: Duration::ZERO,
            connect_delay: Duration::ZERO,
            initial_value: Value::from(0.0),
        }
    }
}

/// Link factory backing a whole simulated device tree. Links are cached per
/// address so every signal bound to one address shares the same channel.
#[derive(Default)]
pub struct SimLinkFactory {
    config: SimLinkConfig,
    fail_addresses: Mutex<HashSet<String>>,
    links: Mutex<HashMap<String, Arc<SimLink>>>,
}

impl SimLinkFactory {
    pub fn new(config: SimLinkConfig) -> Self {
        SimLinkFactory {
            config,
            fail_addresses: Mutex::new(HashSet::new()),
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Make puts to `address` fail, including on links already handed out.
    pub fn fail_address(&self, address: &str) {
        self.fail_addresses.lock().insert(address.to_string());
        if let Some(link) = self.links.lock().get(address) {
            link.set_failing(true);
        }
    }

    pub fn clear_failure(&self, address: &str) {
        self.fail_addresses.lock().remove(address);
        if let Some(link) = self.links.lock().get(address) {
            link.set_failing(false);
        }
    }

    /// The concrete link for an address, for test injection.
    pub fn link(&self, address: &str) -> Option<Arc<SimLink>> {
        self.links.lock().get(address).cloned()
    }
}

impl LinkFactory for SimLinkFactory {
    fn make(&self, address: &str) -> Result<Arc<dyn ControlLink>> {
        let mut links = self.links.lock();
        if let Some(link) = links.get(address) {
            return Ok(link.clone());
        }
        let failing = self.fail_addresses.lock().contains(address);
        let link = Arc::new(SimLink::new(address, &self.config, failing));
        links.insert(address.to_string(), link.clone());
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn factory_caches_links_per_address() {
        let factory = SimLinkFactory::default();
        let a = factory.make("SIM:x").unwrap();
        let b = factory.make("SIM:x").unwrap();
        assert_eq!(a.source(), b.source());
        assert!(factory.link("SIM:x").is_some());
        assert!(factory.link("SIM:y").is_none());
    }

    #[test]
    fn put_lands_and_notifies_subscribers() {
        let factory = SimLinkFactory::default();
        let link = factory.make("SIM:v").unwrap();
        link.connect().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        link.subscribe_value(Box::new(move |value, _ts| {
            sink.lock().push(value);
        }));

        link.put(json!(4.2), true, None).unwrap();
        assert_eq!(link.get().unwrap(), json!(4.2));
        // Initial replay plus the put.
        assert_eq!(*seen.lock(), vec![json!(0.0), json!(4.2)]);
    }

    #[test]
    fn failure_injection_rejects_puts() {
        let factory = SimLinkFactory::default();
        factory.fail_address("SIM:bad");
        let link = factory.make("SIM:bad").unwrap();
        link.connect().unwrap();

        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();
        link.put(
            json!(1),
            true,
            Some(Box::new(move |ok| {
                *sink.lock() = Some(ok);
            })),
        )
        .unwrap();
        assert_eq!(*outcome.lock(), Some(false));
        assert_eq!(link.get().unwrap(), json!(0.0));

        factory.clear_failure("SIM:bad");
        link.put(json!(1), true, None).unwrap();
        assert_eq!(link.get().unwrap(), json!(1));
    }

    #[test]
    fn disconnected_link_refuses_io() {
        let config = SimLinkConfig {
            connect_delay: Duration::from_millis(50),
            ..SimLinkConfig::default()
        };
        let factory = SimLinkFactory::new(config);
        let link = factory.make("SIM:slow").unwrap();
        assert!(link.get().is_err());

        link.connect().unwrap();
        assert!(!link.connected());
        std::thread::sleep(Duration::from_millis(120));
        assert!(link.connected());
        link.get().unwrap();
    }
}
