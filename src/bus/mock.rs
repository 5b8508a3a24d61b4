//! Scripted in-memory bus for transport and resolver tests.
//!
//! The mock keeps a property map, an object tree and per-key script queues.
//! Every trait invocation is recorded so tests can assert which bus calls a
//! code path made (or that it made none). Successful `Connect`/`Disconnect`
//! and `StartNotify`/`StopNotify` method calls flip the matching property,
//! mirroring what a real stack does.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::{Bus, BusNode, BusValue, DEVICE_INTERFACE, GATT_CHARACTERISTIC_INTERFACE,
    PropertyChange};
use crate::error::{Error, Result};

fn key(path: &str, interface: &str, name: &str) -> String {
    format!("{path}|{interface}|{name}")
}

#[derive(Default)]
struct State {
    properties: HashMap<String, BusValue>,
    property_scripts: HashMap<String, VecDeque<Result<BusValue>>>,
    method_scripts: HashMap<String, VecDeque<Result<BusValue>>>,
    trees: HashMap<String, BusNode>,
    subscribers: HashMap<String, Vec<mpsc::Sender<PropertyChange>>>,
    calls: Vec<String>,
    writes: Vec<Vec<u8>>,
    closed: bool,
}

/// Scripted mock bus.
#[derive(Default)]
pub struct MockBus {
    state: Mutex<State>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a property to a constant value.
    pub fn put_property(&self, path: &str, interface: &str, name: &str, value: BusValue) {
        let mut state = self.state.lock().unwrap();
        state.properties.insert(key(path, interface, name), value);
    }

    /// Queues scripted results for a property; consumed before the constant
    /// value, one per read.
    pub fn script_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        results: Vec<Result<BusValue>>,
    ) {
        let mut state = self.state.lock().unwrap();
        state
            .property_scripts
            .entry(key(path, interface, name))
            .or_default()
            .extend(results);
    }

    /// Queues scripted results for a method call.
    pub fn script_method(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        results: Vec<Result<BusValue>>,
    ) {
        let mut state = self.state.lock().unwrap();
        state
            .method_scripts
            .entry(key(path, interface, method))
            .or_default()
            .extend(results);
    }

    /// Installs an introspection tree rooted at its own path.
    pub fn put_tree(&self, root: BusNode) {
        let mut state = self.state.lock().unwrap();
        state.trees.insert(root.path.clone(), root);
    }

    /// Delivers a property change to all subscribers whose root covers `path`.
    pub fn inject_change(
        &self,
        path: &str,
        interface: &str,
        changed: HashMap<String, BusValue>,
    ) {
        let change = PropertyChange {
            path: path.to_string(),
            interface: interface.to_string(),
            changed,
        };
        let senders: Vec<mpsc::Sender<PropertyChange>> = {
            let state = self.state.lock().unwrap();
            state
                .subscribers
                .iter()
                .filter(|(root, _)| path.starts_with(root.as_str()))
                .flat_map(|(_, txs)| txs.iter().cloned())
                .collect()
        };
        for tx in senders {
            let _ = tx.try_send(change.clone());
        }
    }

    /// All recorded invocations, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Payloads of all recorded `WriteValue` calls.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn record(&self, entry: String) {
        self.state.lock().unwrap().calls.push(entry);
    }

    fn scripted_or_stored(&self, k: &str) -> Result<BusValue> {
        let mut state = self.state.lock().unwrap();
        if let Some(queue) = state.property_scripts.get_mut(k) {
            if let Some(result) = queue.pop_front() {
                return result;
            }
        }
        state
            .properties
            .get(k)
            .cloned()
            .ok_or_else(|| Error::bus(format!("no such property: {k}")))
    }
}

impl Bus for MockBus {
    fn open(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record("open".to_string());
            self.state.lock().unwrap().closed = false;
            Ok(())
        })
    }

    fn introspect<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<BusNode>> {
        Box::pin(async move {
            self.record(format!("introspect:{path}"));
            let state = self.state.lock().unwrap();
            state
                .trees
                .get(path)
                .cloned()
                .ok_or_else(|| Error::bus(format!("no such object: {path}")))
        })
    }

    fn get_property<'a>(
        &'a self,
        path: &'a str,
        interface: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<BusValue>> {
        Box::pin(async move {
            self.record(format!("get:{path}|{interface}|{name}"));
            self.scripted_or_stored(&key(path, interface, name))
        })
    }

    fn set_property<'a>(
        &'a self,
        path: &'a str,
        interface: &'a str,
        name: &'a str,
        value: BusValue,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(format!("set:{path}|{interface}|{name}"));
            let mut state = self.state.lock().unwrap();
            state.properties.insert(key(path, interface, name), value);
            Ok(())
        })
    }

    fn call_method<'a>(
        &'a self,
        path: &'a str,
        interface: &'a str,
        method: &'a str,
        args: Vec<BusValue>,
        _timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<BusValue>> {
        Box::pin(async move {
            self.record(format!("call:{path}|{interface}|{method}"));

            if method == "WriteValue" {
                if let Some(BusValue::Bytes(data)) = args.first() {
                    self.state.lock().unwrap().writes.push(data.clone());
                }
            }

            let scripted = {
                let mut state = self.state.lock().unwrap();
                state
                    .method_scripts
                    .get_mut(&key(path, interface, method))
                    .and_then(VecDeque::pop_front)
            };
            let result = scripted.unwrap_or(Ok(BusValue::Unit));

            if result.is_ok() {
                // Mirror device-side property effects of lifecycle methods.
                let effect = match method {
                    "Connect" => Some((DEVICE_INTERFACE, "Connected", true)),
                    "Disconnect" => Some((DEVICE_INTERFACE, "Connected", false)),
                    "StartNotify" => {
                        Some((GATT_CHARACTERISTIC_INTERFACE, "Notifying", true))
                    }
                    "StopNotify" => {
                        Some((GATT_CHARACTERISTIC_INTERFACE, "Notifying", false))
                    }
                    _ => None,
                };
                if let Some((iface, name, value)) = effect {
                    let mut state = self.state.lock().unwrap();
                    state
                        .properties
                        .insert(key(path, iface, name), BusValue::Bool(value));
                }
            }

            result
        })
    }

    fn subscribe_property_changes<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<PropertyChange>>> {
        Box::pin(async move {
            self.record(format!("subscribe:{path}"));
            let (tx, rx) = mpsc::channel(32);
            let mut state = self.state.lock().unwrap();
            state.subscribers.entry(path.to_string()).or_default().push(tx);
            Ok(rx)
        })
    }

    fn unsubscribe<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(format!("unsubscribe:{path}"));
            let mut state = self.state.lock().unwrap();
            state.subscribers.remove(path);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.record("close".to_string());
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.subscribers.clear();
            Ok(())
        })
    }
}
