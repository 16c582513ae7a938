//! Execution contexts handed to node operations
//!
//! Reactive nodes get a [`RecomputeContext`]: a synchronous, borrowed view
//! of their inputs, properties and state for the duration of one recompute.
//! Imperative nodes get a [`NodeContext`]: an owned handle onto the running
//! engine through which they read inputs, write outputs, sleep, talk to
//! hardware and fire sub-paths.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::task::TaskTracker;

use crate::config::EngineConfig;
use crate::engine::EngineCore;
use crate::error::{FlowEngineError, HardwareError, Result};
use crate::run::RunContext;
use crate::sequencer::spawn_path;
use crate::types::{value_as_bool, value_as_f64, DeviceId, NodeId};

/// Control output indices fired by an imperative node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fired(Vec<usize>);

impl Fired {
    /// Fire nothing; the path completes here
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn one(index: usize) -> Self {
        Self(vec![index])
    }

    pub fn many(indices: impl IntoIterator<Item = usize>) -> Self {
        Self(indices.into_iter().collect())
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A request against a node's bound device
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareAction {
    Read,
    Write(Value),
}

/// A value pushed into another node's input from inside a recompute
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Feed {
    pub node_id: NodeId,
    pub index: usize,
    pub value: Value,
}

/// View of a reactive node during one recompute
pub struct RecomputeContext<'a> {
    node_id: &'a str,
    inputs: Vec<Value>,
    properties: &'a Map<String, Value>,
    state: &'a mut Map<String, Value>,
    outputs: Vec<Option<Value>>,
    error: Option<String>,
    feeds: Vec<Feed>,
    elapsed: Duration,
}

impl<'a> RecomputeContext<'a> {
    pub(crate) fn new(
        node_id: &'a str,
        inputs: Vec<Value>,
        properties: &'a Map<String, Value>,
        state: &'a mut Map<String, Value>,
        output_count: usize,
        elapsed: Duration,
    ) -> Self {
        Self {
            node_id,
            inputs,
            properties,
            state,
            outputs: vec![None; output_count],
            error: None,
            feeds: Vec::new(),
            elapsed,
        }
    }

    pub fn node_id(&self) -> &str {
        self.node_id
    }

    pub fn input(&self, index: usize) -> &Value {
        self.inputs.get(index).unwrap_or(&Value::Null)
    }

    pub fn input_f64(&self, index: usize, default: f64) -> f64 {
        value_as_f64(self.input(index)).unwrap_or(default)
    }

    pub fn input_bool(&self, index: usize, default: bool) -> bool {
        value_as_bool(self.input(index)).unwrap_or(default)
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn property_f64(&self, key: &str, default: f64) -> f64 {
        self.property(key).and_then(value_as_f64).unwrap_or(default)
    }

    pub fn state_value(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: Value) {
        self.state.insert(key.into(), value);
    }

    /// Stage a Data output; only changed values propagate
    pub fn set_output(&mut self, index: usize, value: Value) {
        match self.outputs.get_mut(index) {
            Some(slot) => *slot = Some(value),
            None => log::warn!(
                "Node '{}' wrote to missing output {}",
                self.node_id,
                index
            ),
        }
    }

    /// Record an error while still publishing staged outputs
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    /// Push a value into another node's input, starting a nested pass
    pub fn feed_input(&mut self, node_id: impl Into<NodeId>, index: usize, value: Value) {
        self.feeds.push(Feed {
            node_id: node_id.into(),
            index,
            value,
        });
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub(crate) fn into_parts(self) -> (Vec<Option<Value>>, Option<String>, Vec<Feed>) {
        (self.outputs, self.error, self.feeds)
    }
}

/// Handle given to an imperative node while it executes
///
/// Graph access goes through short lock scopes, so a node may hold the
/// context across `.await` points freely.
pub struct NodeContext {
    core: Arc<EngineCore>,
    run: Arc<RunContext>,
    node_id: NodeId,
    trigger: Option<usize>,
}

impl NodeContext {
    pub(crate) fn new(
        core: Arc<EngineCore>,
        run: Arc<RunContext>,
        node_id: NodeId,
        trigger: Option<usize>,
    ) -> Self {
        Self {
            core,
            run,
            node_id,
            trigger,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Control input this invocation arrived through; `None` at a path's entry
    pub fn trigger(&self) -> Option<usize> {
        self.trigger
    }

    pub fn run_id(&self) -> &str {
        self.run.id()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Current values of every input, in port order
    pub fn inputs(&self) -> Vec<Value> {
        self.core
            .graph
            .lock()
            .get_node(&self.node_id)
            .map(|n| n.input_values())
            .unwrap_or_default()
    }

    pub fn input(&self, index: usize) -> Value {
        self.core
            .graph
            .lock()
            .get_input(&self.node_id, index)
            .unwrap_or(Value::Null)
    }

    pub fn input_f64(&self, index: usize, default: f64) -> f64 {
        value_as_f64(&self.input(index)).unwrap_or(default)
    }

    pub fn input_bool(&self, index: usize, default: bool) -> bool {
        value_as_bool(&self.input(index)).unwrap_or(default)
    }

    pub fn is_input_connected(&self, index: usize) -> bool {
        self.core
            .graph
            .lock()
            .incoming(&self.node_id, index)
            .is_some()
    }

    pub fn properties(&self) -> Map<String, Value> {
        self.core
            .graph
            .lock()
            .get_node(&self.node_id)
            .map(|n| n.properties.clone())
            .unwrap_or_default()
    }

    pub fn property(&self, key: &str) -> Option<Value> {
        self.core
            .graph
            .lock()
            .get_node(&self.node_id)
            .and_then(|n| n.properties.get(key).cloned())
    }

    pub fn property_f64(&self, key: &str, default: f64) -> f64 {
        self.property(key)
            .as_ref()
            .and_then(value_as_f64)
            .unwrap_or(default)
    }

    pub fn property_str(&self, key: &str) -> Option<String> {
        self.property(key)
            .and_then(|v| v.as_str().map(|s| s.to_string()))
    }

    pub fn state(&self, key: &str) -> Option<Value> {
        self.core
            .graph
            .lock()
            .get_node(&self.node_id)
            .and_then(|n| n.state.get(key).cloned())
    }

    pub fn set_state(&self, key: impl Into<String>, value: Value) {
        if let Some(node) = self.core.graph.lock().get_node_mut(&self.node_id) {
            node.state.insert(key.into(), value);
        }
    }

    /// Write a Data output and propagate it to dependents
    pub fn set_output(&self, index: usize, value: Value) -> Result<()> {
        self.core
            .set_output(&self.node_id, index, value, self.run.elapsed())
    }

    /// Record an error on this node and notify subscribers
    pub fn set_error(&self, message: impl Into<String>) {
        self.core
            .report_node_error(&self.node_id, &message.into(), self.run.elapsed());
    }

    /// Device this node is bound to for the current run
    pub fn device(&self) -> Option<DeviceId> {
        self.core.bindings.device_for(&self.node_id)
    }

    /// Perform a hardware call against the bound device
    ///
    /// The call honours pause and cancellation and is bounded by the
    /// configured hardware timeout. Failures land in the node's error slot.
    pub async fn invoke_hardware(&self, action: HardwareAction) -> Result<Value> {
        self.run.checkpoint().await?;

        let result = match self.core.bindings.handle_for(&self.node_id) {
            Some(handle) => {
                let timeout = self.core.config.hardware_timeout();
                let call = async {
                    match &action {
                        HardwareAction::Read => handle.read().await,
                        HardwareAction::Write(value) => {
                            handle.write(value).await.map(|_| value.clone())
                        }
                    }
                };
                tokio::select! {
                    biased;
                    _ = self.run.cancelled() => return Err(FlowEngineError::Cancelled),
                    outcome = tokio::time::timeout(timeout, call) => {
                        outcome.unwrap_or(Err(HardwareError::Timeout(timeout)))
                    }
                }
            }
            None => Err(HardwareError::NotBound(self.node_id.clone())),
        };

        result.map_err(|e| {
            log::warn!("Hardware call on node '{}' failed: {}", self.node_id, e);
            self.set_error(e.to_string());
            FlowEngineError::Hardware(e)
        })
    }

    pub async fn read_device(&self) -> Result<Value> {
        self.invoke_hardware(HardwareAction::Read).await
    }

    pub async fn write_device(&self, value: Value) -> Result<()> {
        self.invoke_hardware(HardwareAction::Write(value))
            .await
            .map(|_| ())
    }

    /// Wait until the run is not paused; fails once the run is cancelled
    pub async fn checkpoint(&self) -> Result<()> {
        self.run.checkpoint().await
    }

    /// Pause-aware sleep that keeps the remaining time across a pause
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.run.sleep(duration).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.is_cancelled()
    }

    /// Time since the run started
    pub fn elapsed(&self) -> Duration {
        self.run.elapsed()
    }

    /// Run time excluding pauses
    pub fn active_elapsed(&self) -> Duration {
        self.run.active_elapsed()
    }

    /// A node of `node_type` whose property `key` equals `value`
    pub fn find_node(&self, node_type: &str, key: &str, value: &Value) -> Option<NodeId> {
        self.core
            .graph
            .lock()
            .nodes()
            .find(|n| n.node_type == node_type && n.properties.get(key) == Some(value))
            .map(|n| n.id.clone())
    }

    /// Fire a control output and wait for every path it starts to finish
    ///
    /// Siblings spawned further down those paths are waited for as well.
    pub async fn fire_and_wait(&self, output: usize) -> Result<()> {
        self.run.checkpoint().await?;

        let targets = {
            let mut graph = self.core.graph.lock();
            graph.mark_fired(&self.node_id, output);
            graph.control_targets(&self.node_id, output)
        };
        self.wait_for_paths(targets.into_iter().map(|(target, port)| (target, Some(port))))
            .await
    }

    /// Run a control path from `entry` as if it were an entry node and wait
    /// for it and everything it spawns
    pub async fn call_path(&self, entry: &str) -> Result<()> {
        self.run.checkpoint().await?;
        self.wait_for_paths([(entry.to_string(), None)]).await
    }

    async fn wait_for_paths(
        &self,
        paths: impl IntoIterator<Item = (NodeId, Option<usize>)>,
    ) -> Result<()> {
        let scope = TaskTracker::new();
        for (entry, via) in paths {
            spawn_path(&self.core, &self.run, entry, via, Some(&scope));
        }
        scope.close();
        scope.wait().await;

        if let Some(failure) = self.run.failure() {
            return Err(FlowEngineError::PathHalted {
                node_id: self.node_id.clone(),
                message: failure.message,
            });
        }
        if self.run.is_cancelled() {
            return Err(FlowEngineError::Cancelled);
        }
        Ok(())
    }
}
