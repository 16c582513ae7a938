//! Run controller and engine facade
//!
//! [`FlowEngine`] is the control surface presentation layers talk to. It
//! owns the graph, the binding layer and the event bus, and drives the run
//! state machine:
//!
//! `Stopped → Initializing → Ready → Running ⇄ Paused → Stopping → Stopped`
//!
//! with `Error` reachable from any non-Stopped state. A run spawns one
//! control path per entry node on a task tracker; a supervisor task waits
//! for the tracker to drain and then tears the run down, either to
//! `Stopped` on normal completion or to `Error` when a path failed.
//!
//! # Usage
//!
//! ```ignore
//! let engine = FlowEngine::new(Arc::new(registry), hardware, EngineConfig::default());
//! engine.load(&description)?;
//! let mut events = engine.subscribe(&[EventCategory::StateChanged]);
//! engine.start().await?;
//! let final_state = engine.wait_until_idle().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::binding::BindingLayer;
use crate::config::EngineConfig;
use crate::description::GraphDescription;
use crate::descriptor::NodeDefinition;
use crate::error::{FlowEngineError, GraphError, HardwareError, Result};
use crate::events::{EngineEvent, EventBus, EventCategory, EventSink, Subscription};
use crate::graph::{FlowGraph, Node};
use crate::hardware::{BoardEvent, ConnectionState, HardwareManager};
use crate::propagation::Propagator;
use crate::registry::NodeRegistry;
use crate::run::{RunContext, RunFailure};
use crate::sequencer::spawn_path;
use crate::state::EngineState;
use crate::types::{Connection, ConnectionId, ConnectionSpec, DeviceId, NodeId, Position};
use crate::undo::UndoStack;
use crate::validation::{validate_graph, ValidationError};

/// Shared engine internals, reachable from every path and node context
pub(crate) struct EngineCore {
    pub(crate) graph: Mutex<FlowGraph>,
    pub(crate) hardware: Arc<HardwareManager>,
    pub(crate) bindings: BindingLayer,
    pub(crate) events: EventBus,
    pub(crate) config: EngineConfig,
    state: watch::Sender<EngineState>,
    run: Mutex<Option<Arc<RunContext>>>,
    last_error: Mutex<Option<RunFailure>>,
    history: Mutex<UndoStack>,
    created: Instant,
}

impl EngineCore {
    fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    fn current_run(&self) -> Option<Arc<RunContext>> {
        self.run.lock().clone()
    }

    fn elapsed(&self) -> Duration {
        match self.current_run() {
            Some(run) => run.elapsed(),
            None => self.created.elapsed(),
        }
    }

    fn propagator(&self, elapsed: Duration) -> Propagator<'_> {
        Propagator::new(&self.events, self.config.max_propagation_depth, elapsed)
    }

    /// Move along the state machine, announcing the change
    fn transition(&self, to: EngineState) -> Result<()> {
        let mut outcome = Ok(EngineState::Stopped);
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(to) {
                outcome = Err(FlowEngineError::InvalidTransition { from: *current, to });
                return false;
            }
            outcome = Ok(*current);
            *current = to;
            true
        });
        let from = outcome?;
        self.announce_state(from, to);
        Ok(())
    }

    /// Enter `Error` from wherever the engine is
    fn force_error(&self) {
        let previous = self.state.send_replace(EngineState::Error);
        if previous != EngineState::Error {
            self.announce_state(previous, EngineState::Error);
        }
    }

    fn announce_state(&self, from: EngineState, to: EngineState) {
        log::info!("Engine state {} -> {}", from, to);
        self.events.emit(EngineEvent::StateChanged {
            from,
            to,
            elapsed_ms: self.elapsed().as_millis() as u64,
        });
    }

    /// Store a Data output written by an imperative node and propagate it
    pub(crate) fn set_output(
        &self,
        node_id: &str,
        index: usize,
        value: Value,
        elapsed: Duration,
    ) -> Result<()> {
        let mut graph = self.graph.lock();
        self.propagator(elapsed)
            .set_output(&mut graph, node_id, index, value)
    }

    /// Record a node error and notify subscribers
    pub(crate) fn report_node_error(&self, node_id: &str, message: &str, elapsed: Duration) {
        self.graph
            .lock()
            .set_error(node_id, Some(message.to_string()));
        self.events.emit(EngineEvent::node_error(
            node_id,
            message,
            elapsed.as_millis() as u64,
        ));
    }

    /// Like `report_node_error`, but quiet when the slot already holds `message`
    pub(crate) fn report_node_error_once(&self, node_id: &str, message: &str, elapsed: Duration) {
        let already = self
            .graph
            .lock()
            .get_node(node_id)
            .and_then(|n| n.error.as_deref())
            == Some(message);
        if !already {
            self.report_node_error(node_id, message, elapsed);
        }
    }

    fn flush_changes(&self, graph: &mut FlowGraph) {
        for change in graph.take_changes() {
            self.events.emit(EngineEvent::GraphChanged { change });
        }
    }

    fn record_history(&self, graph: &FlowGraph) {
        if let Err(e) = self.history.lock().record(&GraphDescription::from_graph(graph)) {
            log::warn!("Could not record edit history: {}", e);
        }
    }

    /// Fail the current run from outside a control path
    fn fail_active_run(&self, failure: RunFailure) {
        if let Some(run) = self.current_run() {
            run.record_failure(failure);
            run.cancel();
        }
    }

    /// Write safe values to the given devices, concurrently
    async fn drive_safe(&self, devices: &[DeviceId]) {
        let timeout = self.config.hardware_timeout();
        let writes = devices.iter().filter_map(|id| self.hardware.handle(id).ok()).map(
            |handle| async move {
                let result = tokio::time::timeout(timeout, handle.drive_safe())
                    .await
                    .unwrap_or(Err(HardwareError::Timeout(timeout)));
                (handle.config.id.clone(), result)
            },
        );
        for (device_id, result) in join_all(writes).await {
            match result {
                Ok(()) => log::debug!("Device '{}' driven to its safe value", device_id),
                Err(e) => log::error!("Failed to drive device '{}' safe: {}", device_id, e),
            }
        }
    }

    /// Unbind every node and disconnect the boards the run used
    async fn release_hardware(&self, drive_safe: bool) {
        let devices = self.bindings.bound_devices();
        if drive_safe {
            self.drive_safe(&devices).await;
        }

        let mut boards: Vec<String> = devices
            .iter()
            .filter_map(|id| self.hardware.device(id))
            .map(|d| d.board_id)
            .collect();
        boards.sort();
        boards.dedup();

        self.bindings.unbind_all();
        self.disconnect_boards(&boards).await;
    }

    async fn disconnect_boards(&self, boards: &[String]) {
        for board_id in boards {
            if let Some(board) = self.hardware.board(board_id) {
                if let Err(e) = board.disconnect().await {
                    log::warn!("Failed to disconnect board '{}': {}", board_id, e);
                }
            }
        }
    }

    fn finish_with_error(&self, failure: RunFailure) {
        *self.last_error.lock() = Some(failure);
        self.force_error();
        *self.run.lock() = None;
    }
}

/// The flow execution engine
#[derive(Clone)]
pub struct FlowEngine {
    core: Arc<EngineCore>,
}

impl FlowEngine {
    pub fn new(
        registry: Arc<NodeRegistry>,
        hardware: Arc<HardwareManager>,
        config: EngineConfig,
    ) -> Self {
        let graph = FlowGraph::new(registry);
        let mut history = UndoStack::default();
        if let Err(e) = history.record(&GraphDescription::from_graph(&graph)) {
            log::warn!("Could not record edit history: {}", e);
        }
        let (state, _) = watch::channel(EngineState::Stopped);
        Self {
            core: Arc::new(EngineCore {
                graph: Mutex::new(graph),
                bindings: BindingLayer::new(hardware.clone()),
                hardware,
                events: EventBus::new(),
                config,
                state,
                run: Mutex::new(None),
                last_error: Mutex::new(None),
                history: Mutex::new(history),
                created: Instant::now(),
            }),
        }
    }

    /// Engine with no boards and default settings
    pub fn with_registry(registry: Arc<NodeRegistry>) -> Self {
        Self::new(
            registry,
            Arc::new(HardwareManager::new()),
            EngineConfig::default(),
        )
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        self.core.graph.lock().registry().clone()
    }

    pub fn hardware(&self) -> &Arc<HardwareManager> {
        &self.core.hardware
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn state(&self) -> EngineState {
        self.core.state()
    }

    /// Why the last run ended in `Error`, kept until `reset()`
    pub fn last_error(&self) -> Option<RunFailure> {
        self.core.last_error.lock().clone()
    }

    /// Time on the run clock, or since the engine was created when idle
    pub fn elapsed(&self) -> Duration {
        self.core.elapsed()
    }

    pub fn run_id(&self) -> Option<String> {
        self.core.current_run().map(|r| r.id().to_string())
    }

    // ---- events ----------------------------------------------------------

    /// Subscribe to engine events; an empty slice means every category
    pub fn subscribe(&self, categories: &[EventCategory]) -> Subscription {
        self.core.events.subscribe(categories)
    }

    pub fn attach_sink(&self, categories: &[EventCategory], sink: Arc<dyn EventSink>) -> u64 {
        self.core.events.attach(categories, sink)
    }

    pub fn detach_sink(&self, id: u64) -> bool {
        self.core.events.detach(id)
    }

    // ---- graph edits -----------------------------------------------------

    fn edit<R>(&self, f: impl FnOnce(&mut FlowGraph) -> std::result::Result<R, GraphError>) -> Result<R> {
        let mut graph = self.core.graph.lock();
        let result = f(&mut graph)?;
        self.core.flush_changes(&mut graph);
        self.core.record_history(&graph);
        Ok(result)
    }

    pub fn add_node(
        &self,
        node_type: &str,
        position: impl Into<Position>,
        properties: Map<String, Value>,
    ) -> Result<NodeId> {
        let position = position.into();
        self.edit(|graph| graph.add_node(node_type, position, properties))
    }

    pub fn add_node_with_id(
        &self,
        id: impl Into<NodeId>,
        node_type: &str,
        position: impl Into<Position>,
        properties: Map<String, Value>,
    ) -> Result<NodeId> {
        let id = id.into();
        let position = position.into();
        self.edit(|graph| graph.add_node_with_id(id, node_type, position, properties))
    }

    /// Remove a node; refused while the node is executing in a run
    pub fn remove_node(&self, node_id: &str) -> Result<()> {
        if let Some(run) = self.core.current_run() {
            if run.is_active(node_id) {
                return Err(GraphError::RunActive(format!("remove node '{}'", node_id)).into());
            }
        }
        self.edit(|graph| graph.remove_node(node_id).map(|_| ()))?;
        self.core.bindings.unbind(node_id);
        Ok(())
    }

    pub fn add_connection(&self, spec: ConnectionSpec) -> Result<ConnectionId> {
        self.edit(|graph| graph.add_connection(spec))
    }

    pub fn connect_by_name(
        &self,
        source: &str,
        source_port: &str,
        target: &str,
        target_port: &str,
    ) -> Result<ConnectionId> {
        self.edit(|graph| graph.connect_by_name(source, source_port, target, target_port))
    }

    pub fn remove_connection(&self, connection_id: &str) -> Result<()> {
        self.edit(|graph| graph.remove_connection(connection_id).map(|_| ()))
    }

    /// Set an unconnected Data input and recompute what depends on it
    pub fn set_input(&self, node_id: &str, index: usize, value: Value) -> Result<()> {
        let mut graph = self.core.graph.lock();
        graph.set_input(node_id, index, value)?;
        self.core.flush_changes(&mut graph);
        self.propagate_from(&mut graph, node_id)
    }

    /// Set a node property and recompute what depends on it
    pub fn set_property(&self, node_id: &str, key: &str, value: Value) -> Result<()> {
        let mut graph = self.core.graph.lock();
        graph.set_property(node_id, key, value)?;
        self.core.flush_changes(&mut graph);
        self.core.record_history(&graph);
        self.propagate_from(&mut graph, node_id)
    }

    fn propagate_from(&self, graph: &mut FlowGraph, node_id: &str) -> Result<()> {
        let result = self
            .core
            .propagator(self.core.elapsed())
            .inputs_changed(graph, node_id);
        if let Err(e) = &result {
            if e.is_engine_level() {
                self.core
                    .fail_active_run(RunFailure::new(Some(node_id.to_string()), e.to_string()));
            }
        }
        result
    }

    pub fn get_input(&self, node_id: &str, index: usize) -> Result<Value> {
        Ok(self.core.graph.lock().get_input(node_id, index)?)
    }

    pub fn get_output(&self, node_id: &str, index: usize) -> Result<Value> {
        Ok(self.core.graph.lock().get_output(node_id, index)?)
    }

    pub fn node(&self, node_id: &str) -> Option<Node> {
        self.core.graph.lock().get_node(node_id).cloned()
    }

    /// Resolve a node by id, then by title
    pub fn find_node(&self, reference: &str) -> Option<Node> {
        self.core.graph.lock().find_node(reference).cloned()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.core.graph.lock().nodes().cloned().collect()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.core.graph.lock().connections().to_vec()
    }

    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.core.graph.lock().entry_nodes()
    }

    pub fn node_error(&self, node_id: &str) -> Option<String> {
        self.core
            .graph
            .lock()
            .get_node(node_id)
            .and_then(|n| n.error.clone())
    }

    /// Run a closure against the graph under its lock
    pub fn with_graph<R>(&self, f: impl FnOnce(&FlowGraph) -> R) -> R {
        f(&self.core.graph.lock())
    }

    fn ensure_idle(&self, action: &str) -> Result<()> {
        if self.core.current_run().is_some() || !self.state().is_idle() {
            return Err(GraphError::RunActive(action.to_string()).into());
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.ensure_idle("clear the graph")?;
        self.edit(|graph| {
            graph.clear();
            Ok(())
        })
    }

    pub fn description(&self) -> GraphDescription {
        GraphDescription::from_graph(&self.core.graph.lock())
    }

    /// Replace the graph with a description; nothing changes on error
    pub fn load(&self, description: &GraphDescription) -> Result<()> {
        self.ensure_idle("load a graph")?;
        let registry = self.registry();
        let loaded = description.to_graph(registry)?;
        log::info!(
            "Loaded graph '{}' with {} node(s) and {} connection(s)",
            loaded.name(),
            loaded.node_count(),
            loaded.connections().len()
        );
        let mut graph = self.core.graph.lock();
        *graph = loaded;
        self.core.events.emit(EngineEvent::GraphChanged {
            change: crate::graph::GraphChange::Cleared,
        });
        self.core.record_history(&graph);
        Ok(())
    }

    /// Restore the graph as it was before the last edit
    pub fn undo(&self) -> Result<bool> {
        self.ensure_idle("undo")?;
        let previous = self.core.history.lock().undo();
        self.restore(previous)
    }

    pub fn redo(&self) -> Result<bool> {
        self.ensure_idle("redo")?;
        let next = self.core.history.lock().redo();
        self.restore(next)
    }

    fn restore(&self, entry: Option<Result<GraphDescription>>) -> Result<bool> {
        let Some(description) = entry.transpose()? else {
            return Ok(false);
        };
        let restored = description.to_graph(self.registry())?;
        *self.core.graph.lock() = restored;
        self.core.events.emit(EngineEvent::GraphChanged {
            change: crate::graph::GraphChange::Cleared,
        });
        Ok(true)
    }

    /// Check the graph against the available hardware
    pub fn validate(&self) -> Vec<ValidationError> {
        validate_graph(&self.core.graph.lock(), &self.core.hardware)
    }

    // ---- device binding --------------------------------------------------

    /// Configure the device a node drives
    ///
    /// Checked against the node type and against the devices other nodes
    /// already use. During a run the bind also takes effect immediately.
    pub fn bind_device(&self, node_id: &str, device_id: &str) -> Result<()> {
        let mut graph = self.core.graph.lock();
        let definition = node_definition(&graph, node_id)?;
        let device = self.core.bindings.check_bind(&definition, device_id)?;

        for other in graph.nodes().filter(|n| n.id != node_id) {
            let Some(other_device) = other.device.as_deref() else {
                continue;
            };
            if other_device == device_id {
                continue;
            }
            if let Some(config) = self.core.hardware.device(other_device) {
                if config.board_id == device.board_id && config.pin == device.pin {
                    return Err(HardwareError::PinConflict {
                        pin: device.pin,
                        existing: config.id,
                        requested: device.id,
                    }
                    .into());
                }
            }
        }

        if self.core.current_run().is_some() {
            self.core.bindings.bind(node_id, &definition, device_id)?;
        }
        graph.set_device(node_id, Some(device_id.to_string()))?;
        self.core.flush_changes(&mut graph);
        self.core.record_history(&graph);
        Ok(())
    }

    pub fn unbind_device(&self, node_id: &str) -> Result<()> {
        let mut graph = self.core.graph.lock();
        graph.set_device(node_id, None)?;
        self.core.bindings.unbind(node_id);
        self.core.flush_changes(&mut graph);
        self.core.record_history(&graph);
        Ok(())
    }

    /// Device a node is live-bound to during a run
    pub fn bound_device(&self, node_id: &str) -> Option<DeviceId> {
        self.core.bindings.device_for(node_id)
    }

    // ---- run control -----------------------------------------------------

    /// Validate, bind and start a run
    pub async fn start(&self) -> Result<()> {
        self.core.transition(EngineState::Initializing)?;
        let run = match self.prepare().await {
            Ok(run) => run,
            Err(FlowEngineError::Cancelled) => {
                log::warn!("Run setup interrupted in state {}", self.state());
                self.core.bindings.unbind_all();
                return Err(FlowEngineError::Cancelled);
            }
            Err(e) => {
                log::error!("Run setup failed: {}", e);
                self.core.bindings.unbind_all();
                self.core.finish_with_error(RunFailure::engine(e.to_string()));
                return Err(e);
            }
        };

        let entries = self.entry_nodes();
        log::info!("Run {} started with {} entry path(s)", run.id(), entries.len());
        for entry in entries {
            spawn_path(&self.core, &run, entry, None, None);
        }
        run.tracker.close();
        spawn_board_monitors(&self.core, &run);
        tokio::spawn(supervise(self.core.clone(), run));
        Ok(())
    }

    async fn prepare(&self) -> Result<Arc<RunContext>> {
        let problems = self.validate();
        for warning in problems.iter().filter(|p| !p.is_fatal()) {
            log::warn!("{}", warning);
        }
        let fatal: Vec<String> = problems
            .iter()
            .filter(|p| p.is_fatal())
            .map(|p| p.to_string())
            .collect();
        if !fatal.is_empty() {
            return Err(FlowEngineError::Validation(fatal.join("; ")));
        }

        let binds: Vec<(NodeId, NodeDefinition, DeviceId)> = {
            let graph = self.core.graph.lock();
            graph
                .nodes()
                .filter_map(|node| {
                    let definition = graph.definition(&node.node_type)?;
                    definition.hardware.as_ref()?;
                    let device = node.device.clone()?;
                    Some((node.id.clone(), definition.clone(), device))
                })
                .collect()
        };

        let mut boards: Vec<String> = binds
            .iter()
            .filter_map(|(_, _, device)| self.core.hardware.device(device))
            .map(|d| d.board_id)
            .collect();
        boards.sort();
        boards.dedup();
        self.core.hardware.connect_boards(&boards).await?;

        // An emergency stop may have landed while the boards were connecting
        if self.state() != EngineState::Initializing {
            self.core.disconnect_boards(&boards).await;
            return Err(FlowEngineError::Cancelled);
        }

        for (node_id, definition, device_id) in &binds {
            if let Err(e) = self.core.bindings.bind(node_id, definition, device_id) {
                self.core.disconnect_boards(&boards).await;
                return Err(e.into());
            }
        }

        self.core.graph.lock().reset_run_flags();
        self.core.transition(EngineState::Ready)?;
        let run = Arc::new(RunContext::new());
        *self.core.run.lock() = Some(run.clone());
        *self.core.last_error.lock() = None;
        self.core.transition(EngineState::Running)?;
        Ok(run)
    }

    /// Stop cooperatively: cancel, wait for paths, drive safe values
    pub async fn stop(&self) -> Result<()> {
        match self.state() {
            EngineState::Stopped => return Ok(()),
            EngineState::Stopping => {
                self.wait_until_idle().await;
                return Ok(());
            }
            _ => {}
        }

        let run = self.core.current_run();
        self.core.transition(EngineState::Stopping)?;
        let Some(run) = run else {
            return self.core.transition(EngineState::Stopped);
        };

        let owns_teardown = run.claim_teardown();
        run.set_paused(false);
        run.cancel();
        if !owns_teardown {
            self.wait_until_idle().await;
            return Ok(());
        }

        run.tracker.close();
        run.tracker.wait().await;
        self.core
            .release_hardware(self.core.config.drive_safe_state_on_stop)
            .await;

        if let Some(failure) = run.failure() {
            log::error!("Run {} failed before stop completed: {}", run.id(), failure);
            self.core.finish_with_error(failure);
            return Ok(());
        }
        *self.core.run.lock() = None;
        log::info!("Run {} stopped after {:?}", run.id(), run.elapsed());
        self.core.transition(EngineState::Stopped)
    }

    pub fn pause(&self) -> Result<()> {
        self.core.transition(EngineState::Paused)?;
        if let Some(run) = self.core.current_run() {
            run.set_paused(true);
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.core.transition(EngineState::Running)?;
        if let Some(run) = self.core.current_run() {
            run.set_paused(false);
        }
        Ok(())
    }

    /// Halt everything now and drive all bound devices to their safe state
    pub async fn emergency_stop(&self) {
        log::error!("Emergency stop requested");
        let run = self.core.current_run();
        if let Some(run) = &run {
            run.claim_teardown();
            run.cancel();
            run.abort_all();
        }

        let devices = self.core.bindings.bound_devices();
        tokio::join!(
            self.core.drive_safe(&devices),
            self.core.hardware.emergency_stop_all()
        );

        self.core.bindings.unbind_all();
        self.core.finish_with_error(RunFailure::engine("Emergency stop"));
    }

    /// Leave `Error`; clears the retained failure and node errors
    pub fn reset(&self) -> Result<()> {
        self.core.transition(EngineState::Stopped)?;
        *self.core.last_error.lock() = None;
        self.core.graph.lock().clear_errors();
        Ok(())
    }

    /// Wait until the engine is `Stopped` or in `Error`
    pub async fn wait_until_idle(&self) -> EngineState {
        let mut rx = self.core.state.subscribe();
        let idle = rx.wait_for(|state| state.is_idle()).await.map(|s| *s);
        idle.unwrap_or_else(|_| self.state())
    }
}

fn node_definition(graph: &FlowGraph, node_id: &str) -> Result<NodeDefinition> {
    let node = graph
        .get_node(node_id)
        .ok_or_else(|| GraphError::UnknownNode(node_id.to_string()))?;
    let definition = graph
        .definition(&node.node_type)
        .ok_or_else(|| GraphError::UnknownNodeType(node.node_type.clone()))?;
    Ok(definition.clone())
}

/// Tear the run down once every path has finished
async fn supervise(core: Arc<EngineCore>, run: Arc<RunContext>) {
    run.tracker.wait().await;
    let cancelled = run.is_cancelled();
    run.cancel();
    if !run.claim_teardown() {
        return;
    }

    match run.failure() {
        Some(failure) => {
            log::error!("Run {} failed: {}", run.id(), failure);
            core.release_hardware(core.config.drive_safe_state_on_stop)
                .await;
            core.finish_with_error(failure);
        }
        None => {
            if !cancelled {
                core.events.emit(EngineEvent::RunCompleted {
                    run_id: run.id().to_string(),
                    elapsed_ms: run.elapsed().as_millis() as u64,
                });
                log::info!("Run {} completed in {:?}", run.id(), run.elapsed());
            }
            if core.state() != EngineState::Stopping {
                if let Err(e) = core.transition(EngineState::Stopping) {
                    log::warn!("{}", e);
                }
            }
            core.release_hardware(false).await;
            *core.run.lock() = None;
            if let Err(e) = core.transition(EngineState::Stopped) {
                log::warn!("{}", e);
            }
        }
    }
}

/// Forward board errors and disconnects to the nodes bound to each board
fn spawn_board_monitors(core: &Arc<EngineCore>, run: &Arc<RunContext>) {
    let mut boards: Vec<String> = core
        .bindings
        .bound_devices()
        .iter()
        .filter_map(|id| core.hardware.device(id))
        .map(|d| d.board_id)
        .collect();
    boards.sort();
    boards.dedup();

    for board_id in boards {
        let Some(board) = core.hardware.board(&board_id) else {
            continue;
        };
        let mut events = board.subscribe();
        let core = core.clone();
        let run = run.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = run.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(BoardEvent::Error(message)) => message,
                        Ok(BoardEvent::StateChanged(ConnectionState::Disconnected)) => {
                            HardwareError::Disconnected(board_id.clone()).to_string()
                        }
                        Ok(BoardEvent::StateChanged(_)) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("Board '{}' monitor skipped {} event(s)", board_id, skipped);
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                log::warn!("Board '{}': {}", board_id, message);
                for node_id in core.bindings.nodes_on_board(&board_id) {
                    core.report_node_error(&node_id, &message, run.elapsed());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::context::{Fired, NodeContext};
    use crate::descriptor::{ErrorPolicy, HardwareRequirement};
    use crate::hardware::{Board, DeviceConfig, MockBoard, PinKind};
    use crate::registry::NodeOperation;
    use crate::types::{DataType, ExecutionMode, NodeCategory, PortDefinition};
    use async_trait::async_trait;
    use serde_json::json;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Start;

    #[async_trait]
    impl NodeOperation for Start {
        async fn execute(&self, _ctx: &NodeContext) -> Result<Fired> {
            Ok(Fired::one(0))
        }
    }

    struct Wait;

    #[async_trait]
    impl NodeOperation for Wait {
        async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
            let seconds = ctx.property_f64("seconds", 0.0);
            ctx.sleep(Duration::from_secs_f64(seconds)).await?;
            Ok(Fired::one(0))
        }
    }

    struct Record(Log);

    #[async_trait]
    impl NodeOperation for Record {
        async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
            self.0.lock().push(ctx.node_id().to_string());
            Ok(Fired::one(0))
        }
    }

    struct Write;

    #[async_trait]
    impl NodeOperation for Write {
        async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
            ctx.write_device(ctx.input(1)).await?;
            Ok(Fired::one(0))
        }
    }

    /// Runs its body twice, then continues
    struct Twice;

    #[async_trait]
    impl NodeOperation for Twice {
        async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
            ctx.fire_and_wait(0).await?;
            ctx.fire_and_wait(0).await?;
            Ok(Fired::one(1))
        }
    }

    struct Boom;

    #[async_trait]
    impl NodeOperation for Boom {
        async fn execute(&self, _ctx: &NodeContext) -> Result<Fired> {
            panic!("kaboom");
        }
    }

    struct Echo;

    #[async_trait]
    impl NodeOperation for Echo {
        fn recompute(&self, ctx: &mut crate::context::RecomputeContext<'_>) -> Result<()> {
            let value = ctx.input(0).clone();
            ctx.feed_input(ctx.node_id().to_string(), 0, value);
            Ok(())
        }
    }

    fn step(name: &str) -> NodeDefinition {
        NodeDefinition::new(name, NodeCategory::Experiment, ExecutionMode::Imperative)
            .with_input(PortDefinition::control("exec"))
            .with_output(PortDefinition::control("next"))
    }

    fn write_type(name: &str, policy: ErrorPolicy) -> NodeDefinition {
        step(name)
            .with_input(PortDefinition::data("value", DataType::Any).with_default(json!(true)))
            .with_hardware(HardwareRequirement::output(&[PinKind::Digital]))
            .with_error_policy(policy)
    }

    fn registry(log: &Log) -> Arc<NodeRegistry> {
        let mut registry = NodeRegistry::new();
        registry.register(
            NodeDefinition::new("Start", NodeCategory::Experiment, ExecutionMode::Imperative)
                .with_output(PortDefinition::control("next")),
            Arc::new(Start),
        );
        registry.register(step("Wait"), Arc::new(Wait));
        registry.register(step("Record"), Arc::new(Record(log.clone())));
        registry.register(write_type("Write", ErrorPolicy::BySeverity), Arc::new(Write));
        registry.register(write_type("WriteOrHalt", ErrorPolicy::Halt), Arc::new(Write));
        registry.register(
            NodeDefinition::new("Twice", NodeCategory::Experiment, ExecutionMode::Imperative)
                .with_input(PortDefinition::control("exec"))
                .with_output(PortDefinition::control("body"))
                .with_output(PortDefinition::control("next")),
            Arc::new(Twice),
        );
        registry.register(step("Boom"), Arc::new(Boom));
        registry.register(
            step("BoomContinue").with_error_policy(ErrorPolicy::Continue),
            Arc::new(Boom),
        );
        registry.register(
            NodeDefinition::new("Gate", NodeCategory::Experiment, ExecutionMode::Imperative)
                .with_input(PortDefinition::control("a"))
                .with_input(PortDefinition::control("b"))
                .with_output(PortDefinition::control("next")),
            Arc::new(Wait),
        );
        registry.register(
            NodeDefinition::new("Echo", NodeCategory::Logic, ExecutionMode::Reactive)
                .with_input(PortDefinition::data("value", DataType::Any))
                .with_output(PortDefinition::data("value", DataType::Any)),
            Arc::new(Echo),
        );
        Arc::new(registry)
    }

    struct Rig {
        engine: FlowEngine,
        board: Arc<MockBoard>,
        log: Log,
    }

    fn rig() -> Rig {
        rig_with(EngineConfig::default())
    }

    fn rig_with(config: EngineConfig) -> Rig {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let board = Arc::new(MockBoard::new("uno"));
        let hardware = Arc::new(HardwareManager::new());
        hardware.add_board(board.clone());
        hardware
            .add_device(DeviceConfig::digital_output("led", "uno", 13))
            .unwrap();
        hardware
            .add_device(DeviceConfig::digital_output("buzzer", "uno", 13))
            .unwrap();
        let engine = FlowEngine::new(registry(&log), hardware, config);
        Rig { engine, board, log }
    }

    fn load(rig: &Rig, builder: GraphBuilder) {
        let description = builder.build(&rig.engine.registry()).unwrap();
        rig.engine.load(&description).unwrap();
    }

    fn led_values(board: &MockBoard) -> Vec<Value> {
        board.writes_to(13).into_iter().map(|w| w.value).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_runs_both_paths_to_completion() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("fan")
                .node("start", "Start")
                .node("a", "Record")
                .node("b", "Record")
                .node("after_b", "Record")
                .connect("start", "next", "a", "exec")
                .connect("start", "next", "b", "exec")
                .connect("b", "next", "after_b", "exec"),
        );
        let mut events = rig.engine.subscribe(&[EventCategory::RunCompleted]);

        rig.engine.start().await.unwrap();
        assert_eq!(rig.engine.wait_until_idle().await, EngineState::Stopped);

        let mut seen = rig.log.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["a", "after_b", "b"]);
        assert!(matches!(&events.drain()[..], [EngineEvent::RunCompleted { .. }]));
        assert!(rig.engine.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_wait_waits_for_fanned_out_siblings() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("fan body")
                .node("start", "Start")
                .node("twice", "Twice")
                .node("fast", "Record")
                .node("slow", "Wait")
                .with_property("seconds", json!(1.0))
                .node("after_slow", "Record")
                .node("done", "Record")
                .connect("start", "next", "twice", "exec")
                .connect("twice", "body", "fast", "exec")
                .connect("twice", "body", "slow", "exec")
                .connect("slow", "next", "after_slow", "exec")
                .connect("twice", "next", "done", "exec"),
        );

        rig.engine.start().await.unwrap();
        assert_eq!(rig.engine.wait_until_idle().await, EngineState::Stopped);
        assert!(rig.engine.last_error().is_none());

        let seen = rig.log.lock().clone();
        assert_eq!(seen.iter().filter(|n| *n == "fast").count(), 2);
        assert_eq!(seen.iter().filter(|n| *n == "after_slow").count(), 2);
        assert_eq!(seen.last().map(String::as_str), Some("done"));
        assert!(rig.engine.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_sequence_on_natural_completion() {
        let rig = rig();
        load(&rig, GraphBuilder::new("one").node("start", "Start"));
        let mut events = rig.engine.subscribe(&[EventCategory::StateChanged]);

        rig.engine.start().await.unwrap();
        rig.engine.wait_until_idle().await;

        let states: Vec<EngineState> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                EngineState::Initializing,
                EngineState::Ready,
                EngineState::Running,
                EngineState::Stopping,
                EngineState::Stopped
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_keeps_remaining_delay() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("pause")
                .node("start", "Start")
                .node("wait", "Wait")
                .with_property("seconds", json!(2.0))
                .node("on", "Write")
                .with_device("led")
                .connect("start", "next", "wait", "exec")
                .connect("wait", "next", "on", "exec"),
        );
        rig.engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        rig.engine.pause().unwrap();
        assert_eq!(rig.engine.state(), EngineState::Paused);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rig.board.writes().is_empty());
        rig.engine.resume().unwrap();
        rig.engine.wait_until_idle().await;

        // 0.5s before the pause, 10s paused, 1.5s after
        let write = &rig.board.writes_to(13)[0];
        assert_eq!(write.value, json!(true));
        let drift = write.at.abs_diff(Duration::from_secs(12));
        assert!(drift < Duration::from_millis(50), "write at {:?}", write.at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_and_drives_safe_values() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("stop")
                .node("start", "Start")
                .node("on", "Write")
                .with_device("led")
                .node("wait", "Wait")
                .with_property("seconds", json!(3600.0))
                .node("never", "Record")
                .connect("start", "next", "on", "exec")
                .connect("on", "next", "wait", "exec")
                .connect("wait", "next", "never", "exec"),
        );

        rig.engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        rig.engine.stop().await.unwrap();

        assert_eq!(rig.engine.state(), EngineState::Stopped);
        assert_eq!(led_values(&rig.board), vec![json!(true), json!(false)]);
        assert!(rig.log.lock().is_empty());
        assert!(rig.engine.bound_device("on").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_mid_invocation() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("estop")
                .node("start", "Start")
                .node("on", "Write")
                .with_device("led")
                .node("wait", "Wait")
                .with_property("seconds", json!(60.0))
                .connect("start", "next", "on", "exec")
                .connect("on", "next", "wait", "exec"),
        );

        rig.engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        rig.engine.emergency_stop().await;

        assert_eq!(rig.engine.state(), EngineState::Error);
        assert_eq!(led_values(&rig.board), vec![json!(true), json!(false)]);
        assert_eq!(rig.board.emergency_stop_count(), 1);
        assert_eq!(rig.engine.last_error().unwrap().message, "Emergency stop");

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(rig.board.writes().len(), 2);

        rig.engine.reset().unwrap();
        assert_eq!(rig.engine.state(), EngineState::Stopped);
        assert!(rig.engine.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_while_boards_connect() {
        let rig = rig();
        rig.board.set_connect_delay(Duration::from_secs(1));
        load(
            &rig,
            GraphBuilder::new("slow connect")
                .node("start", "Start")
                .node("on", "Write")
                .with_device("led")
                .connect("start", "next", "on", "exec"),
        );

        let starting = {
            let engine = rig.engine.clone();
            tokio::spawn(async move { engine.start().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rig.engine.state(), EngineState::Initializing);
        rig.engine.emergency_stop().await;

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(FlowEngineError::Cancelled)));
        assert_eq!(rig.engine.state(), EngineState::Error);
        assert_eq!(rig.engine.last_error().unwrap().message, "Emergency stop");
        assert_eq!(rig.board.connection_state(), ConnectionState::Disconnected);
        assert!(rig.engine.bound_device("on").is_none());
        assert!(rig.board.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_becomes_node_fault() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("panic")
                .node("start", "Start")
                .node("boom", "BoomContinue")
                .node("after", "Record")
                .connect("start", "next", "boom", "exec")
                .connect("boom", "next", "after", "exec"),
        );
        let mut errors = rig.engine.subscribe(&[EventCategory::NodeError]);

        rig.engine.start().await.unwrap();
        assert_eq!(rig.engine.wait_until_idle().await, EngineState::Stopped);
        assert_eq!(*rig.log.lock(), vec!["after"]);
        assert_eq!(
            rig.engine.node_error("boom").as_deref(),
            Some("Node fault: kaboom")
        );
        assert_eq!(errors.drain().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_critical_fault_halts_run() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("halt")
                .node("start", "Start")
                .node("boom", "Boom")
                .node("after", "Record")
                .connect("start", "next", "boom", "exec")
                .connect("boom", "next", "after", "exec"),
        );

        rig.engine.start().await.unwrap();
        assert_eq!(rig.engine.wait_until_idle().await, EngineState::Error);
        assert!(rig.log.lock().is_empty());
        let failure = rig.engine.last_error().unwrap();
        assert_eq!(failure.node_id.as_deref(), Some("boom"));
        assert_eq!(failure.message, "Node fault: kaboom");

        // retained until reset
        assert!(rig.engine.start().await.is_err());
        rig.engine.reset().unwrap();
        assert!(rig.engine.node_error("boom").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_hardware_error_continues() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("soft")
                .node("start", "Start")
                .node("on", "Write")
                .with_device("led")
                .node("after", "Record")
                .connect("start", "next", "on", "exec")
                .connect("on", "next", "after", "exec"),
        );
        rig.board.fail_next_writes(1);

        rig.engine.start().await.unwrap();
        assert_eq!(rig.engine.wait_until_idle().await, EngineState::Stopped);
        assert_eq!(*rig.log.lock(), vec!["after"]);
        assert!(rig
            .engine
            .node_error("on")
            .unwrap()
            .starts_with("Device error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_policy_fails_run_on_soft_error() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("strict")
                .node("start", "Start")
                .node("on", "WriteOrHalt")
                .with_device("led")
                .node("after", "Record")
                .connect("start", "next", "on", "exec")
                .connect("on", "next", "after", "exec"),
        );
        rig.board.fail_next_writes(1);

        rig.engine.start().await.unwrap();
        assert_eq!(rig.engine.wait_until_idle().await, EngineState::Error);
        assert!(rig.log.lock().is_empty());
        assert_eq!(rig.engine.last_error().unwrap().node_id.as_deref(), Some("on"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hardware_timeout_is_soft() {
        let rig = rig_with(EngineConfig::default().with_hardware_timeout(Duration::from_secs(2)));
        rig.board.set_latency(Duration::from_secs(5));
        load(
            &rig,
            GraphBuilder::new("slow")
                .node("start", "Start")
                .node("on", "Write")
                .with_device("led")
                .node("after", "Record")
                .connect("start", "next", "on", "exec")
                .connect("on", "next", "after", "exec"),
        );

        rig.engine.start().await.unwrap();
        assert_eq!(rig.engine.wait_until_idle().await, EngineState::Stopped);
        assert_eq!(
            rig.engine.node_error("on").as_deref(),
            Some("Hardware call timed out after 2s")
        );
        assert_eq!(*rig.log.lock(), vec!["after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_entry_into_busy_node_is_invariant_violation() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("race")
                .node("s1", "Start")
                .node("s2", "Start")
                .node("gate", "Gate")
                .with_property("seconds", json!(1.0))
                .connect("s1", "next", "gate", "a")
                .connect("s2", "next", "gate", "b"),
        );

        rig.engine.start().await.unwrap();
        assert_eq!(rig.engine.wait_until_idle().await, EngineState::Error);
        assert!(rig
            .engine
            .last_error()
            .unwrap()
            .message
            .starts_with("Invariant violation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_depth_ceiling_fails_active_run() {
        let rig = rig_with(EngineConfig::default().with_max_propagation_depth(8));
        load(
            &rig,
            GraphBuilder::new("feedback")
                .node("start", "Start")
                .node("wait", "Wait")
                .with_property("seconds", json!(60.0))
                .node("echo", "Echo")
                .connect("start", "next", "wait", "exec"),
        );

        rig.engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let err = rig.engine.set_input("echo", 0, json!(1)).unwrap_err();
        assert!(matches!(
            err,
            FlowEngineError::PropagationDepthExceeded { depth: 9, .. }
        ));
        assert_eq!(rig.engine.wait_until_idle().await, EngineState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_failures_move_to_error() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("unbound")
                .node("start", "Start")
                .node("on", "Write")
                .connect("start", "next", "on", "exec"),
        );

        let err = rig.engine.start().await.unwrap_err();
        assert!(matches!(err, FlowEngineError::Validation(_)));
        assert_eq!(rig.engine.state(), EngineState::Error);
        assert!(rig.engine.last_error().unwrap().message.contains("no device"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_during_run() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("busy")
                .node("start", "Start")
                .node("wait", "Wait")
                .with_property("seconds", json!(5.0))
                .node("spare", "Record")
                .connect("start", "next", "wait", "exec"),
        );
        rig.engine.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            rig.engine.remove_node("wait"),
            Err(FlowEngineError::Graph(GraphError::RunActive(_)))
        ));
        rig.engine.remove_node("spare").unwrap();
        let description = rig.engine.description();
        assert!(matches!(
            rig.engine.load(&description),
            Err(FlowEngineError::Graph(GraphError::RunActive(_)))
        ));

        rig.engine.stop().await.unwrap();
        rig.engine.load(&description).unwrap();
    }

    #[test]
    fn test_bind_device_checks_other_nodes() {
        let rig = rig();
        load(
            &rig,
            GraphBuilder::new("pins")
                .node("on", "Write")
                .with_device("led")
                .node("beep", "Write"),
        );
        let err = rig.engine.bind_device("beep", "buzzer").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Pin 13 is already claimed by 'led', cannot assign to 'buzzer'"
        );
        rig.engine.bind_device("beep", "led").unwrap();
        assert_eq!(rig.engine.node("beep").unwrap().device.as_deref(), Some("led"));

        rig.engine.unbind_device("on").unwrap();
        rig.engine.unbind_device("beep").unwrap();
        rig.engine.bind_device("beep", "buzzer").unwrap();
    }

    #[test]
    fn test_graph_events_and_undo() {
        let rig = rig();
        let mut changes = rig.engine.subscribe(&[EventCategory::GraphChanged]);

        let id = rig
            .engine
            .add_node("Record", (0.0, 0.0), Map::new())
            .unwrap();
        assert!(matches!(
            &changes.drain()[..],
            [EngineEvent::GraphChanged {
                change: crate::graph::GraphChange::NodeAdded { .. }
            }]
        ));

        assert!(rig.engine.undo().unwrap());
        assert!(rig.engine.node(&id).is_none());
        assert!(rig.engine.redo().unwrap());
        assert!(rig.engine.node(&id).is_some());
        assert!(!rig.engine.redo().unwrap());
    }

    #[test]
    fn test_sample_outputs() {
        let rig = rig();
        rig.engine
            .add_node_with_id("echo", "Echo", (0.0, 0.0), Map::new())
            .unwrap();
        let sample = rig.engine.sample_outputs();
        assert_eq!(sample.outputs.len(), 1);
        assert_eq!(sample.value("echo", "value"), Some(&Value::Null));
    }
}
