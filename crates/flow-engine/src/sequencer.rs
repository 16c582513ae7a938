//! Control-flow sequencer
//!
//! A control path starts at an entry node and follows fired Control
//! outputs. Each step honours pause and cancellation, invokes the node's
//! operation and resolves the targets of whatever it fired. The first
//! target continues the current path; further targets become sibling
//! paths on the run's task tracker. Paths started under a sub-path scope
//! spawn their siblings into that scope too, so whoever opened it can wait
//! for all of them.
//!
//! Faults are classified at the invocation boundary:
//!
//! - hardware errors go through the node type's [`ErrorPolicy`]
//! - engine-level errors fail the whole run
//! - any other error, or a panic, becomes [`HardwareError::NodeFault`]
//!
//! [`ErrorPolicy`]: crate::descriptor::ErrorPolicy

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio_util::task::TaskTracker;

use crate::context::{Fired, NodeContext};
use crate::descriptor::NodeDefinition;
use crate::engine::EngineCore;
use crate::error::{FlowEngineError, HardwareError};
use crate::run::{RunContext, RunFailure};
use crate::types::NodeId;

/// How a control path ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathOutcome {
    Completed,
    Cancelled,
    /// A node error halted the path under its error policy
    Halted,
    /// An engine-level error
    Failed,
}

/// Spawn a path on the run's tracker, and on `scope` when given
pub(crate) fn spawn_path(
    core: &Arc<EngineCore>,
    run: &Arc<RunContext>,
    entry: NodeId,
    via: Option<usize>,
    scope: Option<&TaskTracker>,
) {
    let path = run_path(core.clone(), run.clone(), entry.clone(), via, scope.cloned());
    run.spawn(scope, async move {
        let outcome = path.await;
        log::debug!("Path from '{}' ended: {:?}", entry, outcome);
    });
}

/// Drive one control path to its end
///
/// `via` is the control input the path enters `entry` through, `None` for
/// entry nodes.
fn run_path(
    core: Arc<EngineCore>,
    run: Arc<RunContext>,
    entry: NodeId,
    via: Option<usize>,
    scope: Option<TaskTracker>,
) -> BoxFuture<'static, PathOutcome> {
    async move {
        let mut current = (entry, via);
        loop {
            let mut targets = match step(&core, &run, &current.0, current.1).await {
                Ok(targets) => targets,
                Err(outcome) => return outcome,
            };
            if targets.is_empty() {
                return PathOutcome::Completed;
            }
            let (next, port) = targets.remove(0);
            for (sibling, sibling_port) in targets {
                spawn_path(&core, &run, sibling, Some(sibling_port), scope.as_ref());
            }
            current = (next, Some(port));
        }
    }
    .boxed()
}

/// Invoke one node; returns the nodes entered by its fired outputs
async fn step(
    core: &Arc<EngineCore>,
    run: &Arc<RunContext>,
    node_id: &str,
    via: Option<usize>,
) -> Result<Vec<(NodeId, usize)>, PathOutcome> {
    if run.checkpoint().await.is_err() {
        return Err(PathOutcome::Cancelled);
    }

    let resolved = {
        let graph = core.graph.lock();
        graph.get_node(node_id).and_then(|node| {
            let definition = graph.definition(&node.node_type)?.clone();
            let operation = graph.registry().get_operation(&node.node_type)?;
            Some((definition, operation))
        })
    };
    let Some((definition, operation)) = resolved else {
        log::warn!("Control path reached missing node '{}'", node_id);
        return Ok(Vec::new());
    };

    if run.enter(node_id) && !definition.reentrant {
        run.leave(node_id);
        let error = FlowEngineError::invariant(format!(
            "Node '{}' invoked while already active",
            node_id
        ));
        fail_run(core, run, Some(node_id), &error);
        return Err(PathOutcome::Failed);
    }

    log::trace!("Executing node '{}' ({})", node_id, definition.node_type);
    let ctx = NodeContext::new(core.clone(), run.clone(), node_id.to_string(), via);
    let result = AssertUnwindSafe(operation.execute(&ctx)).catch_unwind().await;
    run.leave(node_id);

    let fired = match result {
        Ok(Ok(fired)) => fired,
        Ok(Err(FlowEngineError::Cancelled)) => return Err(PathOutcome::Cancelled),
        Ok(Err(FlowEngineError::PathHalted { node_id: halted, message })) => {
            run.record_failure(RunFailure::new(Some(halted), message));
            run.cancel();
            return Err(PathOutcome::Halted);
        }
        Ok(Err(FlowEngineError::Hardware(error))) => {
            apply_policy(core, run, node_id, &definition, error)?
        }
        Ok(Err(error)) if error.is_engine_level() => {
            fail_run(core, run, Some(node_id), &error);
            return Err(PathOutcome::Failed);
        }
        Ok(Err(error)) => {
            let fault = HardwareError::NodeFault(error.to_string());
            apply_policy(core, run, node_id, &definition, fault)?
        }
        Err(panic) => {
            let fault = HardwareError::NodeFault(panic_message(panic));
            apply_policy(core, run, node_id, &definition, fault)?
        }
    };

    let mut graph = core.graph.lock();
    let mut targets = Vec::new();
    for &index in fired.indices() {
        graph.mark_fired(node_id, index);
        targets.extend(graph.control_targets(node_id, index));
    }
    Ok(targets)
}

/// Decide whether a failed node halts its path or continues
fn apply_policy(
    core: &EngineCore,
    run: &RunContext,
    node_id: &str,
    definition: &NodeDefinition,
    error: HardwareError,
) -> Result<Fired, PathOutcome> {
    let message = error.to_string();
    core.report_node_error_once(node_id, &message, run.elapsed());

    if definition.error_policy.should_halt(&error) {
        log::error!("Node '{}' halted its path: {}", node_id, message);
        run.record_failure(RunFailure::new(Some(node_id.to_string()), message));
        run.cancel();
        return Err(PathOutcome::Halted);
    }

    log::warn!("Node '{}' failed, continuing: {}", node_id, message);
    Ok(definition
        .default_control_output()
        .map(Fired::one)
        .unwrap_or_default())
}

fn fail_run(core: &EngineCore, run: &RunContext, node_id: Option<&str>, error: &FlowEngineError) {
    let message = error.to_string();
    log::error!("Run failed: {}", message);
    if let Some(node_id) = node_id {
        core.report_node_error_once(node_id, &message, run.elapsed());
    }
    run.record_failure(RunFailure::new(node_id.map(String::from), message));
    run.cancel();
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "node operation panicked".to_string()
    }
}
