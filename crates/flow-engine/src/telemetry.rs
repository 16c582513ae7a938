//! Telemetry snapshots of Data outputs
//!
//! `OutputChanged` events already stream every value change. The sampler
//! here complements them for consumers that want fixed-rate rows, such as
//! CSV loggers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::FlowEngine;
use crate::types::NodeId;

/// One Data output value at sampling time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSample {
    pub node_id: NodeId,
    pub node_title: String,
    pub port_index: usize,
    pub port_name: String,
    pub value: Value,
}

/// Snapshot of every Data output in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub elapsed_ms: u64,
    pub outputs: Vec<OutputSample>,
}

impl TelemetrySample {
    pub fn value(&self, node_id: &str, port_name: &str) -> Option<&Value> {
        self.outputs
            .iter()
            .find(|o| o.node_id == node_id && o.port_name == port_name)
            .map(|o| &o.value)
    }
}

impl FlowEngine {
    /// Snapshot every Data output
    pub fn sample_outputs(&self) -> TelemetrySample {
        let elapsed_ms = self.elapsed().as_millis() as u64;
        let outputs = self.with_graph(|graph| {
            graph
                .nodes()
                .flat_map(|node| {
                    node.outputs.iter().filter(|p| p.is_data()).map(move |port| OutputSample {
                        node_id: node.id.clone(),
                        node_title: node.title.clone(),
                        port_index: port.index,
                        port_name: port.name.clone(),
                        value: port.value.clone(),
                    })
                })
                .collect()
        });
        TelemetrySample {
            elapsed_ms,
            outputs,
        }
    }
}

/// Periodic sampler started by [`spawn_sampler`]
pub struct TelemetrySampler {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TelemetrySampler {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop sampling and wait for the task to finish
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            log::warn!("Telemetry sampler ended abnormally: {}", e);
        }
    }
}

/// Sample the engine's outputs every `interval` until cancelled
pub fn spawn_sampler<F>(engine: FlowEngine, interval: Duration, mut sink: F) -> TelemetrySampler
where
    F: FnMut(TelemetrySample) + Send + 'static,
{
    let token = CancellationToken::new();
    let task_token = token.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = task_token.cancelled() => break,
                _ = ticker.tick() => sink(engine.sample_outputs()),
            }
        }
        log::debug!("Telemetry sampler stopped");
    });
    TelemetrySampler { token, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::config::EngineConfig;
    use crate::hardware::HardwareManager;
    use crate::registry::NodeRegistry;

    fn engine() -> FlowEngine {
        FlowEngine::new(
            Arc::new(NodeRegistry::new()),
            Arc::new(HardwareManager::new()),
            EngineConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_ticks_until_stopped() {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let sink = samples.clone();
        let sampler = spawn_sampler(engine(), Duration::from_millis(100), move |sample| {
            sink.lock().push(sample)
        });

        // First tick is immediate, then one every 100ms
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(samples.lock().len(), 5);
        assert!(samples.lock().iter().all(|s| s.outputs.is_empty()));

        sampler.stop().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(samples.lock().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_token_ends_sampler() {
        let count = Arc::new(Mutex::new(0usize));
        let sink = count.clone();
        let sampler = spawn_sampler(engine(), Duration::from_millis(50), move |_| {
            *sink.lock() += 1
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        sampler.token().cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let seen = *count.lock();
        assert_eq!(seen, 3);
        assert!(sampler.handle.is_finished());
        sampler.stop().await;
    }
}
