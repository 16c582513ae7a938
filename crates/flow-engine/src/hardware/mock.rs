//! Simulated board for tests and dry runs
//!
//! Mirrors a 54-pin microcontroller where every pin supports digital,
//! analog and PWM. Writes are logged with the time they happened, reads
//! can be scripted, and failures or latency can be injected.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{Board, BoardCapabilities, BoardEvent, ConnectionState, PinCapability, PinId, PinKind};
use crate::error::{HardwareError, HwResult};

const PIN_COUNT: PinId = 54;
const MAX_VALUE: u32 = 255;

/// One write observed by the mock board
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub pin: PinId,
    pub kind: PinKind,
    pub value: Value,
    /// Time since the board was created
    pub at: Duration,
}

#[derive(Default)]
struct MockState {
    values: HashMap<PinId, Value>,
    scripted_reads: HashMap<PinId, VecDeque<HwResult<Value>>>,
    writes: Vec<WriteRecord>,
    failing_writes: usize,
    latency: Duration,
    connect_delay: Duration,
    emergency_stops: usize,
}

/// In-memory [`Board`] implementation
pub struct MockBoard {
    id: String,
    name: String,
    created: Instant,
    connection: Mutex<ConnectionState>,
    state: Mutex<MockState>,
    events: broadcast::Sender<BoardEvent>,
}

impl MockBoard {
    pub fn new(id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            id: id.into(),
            name: "Mock Board".to_string(),
            created: Instant::now(),
            connection: Mutex::new(ConnectionState::Disconnected),
            state: Mutex::new(MockState::default()),
            events,
        }
    }

    /// Delay every read and write by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        self.state.lock().latency = latency;
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Delay `connect` by `delay`
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Set the level a pin reports when read
    pub fn set_pin_value(&self, pin: PinId, value: Value) {
        self.state.lock().values.insert(pin, value);
    }

    /// Queue results returned by successive reads of a pin
    ///
    /// Once the queue is drained reads fall back to the pin value.
    pub fn script_reads(&self, pin: PinId, results: impl IntoIterator<Item = HwResult<Value>>) {
        self.state
            .lock()
            .scripted_reads
            .entry(pin)
            .or_default()
            .extend(results);
    }

    /// Make the next `count` writes fail with a device error
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.lock().writes.clone()
    }

    pub fn writes_to(&self, pin: PinId) -> Vec<WriteRecord> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.pin == pin)
            .cloned()
            .collect()
    }

    pub fn emergency_stop_count(&self) -> usize {
        self.state.lock().emergency_stops
    }

    /// Broadcast a board error to subscribers
    pub fn simulate_error(&self, message: impl Into<String>) {
        let _ = self.events.send(BoardEvent::Error(message.into()));
    }

    /// Drop the connection as if the cable was pulled
    pub fn simulate_disconnect(&self) {
        self.set_connection(ConnectionState::Disconnected);
    }

    fn set_connection(&self, state: ConnectionState) {
        *self.connection.lock() = state;
        let _ = self.events.send(BoardEvent::StateChanged(state));
    }

    fn ensure_connected(&self) -> HwResult<()> {
        if *self.connection.lock() != ConnectionState::Connected {
            return Err(HardwareError::Disconnected(self.id.clone()));
        }
        Ok(())
    }

    fn check_pin(&self, pin: PinId) -> HwResult<()> {
        if pin >= PIN_COUNT {
            return Err(HardwareError::Capability(format!(
                "Pin {} does not exist on board '{}'",
                pin, self.id
            )));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Board for MockBoard {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> BoardCapabilities {
        BoardCapabilities {
            name: self.name.clone(),
            pins: (0..PIN_COUNT)
                .map(|pin| PinCapability {
                    pin,
                    supported: vec![PinKind::Digital, PinKind::Analog, PinKind::Pwm],
                    max_value: MAX_VALUE,
                })
                .collect(),
        }
    }

    fn connection_state(&self) -> ConnectionState {
        *self.connection.lock()
    }

    async fn connect(&self) -> HwResult<()> {
        let delay = self.state.lock().connect_delay;
        if !delay.is_zero() {
            self.set_connection(ConnectionState::Connecting);
            tokio::time::sleep(delay).await;
        }
        self.set_connection(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> HwResult<()> {
        self.set_connection(ConnectionState::Disconnected);
        Ok(())
    }

    async fn read(&self, pin: PinId, kind: PinKind) -> HwResult<Value> {
        self.simulate_latency().await;
        self.ensure_connected()?;
        self.check_pin(pin)?;

        let mut state = self.state.lock();
        if let Some(result) = state.scripted_reads.get_mut(&pin).and_then(|q| q.pop_front()) {
            if let Ok(value) = &result {
                state.values.insert(pin, value.clone());
            }
            return result;
        }
        let value = state.values.get(&pin).cloned().unwrap_or(match kind {
            PinKind::Digital => Value::Bool(false),
            _ => Value::from(0),
        });
        Ok(value)
    }

    async fn write(&self, pin: PinId, kind: PinKind, value: Value) -> HwResult<()> {
        self.simulate_latency().await;
        self.ensure_connected()?;
        self.check_pin(pin)?;

        if matches!(kind, PinKind::Pwm | PinKind::Analog) {
            let in_range = value
                .as_f64()
                .map(|v| (0.0..=MAX_VALUE as f64).contains(&v))
                .unwrap_or(false);
            if !in_range {
                return Err(HardwareError::InvalidValue(format!(
                    "{} is outside 0..={} on pin {}",
                    value, MAX_VALUE, pin
                )));
            }
        }

        let mut state = self.state.lock();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(HardwareError::device(format!(
                "Simulated write failure on pin {}",
                pin
            )));
        }
        state.values.insert(pin, value.clone());
        state.writes.push(WriteRecord {
            pin,
            kind,
            value,
            at: self.created.elapsed(),
        });
        Ok(())
    }

    async fn emergency_stop(&self) -> HwResult<()> {
        self.state.lock().emergency_stops += 1;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }
}
