//! Hardware abstraction consumed by the engine
//!
//! Board drivers implement [`Board`]; the engine never sees their
//! protocols. Logical devices ([`DeviceConfig`]) name a pin on a board,
//! the operation kind used on it, and the value it is driven to when a
//! run stops.
//!
//! # Example
//!
//! ```ignore
//! let drivers = DriverRegistry::with_defaults();
//! let hardware = HardwareManager::from_config(&config, &drivers)?;
//! hardware.connect_all().await?;
//! ```

pub mod manager;
pub mod mock;
pub mod pins;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{HardwareError, HwResult};
use crate::types::{value_as_bool, value_as_f64, DeviceId};

pub use manager::{BoardFactory, DriverRegistry, HardwareManager};
pub use mock::{MockBoard, WriteRecord};
pub use pins::{PinAllocation, PinManager};

/// Physical pin number on a board
pub type PinId = u32;

/// Operation kinds a pin can support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinKind {
    Digital,
    Analog,
    Pwm,
    Servo,
    I2c,
    Spi,
}

impl std::fmt::Display for PinKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Digital => "digital",
            Self::Analog => "analog",
            Self::Pwm => "pwm",
            Self::Servo => "servo",
            Self::I2c => "i2c",
            Self::Spi => "spi",
        };
        write!(f, "{}", name)
    }
}

/// Whether a device is read from or written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinDirection {
    Input,
    Output,
}

/// Connection state reported by a board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Reconnecting,
}

/// What a single pin can do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinCapability {
    pub pin: PinId,
    pub supported: Vec<PinKind>,
    /// Largest value accepted by analog-style writes
    pub max_value: u32,
}

impl PinCapability {
    pub fn supports(&self, kind: PinKind) -> bool {
        self.supported.contains(&kind)
    }
}

/// Capability descriptor of a board
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardCapabilities {
    pub name: String,
    pub pins: Vec<PinCapability>,
}

impl BoardCapabilities {
    pub fn pin(&self, pin: PinId) -> Option<&PinCapability> {
        self.pins.iter().find(|p| p.pin == pin)
    }
}

/// Asynchronous notifications from a board
#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    StateChanged(ConnectionState),
    Error(String),
}

/// Device contract implemented by board drivers
#[async_trait]
pub trait Board: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn capabilities(&self) -> BoardCapabilities;

    fn connection_state(&self) -> ConnectionState;

    async fn connect(&self) -> HwResult<()>;

    async fn disconnect(&self) -> HwResult<()>;

    /// Typed read of a pin
    async fn read(&self, pin: PinId, kind: PinKind) -> HwResult<Value>;

    /// Typed write to a pin
    async fn write(&self, pin: PinId, kind: PinKind, value: Value) -> HwResult<()>;

    /// Put every output of the board into its safe state
    async fn emergency_stop(&self) -> HwResult<()> {
        Ok(())
    }

    /// State-change and error channel
    fn subscribe(&self) -> broadcast::Receiver<BoardEvent>;
}

/// Configuration of a board instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardConfig {
    pub id: String,
    /// Driver name resolved against the [`DriverRegistry`]
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default)]
    pub settings: serde_json::Map<String, Value>,
}

/// A logical device: one pin on one board, used one way
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub id: DeviceId,
    pub name: String,
    pub board_id: String,
    pub pin: PinId,
    pub kind: PinKind,
    pub direction: PinDirection,
    /// Value written on stop and emergency stop; outputs default to off
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safe_value: Option<Value>,
}

impl DeviceConfig {
    /// Create a digital output device
    pub fn digital_output(
        id: impl Into<DeviceId>,
        board_id: impl Into<String>,
        pin: PinId,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            board_id: board_id.into(),
            pin,
            kind: PinKind::Digital,
            direction: PinDirection::Output,
            safe_value: None,
        }
    }

    /// Create an input device of the given kind
    pub fn input(
        id: impl Into<DeviceId>,
        board_id: impl Into<String>,
        pin: PinId,
        kind: PinKind,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            board_id: board_id.into(),
            pin,
            kind,
            direction: PinDirection::Input,
            safe_value: None,
        }
    }

    pub fn with_kind(mut self, kind: PinKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_safe_value(mut self, value: Value) -> Self {
        self.safe_value = Some(value);
        self
    }

    /// The declared safe value, if this device has one
    pub fn safe_value(&self) -> Option<Value> {
        if let Some(value) = &self.safe_value {
            return Some(value.clone());
        }
        match (self.direction, self.kind) {
            (PinDirection::Input, _) => None,
            (PinDirection::Output, PinKind::Digital) => Some(Value::Bool(false)),
            (PinDirection::Output, PinKind::Pwm | PinKind::Servo | PinKind::Analog) => {
                Some(Value::from(0))
            }
            (PinDirection::Output, PinKind::I2c | PinKind::Spi) => None,
        }
    }

    /// Convert a node value into what this device's pin kind expects
    pub fn encode(&self, value: &Value) -> HwResult<Value> {
        let encoded = match self.kind {
            PinKind::Digital => value_as_bool(value).map(Value::Bool),
            PinKind::Pwm | PinKind::Servo | PinKind::Analog => value_as_f64(value)
                .filter(|f| f.is_finite())
                .map(|f| Value::from(f.round() as i64)),
            PinKind::I2c | PinKind::Spi => Some(value.clone()),
        };
        encoded.ok_or_else(|| {
            HardwareError::InvalidValue(format!(
                "{} is not a valid {} value for device '{}'",
                value, self.kind, self.id
            ))
        })
    }
}

/// A device resolved against its board
#[derive(Clone)]
pub struct DeviceHandle {
    pub config: DeviceConfig,
    pub board: Arc<dyn Board>,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("config", &self.config)
            .field("board", &self.board.id())
            .finish()
    }
}

impl DeviceHandle {
    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub async fn read(&self) -> HwResult<Value> {
        self.board.read(self.config.pin, self.config.kind).await
    }

    pub async fn write(&self, value: &Value) -> HwResult<()> {
        let encoded = self.config.encode(value)?;
        self.board
            .write(self.config.pin, self.config.kind, encoded)
            .await
    }

    /// Drive the device to its safe value; inputs are left alone
    pub async fn drive_safe(&self) -> HwResult<()> {
        match self.config.safe_value() {
            Some(value) => self.write(&value).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_safe_values() {
        let led = DeviceConfig::digital_output("led", "board", 13);
        assert_eq!(led.safe_value(), Some(json!(false)));

        let motor = DeviceConfig::digital_output("motor", "board", 9).with_kind(PinKind::Pwm);
        assert_eq!(motor.safe_value(), Some(json!(0)));

        let sensor = DeviceConfig::input("sensor", "board", 2, PinKind::Digital);
        assert_eq!(sensor.safe_value(), None);

        let valve = DeviceConfig::digital_output("valve", "board", 4).with_safe_value(json!(true));
        assert_eq!(valve.safe_value(), Some(json!(true)));
    }

    #[test]
    fn test_encode() {
        let led = DeviceConfig::digital_output("led", "board", 13);
        assert_eq!(led.encode(&json!("HIGH")).unwrap(), json!(true));
        assert_eq!(led.encode(&json!(0)).unwrap(), json!(false));
        assert!(led.encode(&json!({"a": 1})).is_err());

        let pwm = DeviceConfig::digital_output("pwm", "board", 9).with_kind(PinKind::Pwm);
        assert_eq!(pwm.encode(&json!(127.6)).unwrap(), json!(128));
        assert_eq!(pwm.encode(&json!(true)).unwrap(), json!(1));
    }

    #[test]
    fn test_device_config_serde() {
        let json = json!({
            "id": "led",
            "name": "Red LED",
            "boardId": "arduino",
            "pin": 13,
            "kind": "digital",
            "direction": "output"
        });
        let device: DeviceConfig = serde_json::from_value(json).unwrap();
        assert_eq!(device.board_id, "arduino");
        assert_eq!(device.kind, PinKind::Digital);
        assert!(device.safe_value.is_none());
    }
}
