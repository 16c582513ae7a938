//! Board and device bookkeeping
//!
//! [`DriverRegistry`] maps driver names to board factories and is
//! populated once at startup. [`HardwareManager`] owns the boards, the
//! logical devices configured on them and one [`PinManager`] per board.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};

use super::{
    Board, BoardConfig, ConnectionState, DeviceConfig, DeviceHandle, MockBoard, PinAllocation,
    PinId, PinManager,
};
use crate::config::HardwareConfig;
use crate::error::{HardwareError, HwResult};

/// Factory that builds a board from its configuration
pub type BoardFactory = Arc<dyn Fn(&BoardConfig) -> HwResult<Arc<dyn Board>> + Send + Sync>;

/// Registry of board drivers
pub struct DriverRegistry {
    factories: HashMap<String, BoardFactory>,
}

impl DriverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the simulated `mock` driver
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("mock", |config: &BoardConfig| {
            Ok(Arc::new(MockBoard::new(config.id.clone())) as Arc<dyn Board>)
        });
        registry
    }

    pub fn register<F>(&mut self, driver: impl Into<String>, factory: F)
    where
        F: Fn(&BoardConfig) -> HwResult<Arc<dyn Board>> + Send + Sync + 'static,
    {
        self.factories.insert(driver.into(), Arc::new(factory));
    }

    pub fn has_driver(&self, driver: &str) -> bool {
        self.factories.contains_key(driver)
    }

    /// Registered driver names, sorted
    pub fn drivers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn create(&self, config: &BoardConfig) -> HwResult<Arc<dyn Board>> {
        let factory = self
            .factories
            .get(&config.driver)
            .ok_or_else(|| HardwareError::UnknownDriver(config.driver.clone()))?;
        factory(config)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of boards, devices and pin allocations
pub struct HardwareManager {
    boards: RwLock<Vec<Arc<dyn Board>>>,
    devices: RwLock<HashMap<String, DeviceConfig>>,
    pins: Mutex<HashMap<String, PinManager>>,
}

impl HardwareManager {
    pub fn new() -> Self {
        Self {
            boards: RwLock::new(Vec::new()),
            devices: RwLock::new(HashMap::new()),
            pins: Mutex::new(HashMap::new()),
        }
    }

    /// Build boards through the driver registry and register all devices
    pub fn from_config(config: &HardwareConfig, drivers: &DriverRegistry) -> HwResult<Self> {
        let manager = Self::new();
        for board in &config.boards {
            manager.create_board(board, drivers)?;
        }
        for device in &config.devices {
            manager.add_device(device.clone())?;
        }
        Ok(manager)
    }

    /// Register a board, replacing any board with the same id
    pub fn add_board(&self, board: Arc<dyn Board>) {
        let id = board.id().to_string();
        self.pins
            .lock()
            .insert(id.clone(), PinManager::new(id.clone(), board.capabilities()));
        let mut boards = self.boards.write();
        boards.retain(|b| b.id() != id);
        boards.push(board);
        log::info!("Registered board '{}'", id);
    }

    pub fn create_board(
        &self,
        config: &BoardConfig,
        drivers: &DriverRegistry,
    ) -> HwResult<Arc<dyn Board>> {
        let board = drivers.create(config)?;
        self.add_board(board.clone());
        Ok(board)
    }

    pub fn board(&self, id: &str) -> Option<Arc<dyn Board>> {
        self.boards.read().iter().find(|b| b.id() == id).cloned()
    }

    pub fn boards(&self) -> Vec<Arc<dyn Board>> {
        self.boards.read().clone()
    }

    /// Register a device after checking its pin against the board capabilities
    pub fn add_device(&self, device: DeviceConfig) -> HwResult<()> {
        {
            let pins = self.pins.lock();
            let manager = pins
                .get(&device.board_id)
                .ok_or_else(|| HardwareError::UnknownBoard(device.board_id.clone()))?;
            manager.validate_pin(device.pin, device.kind)?;
        }
        log::debug!(
            "Registered device '{}' on board '{}' pin {}",
            device.id,
            device.board_id,
            device.pin
        );
        self.devices.write().insert(device.id.clone(), device);
        Ok(())
    }

    pub fn remove_device(&self, id: &str) -> Option<DeviceConfig> {
        self.release(id);
        self.devices.write().remove(id)
    }

    pub fn device(&self, id: &str) -> Option<DeviceConfig> {
        self.devices.read().get(id).cloned()
    }

    /// All devices, sorted by id
    pub fn devices(&self) -> Vec<DeviceConfig> {
        let mut devices: Vec<DeviceConfig> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Resolve a device against its board
    pub fn handle(&self, device_id: &str) -> HwResult<DeviceHandle> {
        let config = self
            .device(device_id)
            .ok_or_else(|| HardwareError::UnknownDevice(device_id.to_string()))?;
        let board = self
            .board(&config.board_id)
            .ok_or_else(|| HardwareError::UnknownBoard(config.board_id.clone()))?;
        Ok(DeviceHandle { config, board })
    }

    /// Check a device's pin against the capability descriptor without claiming it
    pub fn validate_device(&self, device_id: &str) -> HwResult<DeviceConfig> {
        let config = self
            .device(device_id)
            .ok_or_else(|| HardwareError::UnknownDevice(device_id.to_string()))?;
        let pins = self.pins.lock();
        let manager = pins
            .get(&config.board_id)
            .ok_or_else(|| HardwareError::UnknownBoard(config.board_id.clone()))?;
        manager.validate_pin(config.pin, config.kind)?;
        Ok(config)
    }

    /// Claim the device's pin on its board
    pub fn claim(&self, device_id: &str) -> HwResult<()> {
        let config = self
            .device(device_id)
            .ok_or_else(|| HardwareError::UnknownDevice(device_id.to_string()))?;
        let mut pins = self.pins.lock();
        let manager = pins
            .get_mut(&config.board_id)
            .ok_or_else(|| HardwareError::UnknownBoard(config.board_id.clone()))?;
        manager.allocate(config.pin, config.kind, &config.id)
    }

    /// Release every pin held by the device
    pub fn release(&self, device_id: &str) {
        let board_id = match self.devices.read().get(device_id) {
            Some(config) => config.board_id.clone(),
            None => return,
        };
        if let Some(manager) = self.pins.lock().get_mut(&board_id) {
            manager.release_owner(device_id);
        }
    }

    pub fn pin_owner(&self, board_id: &str, pin: PinId) -> Option<String> {
        self.pins
            .lock()
            .get(board_id)
            .and_then(|m| m.owner_of(pin).map(|s| s.to_string()))
    }

    pub fn allocations(&self, board_id: &str) -> Vec<PinAllocation> {
        self.pins
            .lock()
            .get(board_id)
            .map(|m| m.allocations())
            .unwrap_or_default()
    }

    /// Connect the given boards, skipping ones already connected
    pub async fn connect_boards(&self, board_ids: &[String]) -> HwResult<()> {
        for board_id in board_ids {
            let board = self
                .board(board_id)
                .ok_or_else(|| HardwareError::UnknownBoard(board_id.clone()))?;
            if board.connection_state() != ConnectionState::Connected {
                log::info!("Connecting board '{}'", board_id);
                board.connect().await?;
            }
        }
        Ok(())
    }

    pub async fn connect_all(&self) -> HwResult<()> {
        let ids: Vec<String> = self.boards().iter().map(|b| b.id().to_string()).collect();
        self.connect_boards(&ids).await
    }

    pub async fn disconnect_all(&self) {
        for board in self.boards() {
            if let Err(e) = board.disconnect().await {
                log::warn!("Failed to disconnect board '{}': {}", board.id(), e);
            }
        }
    }

    /// Ask every board to enter its safe state, concurrently
    pub async fn emergency_stop_all(&self) {
        let boards = self.boards();
        let results = join_all(boards.iter().map(|b| b.emergency_stop())).await;
        for (board, result) in boards.iter().zip(results) {
            if let Err(e) = result {
                log::error!("Emergency stop failed on board '{}': {}", board.id(), e);
            }
        }
    }
}

impl Default for HardwareManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{PinDirection, PinKind};

    fn config() -> HardwareConfig {
        HardwareConfig {
            boards: vec![BoardConfig {
                id: "uno".into(),
                driver: "mock".into(),
                port: None,
                settings: Default::default(),
            }],
            devices: vec![DeviceConfig::digital_output("led", "uno", 13)],
        }
    }

    #[test]
    fn test_from_config() {
        let manager = HardwareManager::from_config(&config(), &DriverRegistry::with_defaults())
            .unwrap();
        assert!(manager.board("uno").is_some());
        let led = manager.device("led").unwrap();
        assert_eq!(led.direction, PinDirection::Output);
        assert_eq!(manager.handle("led").unwrap().board.id(), "uno");
    }

    #[test]
    fn test_unknown_driver() {
        let mut cfg = config();
        cfg.boards[0].driver = "telemetrix".into();
        let result = HardwareManager::from_config(&cfg, &DriverRegistry::with_defaults());
        assert!(matches!(result, Err(HardwareError::UnknownDriver(_))));
    }

    #[test]
    fn test_device_on_unknown_board() {
        let manager = HardwareManager::new();
        let err = manager
            .add_device(DeviceConfig::digital_output("led", "missing", 13))
            .unwrap_err();
        assert!(matches!(err, HardwareError::UnknownBoard(_)));
    }

    #[test]
    fn test_device_pin_must_support_kind() {
        let manager = HardwareManager::new();
        manager.add_board(Arc::new(MockBoard::new("uno")));
        let err = manager
            .add_device(DeviceConfig::input("cam", "uno", 3, PinKind::Spi))
            .unwrap_err();
        assert!(matches!(err, HardwareError::Capability(_)));
    }

    #[test]
    fn test_claim_conflict_between_devices() {
        let manager = HardwareManager::new();
        manager.add_board(Arc::new(MockBoard::new("uno")));
        manager
            .add_device(DeviceConfig::digital_output("led", "uno", 13))
            .unwrap();
        manager
            .add_device(DeviceConfig::digital_output("buzzer", "uno", 13))
            .unwrap();

        manager.claim("led").unwrap();
        let err = manager.claim("buzzer").unwrap_err();
        assert!(matches!(err, HardwareError::PinConflict { pin: 13, .. }));

        manager.release("led");
        manager.claim("buzzer").unwrap();
        assert_eq!(manager.pin_owner("uno", 13).as_deref(), Some("buzzer"));
    }

    #[tokio::test]
    async fn test_connect_all() {
        let manager = HardwareManager::from_config(&config(), &DriverRegistry::with_defaults())
            .unwrap();
        manager.connect_all().await.unwrap();
        let board = manager.board("uno").unwrap();
        assert_eq!(board.connection_state(), ConnectionState::Connected);
        manager.disconnect_all().await;
        assert_eq!(board.connection_state(), ConnectionState::Disconnected);
    }
}
