//! Node-to-device binding
//!
//! A hardware node refers to a logical device by id. Binding resolves that
//! reference against the [`HardwareManager`], checks the node type's
//! requirement and the board's pin capabilities, and claims the device's
//! pin. Pins are owned per device: any number of nodes may share one device,
//! but two devices never share a physical pin.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::NodeDefinition;
use crate::error::{HardwareError, HwResult};
use crate::hardware::{DeviceConfig, DeviceHandle, HardwareManager};
use crate::types::{DeviceId, NodeId};

/// Live node-to-device binds for a run
pub struct BindingLayer {
    hardware: Arc<HardwareManager>,
    binds: Mutex<HashMap<NodeId, DeviceId>>,
}

impl BindingLayer {
    pub fn new(hardware: Arc<HardwareManager>) -> Self {
        Self {
            hardware,
            binds: Mutex::new(HashMap::new()),
        }
    }

    pub fn hardware(&self) -> &Arc<HardwareManager> {
        &self.hardware
    }

    /// Check that a node type can drive a device
    pub fn check_compatible(definition: &NodeDefinition, device: &DeviceConfig) -> HwResult<()> {
        let requirement = definition.hardware.as_ref().ok_or_else(|| {
            HardwareError::Capability(format!(
                "Node type '{}' does not use hardware",
                definition.node_type
            ))
        })?;
        if !requirement.accepts(device.kind, device.direction) {
            return Err(HardwareError::Capability(format!(
                "Node type '{}' cannot use {} {:?} device '{}'",
                definition.node_type, device.kind, device.direction, device.id
            )));
        }
        Ok(())
    }

    /// Validate a bind without claiming anything
    pub fn check_bind(&self, definition: &NodeDefinition, device_id: &str) -> HwResult<DeviceConfig> {
        let device = self.hardware.validate_device(device_id)?;
        Self::check_compatible(definition, &device)?;
        if let Some(existing) = self.hardware.pin_owner(&device.board_id, device.pin) {
            if existing != device.id {
                return Err(HardwareError::PinConflict {
                    pin: device.pin,
                    existing,
                    requested: device.id.clone(),
                });
            }
        }
        Ok(device)
    }

    /// Bind a node to a device, claiming the device's pin
    pub fn bind(&self, node_id: &str, definition: &NodeDefinition, device_id: &str) -> HwResult<()> {
        if self.device_for(node_id).as_deref() == Some(device_id) {
            return Ok(());
        }
        let previous = self.unbind(node_id);
        let claimed = self
            .check_bind(definition, device_id)
            .and_then(|_| self.hardware.claim(device_id));
        if let Err(e) = claimed {
            if let Some(previous) = previous {
                if self.hardware.claim(&previous).is_ok() {
                    self.binds.lock().insert(node_id.to_string(), previous);
                }
            }
            return Err(e);
        }
        self.binds
            .lock()
            .insert(node_id.to_string(), device_id.to_string());
        log::debug!("Bound node '{}' to device '{}'", node_id, device_id);
        Ok(())
    }

    /// Drop a node's bind; the pin is released once no node uses the device
    pub fn unbind(&self, node_id: &str) -> Option<DeviceId> {
        let mut binds = self.binds.lock();
        let device_id = binds.remove(node_id)?;
        if !binds.values().any(|d| *d == device_id) {
            self.hardware.release(&device_id);
        }
        log::debug!("Unbound node '{}' from device '{}'", node_id, device_id);
        Some(device_id)
    }

    pub fn unbind_all(&self) -> Vec<DeviceId> {
        let devices = self.bound_devices();
        self.binds.lock().clear();
        for device_id in &devices {
            self.hardware.release(device_id);
        }
        devices
    }

    pub fn device_for(&self, node_id: &str) -> Option<DeviceId> {
        self.binds.lock().get(node_id).cloned()
    }

    pub fn handle_for(&self, node_id: &str) -> Option<DeviceHandle> {
        let device_id = self.device_for(node_id)?;
        self.hardware.handle(&device_id).ok()
    }

    /// Distinct bound devices, sorted
    pub fn bound_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.binds.lock().values().cloned().collect();
        devices.sort();
        devices.dedup();
        devices
    }

    /// Nodes bound to any device on a board
    pub fn nodes_on_board(&self, board_id: &str) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .binds
            .lock()
            .iter()
            .filter(|(_, device_id)| {
                self.hardware
                    .device(device_id)
                    .map(|d| d.board_id == board_id)
                    .unwrap_or(false)
            })
            .map(|(node_id, _)| node_id.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub fn is_empty(&self) -> bool {
        self.binds.lock().is_empty()
    }
}
