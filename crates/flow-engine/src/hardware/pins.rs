//! Per-board pin allocation
//!
//! A pin is owned by at most one device at a time. Allocation is checked
//! against the board's capability descriptor so a device can never claim
//! a pin for an operation the pin does not support.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{BoardCapabilities, PinId, PinKind};
use crate::error::{HardwareError, HwResult};

/// A claimed pin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinAllocation {
    pub pin: PinId,
    pub kind: PinKind,
    /// Device that owns the pin
    pub owner: String,
}

/// Tracks which device owns which pin on a single board
#[derive(Debug, Clone)]
pub struct PinManager {
    board_id: String,
    capabilities: BoardCapabilities,
    allocations: HashMap<PinId, PinAllocation>,
}

impl PinManager {
    pub fn new(board_id: impl Into<String>, capabilities: BoardCapabilities) -> Self {
        Self {
            board_id: board_id.into(),
            capabilities,
            allocations: HashMap::new(),
        }
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    /// Check that the pin exists and supports the operation kind
    pub fn validate_pin(&self, pin: PinId, kind: PinKind) -> HwResult<()> {
        let capability = self.capabilities.pin(pin).ok_or_else(|| {
            HardwareError::Capability(format!(
                "Pin {} does not exist on board '{}'",
                pin, self.board_id
            ))
        })?;
        if !capability.supports(kind) {
            return Err(HardwareError::Capability(format!(
                "Pin {} on board '{}' does not support {}",
                pin, self.board_id, kind
            )));
        }
        Ok(())
    }

    /// Owner of a pin, if claimed
    pub fn owner_of(&self, pin: PinId) -> Option<&str> {
        self.allocations.get(&pin).map(|a| a.owner.as_str())
    }

    /// Claim a pin for a device
    ///
    /// Claiming a pin the same device already owns is a no-op.
    pub fn allocate(&mut self, pin: PinId, kind: PinKind, owner: &str) -> HwResult<()> {
        self.validate_pin(pin, kind)?;
        if let Some(existing) = self.allocations.get(&pin) {
            if existing.owner == owner {
                return Ok(());
            }
            return Err(HardwareError::PinConflict {
                pin,
                existing: existing.owner.clone(),
                requested: owner.to_string(),
            });
        }
        self.allocations.insert(
            pin,
            PinAllocation {
                pin,
                kind,
                owner: owner.to_string(),
            },
        );
        log::debug!("Board '{}': pin {} claimed by '{}'", self.board_id, pin, owner);
        Ok(())
    }

    /// Claim several pins for one device, all or nothing
    pub fn allocate_all(&mut self, pins: &[(PinId, PinKind)], owner: &str) -> HwResult<()> {
        for (pin, kind) in pins {
            self.validate_pin(*pin, *kind)?;
            if let Some(existing) = self.allocations.get(pin) {
                if existing.owner != owner {
                    return Err(HardwareError::PinConflict {
                        pin: *pin,
                        existing: existing.owner.clone(),
                        requested: owner.to_string(),
                    });
                }
            }
        }
        for (pin, kind) in pins {
            self.allocate(*pin, *kind, owner)?;
        }
        Ok(())
    }

    /// Release a single pin
    pub fn release(&mut self, pin: PinId) -> Option<PinAllocation> {
        self.allocations.remove(&pin)
    }

    /// Release every pin held by a device, returning the freed pins
    pub fn release_owner(&mut self, owner: &str) -> Vec<PinId> {
        let pins: Vec<PinId> = self
            .allocations
            .values()
            .filter(|a| a.owner == owner)
            .map(|a| a.pin)
            .collect();
        for pin in &pins {
            self.allocations.remove(pin);
        }
        pins
    }

    /// All current allocations, sorted by pin
    pub fn allocations(&self) -> Vec<PinAllocation> {
        let mut all: Vec<PinAllocation> = self.allocations.values().cloned().collect();
        all.sort_by_key(|a| a.pin);
        all
    }
}
