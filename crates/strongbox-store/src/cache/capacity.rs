//! Device-derived cache capacity
//!
//! capacity = tier base (physical memory)
//!          x pressure scale (available / total)
//!          x thermal scale
//! floored at MIN_CAPACITY.

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// Lower bound on any computed capacity
pub const MIN_CAPACITY: usize = 8;

/// Base capacity per physical memory tier, highest tier first
const MEMORY_TIERS: [(u64, usize); 3] = [(8 * GIB, 200), (4 * GIB, 100), (2 * GIB, 50)];
const LOWEST_TIER_CAPACITY: usize = 25;

/// Device thermal state as reported by the platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    #[default]
    Nominal,
    Fair,
    Serious,
    Critical,
}

impl ThermalState {
    pub fn scale(self) -> f64 {
        match self {
            Self::Nominal => 1.0,
            Self::Fair => 0.75,
            Self::Serious => 0.5,
            Self::Critical => 0.25,
        }
    }
}

/// Snapshot of the signals that drive capacity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub thermal: ThermalState,
}

impl DeviceProfile {
    pub fn new(total_memory_bytes: u64, available_memory_bytes: u64, thermal: ThermalState) -> Self {
        Self {
            total_memory_bytes,
            available_memory_bytes: available_memory_bytes.min(total_memory_bytes),
            thermal,
        }
    }

    /// Read physical and available memory from the OS. Falls back to the
    /// lowest tier when the platform does not report memory.
    pub fn probe() -> Self {
        match sys_info::mem_info() {
            Ok(info) => Self::new(info.total * 1024, info.avail * 1024, ThermalState::Nominal),
            Err(e) => {
                warn!("Memory probe failed, assuming lowest tier: {}", e);
                Self::new(GIB, GIB, ThermalState::Nominal)
            }
        }
    }

    pub fn with_thermal(mut self, thermal: ThermalState) -> Self {
        self.thermal = thermal;
        self
    }

    fn tier_base(&self) -> usize {
        MEMORY_TIERS
            .iter()
            .find(|(threshold, _)| self.total_memory_bytes >= *threshold)
            .map(|(_, base)| *base)
            .unwrap_or(LOWEST_TIER_CAPACITY)
    }

    fn pressure_scale(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 1.0;
        }
        let free_ratio = self.available_memory_bytes as f64 / self.total_memory_bytes as f64;
        if free_ratio < 0.10 {
            0.5
        } else if free_ratio < 0.25 {
            0.75
        } else {
            1.0
        }
    }

    /// Max cache entries for this profile
    pub fn cache_capacity(&self) -> usize {
        let scaled = self.tier_base() as f64 * self.pressure_scale() * self.thermal.scale();
        (scaled.floor() as usize).max(MIN_CAPACITY)
    }
}
