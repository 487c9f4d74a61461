//! Host load probe used by the admission tick

use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::System;

/// Instantaneous host-wide load
pub trait LoadProbe: Send {
    fn host_cpu_percent(&mut self) -> f32;
    fn host_ram_percent(&mut self) -> f32;
}

/// Load read from the host through sysinfo
pub struct SystemLoad {
    system: System,
}

impl SystemLoad {
    pub fn new() -> Self {
        let mut system = System::new();
        // First CPU reading needs a baseline
        system.refresh_cpu();
        Self { system }
    }
}

impl Default for SystemLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadProbe for SystemLoad {
    fn host_cpu_percent(&mut self) -> f32 {
        self.system.refresh_cpu();
        let usage = self.system.global_cpu_info().cpu_usage();
        if usage.is_finite() {
            usage
        } else {
            0.0
        }
    }

    fn host_ram_percent(&mut self) -> f32 {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return 0.0;
        }
        (self.system.used_memory() as f64 / total as f64 * 100.0) as f32
    }
}

/// Load pinned to fixed values; clones share the same values
#[derive(Debug, Clone, Default)]
pub struct FixedLoad {
    values: Arc<Mutex<(f32, f32)>>,
}

impl FixedLoad {
    pub fn new(cpu_percent: f32, ram_percent: f32) -> Self {
        Self {
            values: Arc::new(Mutex::new((cpu_percent, ram_percent))),
        }
    }

    pub fn set(&self, cpu_percent: f32, ram_percent: f32) {
        *self.values.lock().unwrap_or_else(PoisonError::into_inner) = (cpu_percent, ram_percent);
    }
}

impl LoadProbe for FixedLoad {
    fn host_cpu_percent(&mut self) -> f32 {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).0
    }

    fn host_ram_percent(&mut self) -> f32 {
        self.values.lock().unwrap_or_else(PoisonError::into_inner).1
    }
}
