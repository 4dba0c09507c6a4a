use std::sync::{Arc, Mutex, RwLock};

use log::info;

use crate::domain::CoS;
use crate::resources::monitor::Measures;
use crate::settings::Settings;

/// Free amounts of the three tracked resources.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Free {
    pub cpu: f64,
    pub ram: f64,
    pub disk: f64,
}

#[derive(Debug, Default)]
struct Reserved {
    cpu: f64,
    ram: f64,
    disk: f64,
}

/// Tracks how much of the node's capacity is promised to reservations.
///
/// All four operations serialize on one mutex; nothing inside the critical
/// section blocks or performs I/O beyond reading the latest monitor sample.
/// In simulation mode free amounts derive from the declared capacities, in
/// live mode from the measured free amounts; reserved quantities are
/// subtracted in both, and results clamp at zero.
pub struct Accountant {
    simulated: bool,
    offers_resources: bool,
    cpu_capacity: f64,
    ram_capacity: f64,
    disk_capacity: f64,
    cpu_threshold: f64,
    ram_threshold: f64,
    disk_threshold: f64,
    measures: Arc<RwLock<Measures>>,
    reserved: Mutex<Reserved>,
}

impl Accountant {
    /// Builds the accountant from settings and the monitor's shared sample.
    /// Live-mode capacities are fixed from the sample present at startup.
    pub fn new(settings: &Settings, measures: Arc<RwLock<Measures>>) -> Accountant {
        let (cpu_capacity, ram_capacity, disk_capacity) = if !settings.is_resource {
            (0.0, 0.0, 0.0)
        } else if settings.simulator_active {
            (settings.host_cpu, settings.host_ram, settings.host_disk)
        } else {
            let sample = *measures.read().unwrap();
            (sample.cpu_count, sample.memory_total, sample.disk_total)
        };

        Accountant {
            simulated: settings.simulator_active,
            offers_resources: settings.is_resource,
            cpu_capacity,
            ram_capacity,
            disk_capacity,
            cpu_threshold: cpu_capacity * settings.threshold,
            ram_threshold: ram_capacity * settings.threshold,
            disk_threshold: disk_capacity * settings.threshold,
            measures,
            reserved: Mutex::new(Reserved::default()),
        }
    }

    /// Free CPU, RAM and disk after subtracting pending reservations.
    pub fn current(&self) -> Free {
        let reserved = self.reserved.lock().unwrap();
        self.free_locked(&reserved)
    }

    fn free_locked(&self, reserved: &Reserved) -> Free {
        if !self.offers_resources {
            return Free::default();
        }
        let (cpu, ram, disk) = if self.simulated {
            (self.cpu_capacity, self.ram_capacity, self.disk_capacity)
        } else {
            let sample = *self.measures.read().unwrap();
            (sample.cpu_free, sample.memory_free, sample.disk_free)
        };
        Free {
            cpu: (cpu - reserved.cpu).max(0.0),
            ram: (ram - reserved.ram).max(0.0),
            disk: (disk - reserved.disk).max(0.0),
        }
    }

    fn satisfiable(&self, free: &Free, cos: &CoS) -> bool {
        free.cpu - cos.min_cpu >= self.cpu_threshold
            && free.ram - cos.min_ram >= self.ram_threshold
            && free.disk - cos.min_disk >= self.disk_threshold
    }

    /// Whether the requirements of `cos` fit without eating into the
    /// reserve thresholds. Does not change any state.
    pub fn check(&self, cos: &CoS, quiet: bool) -> bool {
        let reserved = self.reserved.lock().unwrap();
        let free = self.free_locked(&reserved);
        if !quiet {
            info!(
                "required(cpu={:.0}, ram={:.2}MB, disk={:.2}GB) free(cpu={:.2}, ram={:.2}MB, disk={:.2}GB)",
                cos.min_cpu, cos.min_ram, cos.min_disk, free.cpu, free.ram, free.disk
            );
        }
        self.satisfiable(&free, cos)
    }

    /// Atomic check-and-commit. On success every reserved amount grows by
    /// the requirement of `cos` and true is returned; on failure nothing
    /// changes.
    pub fn reserve(&self, cos: &CoS) -> bool {
        let mut reserved = self.reserved.lock().unwrap();
        let free = self.free_locked(&reserved);
        if !self.satisfiable(&free, cos) {
            return false;
        }
        reserved.cpu += cos.min_cpu;
        reserved.ram += cos.min_ram;
        reserved.disk += cos.min_disk;
        let now_free = self.free_locked(&reserved);
        info!(
            "reserved(cpu={:.0}, ram={:.2}MB, disk={:.2}GB), current(cpu={:.2}, ram={:.2}MB, disk={:.2}GB)",
            cos.min_cpu, cos.min_ram, cos.min_disk, now_free.cpu, now_free.ram, now_free.disk
        );
        true
    }

    /// Returns the requirement of `cos` to the pool, clamping each counter
    /// at zero.
    pub fn free(&self, cos: &CoS) {
        let mut reserved = self.reserved.lock().unwrap();
        reserved.cpu = (reserved.cpu - cos.min_cpu).max(0.0);
        reserved.ram = (reserved.ram - cos.min_ram).max(0.0);
        reserved.disk = (reserved.disk - cos.min_disk).max(0.0);
        let now_free = self.free_locked(&reserved);
        info!(
            "freed(cpu={:.0}, ram={:.2}MB, disk={:.2}GB), current(cpu={:.2}, ram={:.2}MB, disk={:.2}GB)",
            cos.min_cpu, cos.min_ram, cos.min_disk, now_free.cpu, now_free.ram, now_free.disk
        );
    }
}
