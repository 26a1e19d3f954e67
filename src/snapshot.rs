use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One complete reading of all tracked hardware metrics at a single instant.
/// `timestamp_ms` is the natural key: the store rejects a second snapshot
/// carrying the same value as a duplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp_ms: i64,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub temperatures: Temperatures,
    pub network: NetworkMetrics,
    pub processes: ProcessMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub percent: f64,
    pub frequency_mhz: f64,
    pub core_count: u32,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub percent: f64,
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Disk usage for the primary mount plus cumulative IO counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub percent: f64,
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub read_ops: u64,
    pub write_ops: u64,
    pub read_bytes: u64,
    pub written_bytes: u64,
}

/// Hottest reading per sensor class. A `None` means no sensor of that class
/// was found on this host, not a zero-degree reading. `all` keeps every
/// in-range sensor by name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Temperatures {
    pub cpu: Option<f64>,
    pub gpu: Option<f64>,
    pub ssd: Option<f64>,
    pub hdd: Option<f64>,
    pub all: BTreeMap<String, f64>,
}

/// Cumulative OS counters across all interfaces, not per-tick deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub process_count: u64,
    pub thread_count: u64,
}

/// Best-effort bucket for a raw sensor label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorClass {
    Cpu,
    Gpu,
    Ssd,
    Hdd,
    Other,
}

const GPU_MARKERS: [&str; 4] = ["gpu", "nvidia", "amdgpu", "radeon"];
const CPU_MARKERS: [&str; 6] = ["cpu", "package", "tctl", "tdie", "coretemp", "k10temp"];
const SSD_MARKERS: [&str; 2] = ["nvme", "ssd"];
const HDD_MARKERS: [&str; 3] = ["hdd", "drivetemp", "sata"];

/// Classify a sensor name by keyword. GPU markers are checked first so that
/// labels like "amdgpu" never land in the CPU bucket. Unknown names stay
/// unclassified, which is a valid outcome.
pub fn classify_sensor(name: &str) -> SensorClass {
    let lower = name.to_lowercase();
    if GPU_MARKERS.iter().any(|m| lower.contains(m)) {
        return SensorClass::Gpu;
    }
    if CPU_MARKERS.iter().any(|m| lower.contains(m)) {
        return SensorClass::Cpu;
    }
    if SSD_MARKERS.iter().any(|m| lower.contains(m)) {
        return SensorClass::Ssd;
    }
    if HDD_MARKERS.iter().any(|m| lower.contains(m)) {
        return SensorClass::Hdd;
    }
    SensorClass::Other
}

/// Bucket raw sensor readings. Readings outside 0..=130 degrees are bogus
/// values some controllers report and are dropped entirely. Within a class
/// the hottest sensor wins.
pub fn build_temperatures(readings: &[(String, f64)]) -> Temperatures {
    let mut temps = Temperatures::default();
    for (name, value) in readings {
        if !(0.0..=130.0).contains(value) {
            continue;
        }
        temps.all.insert(name.clone(), *value);
        let slot = match classify_sensor(name) {
            SensorClass::Cpu => &mut temps.cpu,
            SensorClass::Gpu => &mut temps.gpu,
            SensorClass::Ssd => &mut temps.ssd,
            SensorClass::Hdd => &mut temps.hdd,
            SensorClass::Other => continue,
        };
        match slot {
            Some(current) if *current >= *value => {}
            _ => *slot = Some(*value),
        }
    }
    temps
}
