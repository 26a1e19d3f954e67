use crate::snapshot::{
    build_temperatures, CpuMetrics, DiskMetrics, MemoryMetrics, MetricsSnapshot, NetworkMetrics,
    ProcessMetrics,
};
#[cfg(target_os = "linux")]
use std::fs;
use sysinfo::{
    ComponentExt, CpuExt, DiskExt, NetworkExt, NetworksExt, ProcessExt, System, SystemExt,
};

/// Read every tracked hardware metric into one snapshot. Best-effort by
/// design: a source that is missing on this host yields zero or `None`,
/// never an error.
pub fn collect_system(system: &mut System, timestamp_ms: i64) -> MetricsSnapshot {
    system.refresh_cpu();
    system.refresh_memory();
    system.refresh_processes();
    system.refresh_disks_list();
    system.refresh_disks();
    system.refresh_networks_list();
    system.refresh_networks();
    system.refresh_components_list();
    system.refresh_components();

    let core_count = system.cpus().len() as u32;
    let cpu_percent = if system.cpus().is_empty() {
        0.0
    } else {
        let sum: f32 = system.cpus().iter().map(|c| c.cpu_usage()).sum();
        (sum / system.cpus().len() as f32) as f64
    };
    let frequency_mhz = system
        .cpus()
        .first()
        .map(|c| c.frequency() as f64)
        .unwrap_or(0.0);

    let memory_total = system.total_memory() * 1024;
    let memory_used = system.used_memory() * 1024;
    let memory_available = system.available_memory() * 1024;
    let memory_percent = percent_of(memory_used, memory_total);

    // Root-most mount stands in for "the disk"; a per-mount breakdown is a
    // presentation concern, not a storage one.
    let (disk_used, disk_total, disk_free) = system
        .disks()
        .iter()
        .min_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| {
            let total = d.total_space();
            let free = d.available_space();
            (total.saturating_sub(free), total, free)
        })
        .unwrap_or((0, 0, 0));

    let (read_bytes, written_bytes) = system
        .processes()
        .values()
        .map(|p| {
            let usage = p.disk_usage();
            (usage.total_read_bytes, usage.total_written_bytes)
        })
        .fold((0_u64, 0_u64), |(r, w), (pr, pw)| {
            (r.saturating_add(pr), w.saturating_add(pw))
        });
    let (read_ops, write_ops) = disk_op_counters();

    let (bytes_sent, bytes_recv, packets_sent, packets_recv) = system.networks().iter().fold(
        (0_u64, 0_u64, 0_u64, 0_u64),
        |(bs, br, ps, pr), (_iface, data)| {
            (
                bs.saturating_add(data.total_transmitted()),
                br.saturating_add(data.total_received()),
                ps.saturating_add(data.total_packets_transmitted()),
                pr.saturating_add(data.total_packets_received()),
            )
        },
    );

    let readings: Vec<(String, f64)> = system
        .components()
        .iter()
        .map(|c| (c.label().to_string(), c.temperature() as f64))
        .collect();
    let temperatures = build_temperatures(&readings);

    let process_count = system.processes().len() as u64;
    let thread_count = thread_count();

    MetricsSnapshot {
        timestamp_ms,
        cpu: CpuMetrics {
            percent: cpu_percent,
            frequency_mhz,
            core_count,
            temperature: temperatures.cpu,
        },
        memory: MemoryMetrics {
            percent: memory_percent,
            used_bytes: memory_used,
            total_bytes: memory_total,
            available_bytes: memory_available,
        },
        disk: DiskMetrics {
            percent: percent_of(disk_used, disk_total),
            used_bytes: disk_used,
            total_bytes: disk_total,
            free_bytes: disk_free,
            read_ops,
            write_ops,
            read_bytes,
            written_bytes,
        },
        temperatures,
        network: NetworkMetrics {
            bytes_sent,
            bytes_recv,
            packets_sent,
            packets_recv,
        },
        processes: ProcessMetrics {
            process_count,
            thread_count,
        },
    }
}

fn percent_of(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64) * 100.0
    }
}

/// Cumulative completed read/write operations across physical block devices.
/// Only linux exposes these cheaply; other platforms report zero.
#[cfg(target_os = "linux")]
fn disk_op_counters() -> (u64, u64) {
    fs::read_to_string("/proc/diskstats")
        .map(|text| parse_diskstats(&text))
        .unwrap_or((0, 0))
}

#[cfg(not(target_os = "linux"))]
fn disk_op_counters() -> (u64, u64) {
    (0, 0)
}

#[cfg(target_os = "linux")]
fn thread_count() -> u64 {
    fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|text| parse_loadavg_threads(&text))
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn thread_count() -> u64 {
    0
}

/// Sum the reads-completed (field 4) and writes-completed (field 8) columns,
/// skipping loop and ram pseudo-devices.
#[allow(dead_code)]
fn parse_diskstats(text: &str) -> (u64, u64) {
    let mut reads = 0_u64;
    let mut writes = 0_u64;
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let name = fields[2];
        if name.starts_with("loop") || name.starts_with("ram") {
            continue;
        }
        reads = reads.saturating_add(fields[3].parse().unwrap_or(0));
        writes = writes.saturating_add(fields[7].parse().unwrap_or(0));
    }
    (reads, writes)
}

/// The fourth /proc/loadavg field reads "runnable/total"; the denominator is
/// the total number of scheduling entities, i.e. threads.
#[allow(dead_code)]
fn parse_loadavg_threads(text: &str) -> Option<u64> {
    let field = text.split_whitespace().nth(3)?;
    let (_, total) = field.split_once('/')?;
    total.parse().ok()
}
