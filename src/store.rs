use crate::snapshot::{MetricsSnapshot, Temperatures};
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SECONDS_PER_MONTH: f64 = 30.0 * 24.0 * 3600.0;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("archive write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable, deduplicated snapshot store keyed by timestamp.
///
/// A single writer (the sampling loop) holds a read-write handle; the query
/// service opens short-lived read-only handles against the same file. WAL
/// journaling keeps readers from ever observing a half-written row.
pub struct MetricsStore {
    conn: Connection,
    path: PathBuf,
    interval_secs: u64,
}

impl MetricsStore {
    /// Open or create the store. The only fatal failure mode of the daemon:
    /// if the path is unwritable there is nothing useful left to do.
    pub fn open(path: impl AsRef<Path>, interval_secs: u64) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                timestamp_ms        INTEGER PRIMARY KEY,
                cpu_percent         REAL NOT NULL,
                cpu_frequency_mhz   REAL NOT NULL,
                cpu_core_count      INTEGER NOT NULL,
                memory_percent      REAL NOT NULL,
                memory_used         INTEGER NOT NULL,
                memory_total        INTEGER NOT NULL,
                memory_available    INTEGER NOT NULL,
                disk_percent        REAL NOT NULL,
                disk_used           INTEGER NOT NULL,
                disk_total          INTEGER NOT NULL,
                disk_free           INTEGER NOT NULL,
                disk_read_ops       INTEGER NOT NULL,
                disk_write_ops      INTEGER NOT NULL,
                disk_read_bytes     INTEGER NOT NULL,
                disk_written_bytes  INTEGER NOT NULL,
                temp_cpu            REAL,
                temp_gpu            REAL,
                temp_ssd            REAL,
                temp_hdd            REAL,
                temperatures_json   TEXT NOT NULL,
                net_bytes_sent      INTEGER NOT NULL,
                net_bytes_recv      INTEGER NOT NULL,
                net_packets_sent    INTEGER NOT NULL,
                net_packets_recv    INTEGER NOT NULL,
                process_count       INTEGER NOT NULL,
                thread_count        INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn,
            path,
            interval_secs,
        })
    }

    /// Open an existing store for querying only. Used by the HTTP handlers so
    /// the sampling loop and the query service share nothing but the file.
    pub fn open_read_only(
        path: impl AsRef<Path>,
        interval_secs: u64,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self {
            conn,
            path,
            interval_secs,
        })
    }

    /// Insert a snapshot keyed by its timestamp. A duplicate timestamp is
    /// suppressed silently and reported as `Ok(false)`: a retried or
    /// re-ordered tick must never corrupt history or surface an error.
    pub fn append(&self, snapshot: &MetricsSnapshot) -> Result<bool, StoreError> {
        let temperatures_json = serde_json::to_string(&snapshot.temperatures.all)?;
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO metrics (
                timestamp_ms,
                cpu_percent, cpu_frequency_mhz, cpu_core_count,
                memory_percent, memory_used, memory_total, memory_available,
                disk_percent, disk_used, disk_total, disk_free,
                disk_read_ops, disk_write_ops, disk_read_bytes, disk_written_bytes,
                temp_cpu, temp_gpu, temp_ssd, temp_hdd, temperatures_json,
                net_bytes_sent, net_bytes_recv, net_packets_sent, net_packets_recv,
                process_count, thread_count
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27
            )
            "#,
            params![
                snapshot.timestamp_ms,
                snapshot.cpu.percent,
                snapshot.cpu.frequency_mhz,
                snapshot.cpu.core_count,
                snapshot.memory.percent,
                snapshot.memory.used_bytes,
                snapshot.memory.total_bytes,
                snapshot.memory.available_bytes,
                snapshot.disk.percent,
                snapshot.disk.used_bytes,
                snapshot.disk.total_bytes,
                snapshot.disk.free_bytes,
                snapshot.disk.read_ops,
                snapshot.disk.write_ops,
                snapshot.disk.read_bytes,
                snapshot.disk.written_bytes,
                snapshot.temperatures.cpu,
                snapshot.temperatures.gpu,
                snapshot.temperatures.ssd,
                snapshot.temperatures.hdd,
                temperatures_json,
                snapshot.network.bytes_sent,
                snapshot.network.bytes_recv,
                snapshot.network.packets_sent,
                snapshot.network.packets_recv,
                snapshot.processes.process_count,
                snapshot.processes.thread_count,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// The most recent `n` snapshots in ascending timestamp order, oldest of
    /// the window first. The primary key index keeps this bounded.
    pub fn recent(&self, n: u32) -> Result<Vec<MetricsSnapshot>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp_ms,
                   cpu_percent, cpu_frequency_mhz, cpu_core_count,
                   memory_percent, memory_used, memory_total, memory_available,
                   disk_percent, disk_used, disk_total, disk_free,
                   disk_read_ops, disk_write_ops, disk_read_bytes, disk_written_bytes,
                   temp_cpu, temp_gpu, temp_ssd, temp_hdd, temperatures_json,
                   net_bytes_sent, net_bytes_recv, net_packets_sent, net_packets_recv,
                   process_count, thread_count
            FROM metrics
            ORDER BY timestamp_ms DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![n], row_to_snapshot)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out.reverse();
        Ok(out)
    }

    /// Whole-history aggregate. SQL `AVG`/`MAX` skip NULLs, so a temperature
    /// class with no sensor on this host is excluded from its aggregate
    /// rather than dragged to zero.
    pub fn aggregate(&self) -> Result<AggregateStats, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT COUNT(*),
                   MIN(timestamp_ms),
                   AVG(cpu_percent), MAX(cpu_percent),
                   AVG(memory_percent), MAX(memory_percent),
                   AVG(disk_percent), MAX(disk_percent),
                   AVG(temp_cpu), MAX(temp_cpu),
                   AVG(temp_gpu), MAX(temp_gpu),
                   AVG(temp_ssd), MAX(temp_ssd),
                   AVG(temp_hdd), MAX(temp_hdd)
            FROM metrics
            "#,
        )?;

        let stats = stmt.query_row([], |row| {
            Ok(AggregateStats {
                count: row.get::<_, i64>(0)? as u64,
                since_timestamp_ms: row.get(1)?,
                cpu_avg: row.get(2)?,
                cpu_max: row.get(3)?,
                memory_avg: row.get(4)?,
                memory_max: row.get(5)?,
                disk_avg: row.get(6)?,
                disk_max: row.get(7)?,
                temp_cpu_avg: row.get(8)?,
                temp_cpu_max: row.get(9)?,
                temp_gpu_avg: row.get(10)?,
                temp_gpu_max: row.get(11)?,
                temp_ssd_avg: row.get(12)?,
                temp_ssd_max: row.get(13)?,
                temp_hdd_avg: row.get(14)?,
                temp_hdd_max: row.get(15)?,
            })
        })?;
        Ok(stats)
    }

    /// On-disk footprint and a naive linear growth projection assuming the
    /// daemon keeps sampling at its configured interval.
    pub fn size_stats(&self) -> Result<SizeStats, StoreError> {
        let rows: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM metrics", [], |row| row.get(0))?;

        // WAL mode spreads the footprint over three files.
        let mut size_bytes = 0_u64;
        for suffix in ["", "-wal", "-shm"] {
            let mut candidate = self.path.clone().into_os_string();
            candidate.push(suffix);
            if let Ok(meta) = std::fs::metadata(&candidate) {
                size_bytes += meta.len();
            }
        }

        Ok(derive_size_stats(size_bytes, rows as u64, self.interval_secs))
    }

    /// Temperature breakdown of the most recent record, `None` on an empty
    /// store.
    pub fn latest_temperatures(&self) -> Result<Option<TemperatureReport>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp_ms, temp_cpu, temp_gpu, temp_ssd, temp_hdd, temperatures_json
            FROM metrics
            ORDER BY timestamp_ms DESC
            LIMIT 1
            "#,
        )?;

        let row = stmt
            .query_row([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some((timestamp_ms, cpu, gpu, ssd, hdd, all_json)) = row else {
            return Ok(None);
        };
        let all: BTreeMap<String, f64> = serde_json::from_str(&all_json)?;
        Ok(Some(TemperatureReport {
            timestamp_ms,
            cpu,
            gpu,
            ssd,
            hdd,
            all,
        }))
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricsSnapshot> {
    let all_json: String = row.get(20)?;
    let all: BTreeMap<String, f64> = serde_json::from_str(&all_json).unwrap_or_default();
    Ok(MetricsSnapshot {
        timestamp_ms: row.get(0)?,
        cpu: crate::snapshot::CpuMetrics {
            percent: row.get(1)?,
            frequency_mhz: row.get(2)?,
            core_count: row.get(3)?,
            temperature: row.get(16)?,
        },
        memory: crate::snapshot::MemoryMetrics {
            percent: row.get(4)?,
            used_bytes: row.get(5)?,
            total_bytes: row.get(6)?,
            available_bytes: row.get(7)?,
        },
        disk: crate::snapshot::DiskMetrics {
            percent: row.get(8)?,
            used_bytes: row.get(9)?,
            total_bytes: row.get(10)?,
            free_bytes: row.get(11)?,
            read_ops: row.get(12)?,
            write_ops: row.get(13)?,
            read_bytes: row.get(14)?,
            written_bytes: row.get(15)?,
        },
        temperatures: Temperatures {
            cpu: row.get(16)?,
            gpu: row.get(17)?,
            ssd: row.get(18)?,
            hdd: row.get(19)?,
            all,
        },
        network: crate::snapshot::NetworkMetrics {
            bytes_sent: row.get(21)?,
            bytes_recv: row.get(22)?,
            packets_sent: row.get(23)?,
            packets_recv: row.get(24)?,
        },
        processes: crate::snapshot::ProcessMetrics {
            process_count: row.get(25)?,
            thread_count: row.get(26)?,
        },
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateStats {
    pub count: u64,
    pub since_timestamp_ms: Option<i64>,
    pub cpu_avg: Option<f64>,
    pub cpu_max: Option<f64>,
    pub memory_avg: Option<f64>,
    pub memory_max: Option<f64>,
    pub disk_avg: Option<f64>,
    pub disk_max: Option<f64>,
    pub temp_cpu_avg: Option<f64>,
    pub temp_cpu_max: Option<f64>,
    pub temp_gpu_avg: Option<f64>,
    pub temp_gpu_max: Option<f64>,
    pub temp_ssd_avg: Option<f64>,
    pub temp_ssd_max: Option<f64>,
    pub temp_hdd_avg: Option<f64>,
    pub temp_hdd_max: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SizeStats {
    pub size_bytes: u64,
    pub rows: u64,
    pub bytes_per_row: f64,
    pub projected_monthly_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemperatureReport {
    pub timestamp_ms: i64,
    pub cpu: Option<f64>,
    pub gpu: Option<f64>,
    pub ssd: Option<f64>,
    pub hdd: Option<f64>,
    pub all: BTreeMap<String, f64>,
}

/// Pure projection arithmetic, split out so it is testable without a
/// filesystem.
pub fn derive_size_stats(size_bytes: u64, rows: u64, interval_secs: u64) -> SizeStats {
    let bytes_per_row = if rows > 0 {
        size_bytes as f64 / rows as f64
    } else {
        0.0
    };
    let rows_per_month = if interval_secs > 0 {
        SECONDS_PER_MONTH / interval_secs as f64
    } else {
        0.0
    };
    SizeStats {
        size_bytes,
        rows,
        bytes_per_row,
        projected_monthly_bytes: (bytes_per_row * rows_per_month) as u64,
    }
}

/// Compressed append-only mirror of every snapshot, one gzip member per
/// JSON-encoded record. Exists purely for offline inspection (`zcat` handles
/// concatenated members); failures here are the caller's to log and must
/// never reach the primary path.
pub struct ArchiveMirror {
    path: PathBuf,
}

impl ArchiveMirror {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn append(&self, snapshot: &MetricsSnapshot) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(snapshot)?;
        line.push(b'\n');

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(&line)?;
        encoder.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{
        CpuMetrics, DiskMetrics, MemoryMetrics, NetworkMetrics, ProcessMetrics,
    };
    use flate2::read::MultiGzDecoder;
    use std::io::Read;

    fn sample(timestamp_ms: i64, cpu_percent: f64) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp_ms,
            cpu: CpuMetrics {
                percent: cpu_percent,
                frequency_mhz: 3200.0,
                core_count: 8,
                temperature: Some(55.0),
            },
            memory: MemoryMetrics {
                percent: 40.0,
                used_bytes: 4 << 30,
                total_bytes: 16 << 30,
                available_bytes: 12 << 30,
            },
            disk: DiskMetrics {
                percent: 61.5,
                used_bytes: 200 << 30,
                total_bytes: 500 << 30,
                free_bytes: 300 << 30,
                read_ops: 1000,
                write_ops: 500,
                read_bytes: 1 << 30,
                written_bytes: 1 << 29,
            },
            temperatures: crate::snapshot::build_temperatures(&[(
                "coretemp Package".to_string(),
                55.0,
            )]),
            network: NetworkMetrics {
                bytes_sent: 1_000_000,
                bytes_recv: 9_000_000,
                packets_sent: 4_000,
                packets_recv: 12_000,
            },
            processes: ProcessMetrics {
                process_count: 240,
                thread_count: 1100,
            },
        }
    }

    fn open_temp_store() -> (tempfile::TempDir, MetricsStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MetricsStore::open(dir.path().join("metrics.db"), 5).expect("open store");
        (dir, store)
    }

    #[test]
    fn duplicate_timestamp_is_suppressed_silently() {
        let (_dir, store) = open_temp_store();
        let snap = sample(1_700_000_000_000, 50.0);

        assert!(store.append(&snap).unwrap());
        // Second append with the same key: no error, no second row.
        assert!(!store.append(&snap).unwrap());

        let stats = store.aggregate().unwrap();
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn recent_returns_ascending_window() {
        let (_dir, store) = open_temp_store();
        for i in 0..5 {
            store
                .append(&sample(1_700_000_000_000 + i * 5_000, 10.0))
                .unwrap();
        }

        let window = store.recent(3).unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].timestamp_ms, 1_700_000_010_000);
        assert_eq!(window[1].timestamp_ms, 1_700_000_015_000);
        assert_eq!(window[2].timestamp_ms, 1_700_000_020_000);
    }

    #[test]
    fn aggregate_averages_and_maxima() {
        let (_dir, store) = open_temp_store();
        for (i, cpu) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            store
                .append(&sample(1_700_000_000_000 + i as i64 * 5_000, cpu))
                .unwrap();
        }

        let stats = store.aggregate().unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.cpu_avg, Some(20.0));
        assert_eq!(stats.cpu_max, Some(30.0));
        assert_eq!(stats.since_timestamp_ms, Some(1_700_000_000_000));
        // No GPU sensor in the fixtures: excluded from the aggregate, not zero.
        assert_eq!(stats.temp_gpu_avg, None);
        assert_eq!(stats.temp_cpu_max, Some(55.0));
    }

    #[test]
    fn aggregate_on_empty_store_is_well_defined() {
        let (_dir, store) = open_temp_store();
        let stats = store.aggregate().unwrap();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.since_timestamp_ms, None);
        assert_eq!(stats.cpu_avg, None);
    }

    #[test]
    fn size_projection_arithmetic() {
        let stats = derive_size_stats(24_000, 240, 5);
        assert_eq!(stats.bytes_per_row, 100.0);
        // 5s interval -> 518400 rows per 30 days.
        assert_eq!(stats.projected_monthly_bytes, 51_840_000);

        let empty = derive_size_stats(4096, 0, 5);
        assert_eq!(empty.bytes_per_row, 0.0);
        assert_eq!(empty.projected_monthly_bytes, 0);
    }

    #[test]
    fn archive_failure_does_not_affect_primary() {
        let (_dir, store) = open_temp_store();
        let mirror = ArchiveMirror::new("/nonexistent-hwmond-dir/archive.jsonl.gz");
        let snap = sample(1_700_000_000_000, 12.0);

        assert!(mirror.append(&snap).is_err());
        assert!(store.append(&snap).unwrap());
        assert_eq!(store.aggregate().unwrap().count, 1);
    }

    #[test]
    fn primary_failure_does_not_affect_archive() {
        let dir = tempfile::tempdir().unwrap();
        let snap = sample(1_700_000_000_000, 12.0);

        // Seed a database, then reopen it read-only to force the write fault.
        MetricsStore::open(dir.path().join("metrics.db"), 5).unwrap();
        let readonly = MetricsStore::open_read_only(dir.path().join("metrics.db"), 5).unwrap();
        assert!(readonly.append(&snap).is_err());

        let mirror = ArchiveMirror::new(dir.path().join("archive.jsonl.gz"));
        mirror.append(&snap).unwrap();
    }

    #[test]
    fn archive_members_decode_back_to_records() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = ArchiveMirror::new(dir.path().join("archive.jsonl.gz"));
        mirror.append(&sample(1_700_000_000_000, 10.0)).unwrap();
        mirror.append(&sample(1_700_000_005_000, 20.0)).unwrap();

        let file = std::fs::File::open(dir.path().join("archive.jsonl.gz")).unwrap();
        let mut text = String::new();
        MultiGzDecoder::new(file).read_to_string(&mut text).unwrap();

        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: MetricsSnapshot = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn snapshots_round_trip_through_rows() {
        let (_dir, store) = open_temp_store();
        let snap = sample(1_700_000_000_000, 33.0);
        store.append(&snap).unwrap();

        let back = store.recent(1).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0], snap);
    }

    #[test]
    fn latest_temperatures_requires_a_record() {
        let (_dir, store) = open_temp_store();
        assert!(store.latest_temperatures().unwrap().is_none());

        store.append(&sample(1_700_000_000_000, 10.0)).unwrap();
        let report = store.latest_temperatures().unwrap().expect("one record");
        assert_eq!(report.timestamp_ms, 1_700_000_000_000);
        assert_eq!(report.cpu, Some(55.0));
        assert_eq!(report.gpu, None);
        assert_eq!(report.all.len(), 1);
    }
}
