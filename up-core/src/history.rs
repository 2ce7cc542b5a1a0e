//! History and statistics store.
//!
//! Four series per device (rate, charge, time-to-full, time-to-empty),
//! each with a bounded in-memory ring plus a downsampled append-only file.
//! Series files are named by a hash of the device's stable identity so a
//! peripheral that bounces through a remove/re-add cycle keeps its
//! history. Persistence failures are logged and the rings keep working;
//! callers never see them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use up_error::{Result, UpowerError};
use up_protocol::{DeviceKind, DeviceState, HistoryKind, HistoryPoint, StatisticsKind, StatisticsPoint};

use crate::constants::history as limits;
use crate::device::UpDevice;

/// FNV-1a 64-bit; deterministic across runs, which the file naming needs.
pub fn identity_hash(identity: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in identity.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{:016x}", hash)
}

fn kind_index(kind: HistoryKind) -> usize {
    match kind {
        HistoryKind::Rate => 0,
        HistoryKind::Charge => 1,
        HistoryKind::TimeFull => 2,
        HistoryKind::TimeEmpty => 3,
    }
}

#[derive(Debug)]
struct DeviceHistory {
    hash: String,
    rings: [VecDeque<HistoryPoint>; 4],
    last_persist: [u64; 4],
}

impl DeviceHistory {
    fn new(identity: &str) -> Self {
        Self {
            hash: identity_hash(identity),
            rings: Default::default(),
            last_persist: [0; 4],
        }
    }
}

#[derive(Debug)]
pub struct HistoryStore {
    dir: PathBuf,
    file_cap: u64,
    devices: HashMap<String, DeviceHistory>,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>, file_cap: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| UpowerError::FileWrite {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self {
            dir,
            file_cap,
            devices: HashMap::new(),
        })
    }

    fn series_path(&self, hash: &str, kind: HistoryKind) -> PathBuf {
        self.dir
            .join(format!("history-{}-{}.dat", kind.as_str(), hash))
    }

    /// Record one sample per series for this refresh tick.
    pub fn record(&mut self, identity: &str, device: &UpDevice) {
        if device.kind == DeviceKind::LinePower || !device.is_present {
            return;
        }

        let entry = self
            .devices
            .entry(identity.to_string())
            .or_insert_with(|| DeviceHistory::new(identity));

        let now = device.update_time;
        let samples = [
            (HistoryKind::Rate, device.energy_rate),
            (HistoryKind::Charge, device.percentage),
            (HistoryKind::TimeFull, device.time_to_full as f64),
            (HistoryKind::TimeEmpty, device.time_to_empty as f64),
        ];

        let mut to_persist: Vec<(HistoryKind, HistoryPoint)> = Vec::new();
        for (kind, value) in samples {
            let idx = kind_index(kind);
            let point = HistoryPoint {
                time: now,
                value,
                state: device.state,
            };
            let ring = &mut entry.rings[idx];
            ring.push_back(point);
            while ring.len() > limits::RING_CAPACITY {
                ring.pop_front();
            }

            if now.saturating_sub(entry.last_persist[idx]) >= limits::PERSIST_INTERVAL_SECS {
                entry.last_persist[idx] = now;
                to_persist.push((kind, point));
            }
        }

        let hash = entry.hash.clone();
        for (kind, point) in to_persist {
            let path = self.series_path(&hash, kind);
            if let Err(e) = append_record(&path, &point, self.file_cap) {
                warn!("history persist failed for {:?}: {}", path, e);
            }
        }
    }

    pub fn has_device(&self, identity: &str) -> bool {
        self.devices.contains_key(identity)
    }

    /// Read a downsampled window: at most `resolution` bucket-averaged
    /// points covering the last `timespan` seconds, timestamps ascending.
    pub fn read(
        &self,
        identity: &str,
        kind: HistoryKind,
        timespan: u32,
        resolution: u32,
        now: u64,
    ) -> Vec<HistoryPoint> {
        let Some(entry) = self.devices.get(identity) else {
            return Vec::new();
        };

        let window_start = now.saturating_sub(timespan as u64);

        // Merge persisted and ring samples; the ring wins on timestamp
        // collisions since it holds the undownsampled values
        let mut merged: BTreeMap<u64, HistoryPoint> = BTreeMap::new();
        for point in load_series(&self.series_path(&entry.hash, kind)) {
            merged.insert(point.time, point);
        }
        for point in &entry.rings[kind_index(kind)] {
            merged.insert(point.time, *point);
        }

        let resolution = resolution.max(1);
        let width = (timespan as u64 / resolution as u64).max(1);
        struct Bucket {
            sum: f64,
            count: u32,
            state: DeviceState,
        }
        let mut buckets: BTreeMap<u64, Bucket> = BTreeMap::new();
        for (time, point) in merged.range(window_start..=now) {
            // The window end lands exactly on a bucket boundary; fold it
            // into the last bucket instead of minting an extra one
            let slot = ((time - window_start) / width).min(resolution as u64 - 1);
            let bucket = buckets.entry(slot).or_insert(Bucket {
                sum: 0.0,
                count: 0,
                state: point.state,
            });
            bucket.sum += point.value;
            bucket.count += 1;
            bucket.state = point.state;
        }

        buckets
            .into_iter()
            .map(|(slot, bucket)| HistoryPoint {
                time: window_start + slot * width,
                value: bucket.sum / bucket.count as f64,
                state: bucket.state,
            })
            .collect()
    }

    /// Charge-rate profile per percentage point for one charge direction.
    ///
    /// Rate samples are joined with the charge series by timestamp and
    /// bucketed per whole percent; accuracy grows with sample count.
    pub fn statistics(
        &self,
        identity: &str,
        kind: StatisticsKind,
        now: u64,
    ) -> Vec<StatisticsPoint> {
        let wanted_state = match kind {
            StatisticsKind::Charging => DeviceState::Charging,
            StatisticsKind::Discharging => DeviceState::Discharging,
        };

        let mut sums = [0.0f64; 101];
        let mut counts = [0u32; 101];

        if let Some(entry) = self.devices.get(identity) {
            let mut charge_at: BTreeMap<u64, f64> = BTreeMap::new();
            for point in load_series(&self.series_path(&entry.hash, HistoryKind::Charge)) {
                charge_at.insert(point.time, point.value);
            }
            for point in &entry.rings[kind_index(HistoryKind::Charge)] {
                charge_at.insert(point.time, point.value);
            }

            let mut consider = |point: &HistoryPoint| {
                if point.state != wanted_state || point.time > now {
                    return;
                }
                let Some(charge) = charge_at.get(&point.time) else {
                    return;
                };
                let bucket = charge.round().clamp(0.0, 100.0) as usize;
                sums[bucket] += point.value;
                counts[bucket] += 1;
            };

            for point in load_series(&self.series_path(&entry.hash, HistoryKind::Rate)) {
                consider(&point);
            }
            for point in &entry.rings[kind_index(HistoryKind::Rate)] {
                consider(point);
            }
        }

        (0..=100)
            .map(|i| {
                let n = counts[i];
                if n == 0 {
                    StatisticsPoint {
                        value: 0.0,
                        accuracy: 0.0,
                    }
                } else {
                    StatisticsPoint {
                        value: sums[i] / n as f64,
                        accuracy: 100.0 * n as f64 / (n as f64 + 5.0),
                    }
                }
            })
            .collect()
    }

    /// Persist the newest unwritten sample of every series and fsync.
    /// Called on shutdown.
    pub fn flush(&mut self) {
        let dir = self.dir.clone();
        let mut writes: Vec<(PathBuf, HistoryPoint)> = Vec::new();
        for entry in self.devices.values_mut() {
            for kind in HistoryKind::ALL {
                let idx = kind_index(kind);
                if let Some(last) = entry.rings[idx].back() {
                    if last.time > entry.last_persist[idx] {
                        entry.last_persist[idx] = last.time;
                        let path =
                            dir.join(format!("history-{}-{}.dat", kind.as_str(), entry.hash));
                        writes.push((path, *last));
                    }
                }
            }
        }

        for (path, point) in writes {
            if let Err(e) = append_record(&path, &point, self.file_cap) {
                warn!("history flush failed for {:?}: {}", path, e);
                continue;
            }
            if let Ok(file) = OpenOptions::new().append(true).open(&path) {
                let _ = file.sync_all();
            }
        }
        debug!("history store flushed");
    }
}

fn append_record(path: &Path, point: &HistoryPoint, cap: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| UpowerError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })?;
    writeln!(
        file,
        "{}\t{:.3}\t{}",
        point.time,
        point.value,
        point.state.as_str()
    )
    .map_err(|e| UpowerError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    let size = file
        .metadata()
        .map(|m| m.len())
        .unwrap_or(0);
    drop(file);
    if size > cap {
        rotate(path, point.time, cap)?;
    }
    Ok(())
}

/// Truncation rotation: drop records older than the retention window, and
/// if the file is still over the cap keep only the newer half.
fn rotate(path: &Path, now: u64, cap: u64) -> Result<()> {
    let mut points = load_series(path);
    let oldest_allowed = now.saturating_sub(limits::MAX_AGE_SECS);
    points.retain(|p| p.time >= oldest_allowed);

    let mut body = String::new();
    for point in &points {
        body.push_str(&format!(
            "{}\t{:.3}\t{}\n",
            point.time,
            point.value,
            point.state.as_str()
        ));
    }
    if body.len() as u64 > cap {
        let half = points.len() / 2;
        body.clear();
        for point in &points[half..] {
            body.push_str(&format!(
                "{}\t{:.3}\t{}\n",
                point.time,
                point.value,
                point.state.as_str()
            ));
        }
    }

    debug!("rotating history file {:?} ({} records kept)", path, points.len());
    fs::write(path, body).map_err(|e| UpowerError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })
}

fn load_series(path: &Path) -> Vec<HistoryPoint> {
    let Ok(contents) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut points = Vec::new();
    for line in contents.lines() {
        let mut fields = line.split('\t');
        let (Some(time), Some(value), Some(state)) =
            (fields.next(), fields.next(), fields.next())
        else {
            warn!("skipping corrupt history record in {:?}: {:?}", path, line);
            continue;
        };
        let (Ok(time), Ok(value), Some(state)) = (
            time.parse::<u64>(),
            value.parse::<f64>(),
            DeviceState::parse(state),
        ) else {
            warn!("skipping corrupt history record in {:?}: {:?}", path, line);
            continue;
        };
        points.push(HistoryPoint { time, value, state });
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    fn battery_at(time: u64, percentage: f64, rate: f64, state: DeviceState) -> UpDevice {
        let mut dev = UpDevice::new("/b0", "/b0", DeviceKind::Battery);
        dev.power_supply = true;
        dev.is_present = true;
        dev.update_time = time;
        dev.percentage = percentage;
        dev.energy_rate = rate;
        dev.state = state;
        dev
    }

    #[test]
    fn test_identity_hash_is_stable() {
        assert_eq!(identity_hash("BAT0"), identity_hash("BAT0"));
        assert_ne!(identity_hash("BAT0"), identity_hash("BAT1"));
        assert_eq!(identity_hash("BAT0").len(), 16);
    }

    #[test]
    fn test_record_and_read_ordering() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::new(tmp.path(), limits::DEFAULT_FILE_CAP_BYTES).unwrap();

        for i in 0..10u64 {
            let dev = battery_at(1000 + i * 30, 80.0 - i as f64, 12.0, DeviceState::Discharging);
            store.record("BAT0", &dev);
        }

        let points = store.read("BAT0", HistoryKind::Charge, 600, 600, 1000 + 9 * 30);
        assert!(!points.is_empty());
        for pair in points.windows(2) {
            assert!(pair[0].time <= pair[1].time);
        }
    }

    #[test]
    fn test_read_downsamples_to_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::new(tmp.path(), limits::DEFAULT_FILE_CAP_BYTES).unwrap();

        // 300 samples over 300 seconds
        for i in 0..300u64 {
            let dev = battery_at(10_000 + i, 50.0, 10.0, DeviceState::Discharging);
            store.record("BAT0", &dev);
        }

        let now = 10_000 + 299;
        let points = store.read("BAT0", HistoryKind::Charge, 300, 10, now);
        assert!(points.len() <= 10);
        // Spacing at least timespan / resolution
        for pair in points.windows(2) {
            assert!(pair[1].time - pair[0].time >= 30);
        }
    }

    #[test]
    fn test_read_unknown_device_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(tmp.path(), limits::DEFAULT_FILE_CAP_BYTES).unwrap();
        assert!(store.read("nope", HistoryKind::Rate, 600, 10, 1000).is_empty());
    }

    #[test]
    fn test_persistence_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let now_base = 50_000;
        {
            let mut store = HistoryStore::new(tmp.path(), limits::DEFAULT_FILE_CAP_BYTES).unwrap();
            // Samples spaced past the persist interval so each one lands on disk
            for i in 0..5u64 {
                let dev = battery_at(
                    now_base + i * limits::PERSIST_INTERVAL_SECS,
                    80.0,
                    12.0,
                    DeviceState::Discharging,
                );
                store.record("BAT0", &dev);
            }
        }

        let store = HistoryStore::new(tmp.path(), limits::DEFAULT_FILE_CAP_BYTES).unwrap();
        // Fresh store has no ring for BAT0 yet, but the file remains
        let path = store.series_path(&identity_hash("BAT0"), HistoryKind::Charge);
        let points = load_series(&path);
        assert_eq!(points.len(), 5);
        assert!(points.iter().all(|p| (p.value - 80.0).abs() < 1e-9));
        assert!(points.iter().all(|p| p.state == DeviceState::Discharging));
    }

    #[test]
    fn test_file_format() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("history-rate-abc.dat");
        let point = HistoryPoint {
            time: 1234,
            value: 12.5,
            state: DeviceState::Charging,
        };
        append_record(&path, &point, 1024 * 1024).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "1234\t12.500\tcharging\n");
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("history-rate-abc.dat");
        fs::write(
            &path,
            "1234\t12.500\tcharging\nnot a record\n9999\tNaNsense\tcharging\n5678\t11.000\tdischarging\n",
        )
        .unwrap();
        let points = load_series(&path);
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].time, 5678);
    }

    #[test]
    fn test_rotation_caps_file_size() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("history-rate-abc.dat");
        let cap = 512u64;
        for i in 0..200u64 {
            let point = HistoryPoint {
                time: 100_000 + i,
                value: 10.0,
                state: DeviceState::Discharging,
            };
            append_record(&path, &point, cap).unwrap();
        }
        let size = fs::metadata(&path).unwrap().len();
        assert!(size <= cap * 2, "file size {} never shrank", size);
        // Still parseable after rotation
        assert!(!load_series(&path).is_empty());
    }

    #[test]
    fn test_statistics_buckets_by_percentage() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::new(tmp.path(), limits::DEFAULT_FILE_CAP_BYTES).unwrap();

        // Three discharging samples at 80%, one at 50%
        for (i, (pct, rate)) in [(80.0, 10.0), (80.0, 14.0), (80.0, 12.0), (50.0, 6.0)]
            .iter()
            .enumerate()
        {
            let dev = battery_at(1000 + i as u64 * 30, *pct, *rate, DeviceState::Discharging);
            store.record("BAT0", &dev);
        }

        let stats = store.statistics("BAT0", StatisticsKind::Discharging, 2000);
        assert_eq!(stats.len(), 101);
        assert!((stats[80].value - 12.0).abs() < 1e-9);
        assert!(stats[80].accuracy > stats[50].accuracy);
        assert_eq!(stats[10].value, 0.0);
        assert_eq!(stats[10].accuracy, 0.0);

        // Charging direction has no samples
        let charging = store.statistics("BAT0", StatisticsKind::Charging, 2000);
        assert!(charging.iter().all(|p| p.accuracy == 0.0));
    }
}
