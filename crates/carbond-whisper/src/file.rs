use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::retention::validate_retentions;
use crate::{AggregationMethod, Result, Retention, TimeSeriesPoint, WhisperError};

const METADATA_SIZE: u64 = 16;
const ARCHIVE_INFO_SIZE: u64 = 12;
const POINT_SIZE: u64 = 12;

#[derive(Debug, Clone, Copy)]
struct ArchiveInfo {
    offset: u32,
    retention: Retention,
}

impl ArchiveInfo {
    fn seconds_per_point(&self) -> u32 {
        self.retention.seconds_per_point
    }

    fn points(&self) -> u32 {
        self.retention.points
    }

    fn interval(&self, time: i64) -> i64 {
        time - time.rem_euclid(self.seconds_per_point() as i64)
    }
}

/// An open whisper archive file.
///
/// The handle owns the underlying file and is expected to live for a single
/// store operation; it is closed on drop.
#[derive(Debug)]
pub struct Whisper {
    file: File,
    path: PathBuf,
    aggregation: AggregationMethod,
    max_retention: u32,
    x_files_factor: f32,
    archives: Vec<ArchiveInfo>,
}

/// Result of a [`Whisper::fetch`]: one slot per `step` across the range,
/// `None` where the archive holds no value.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub from: i64,
    pub until: i64,
    pub step: u32,
    pub values: Vec<Option<f64>>,
}

impl Whisper {
    /// Create a new archive file. Fails if the path already exists or the
    /// retention chain is invalid.
    pub fn create(
        path: impl AsRef<Path>,
        retentions: &[Retention],
        aggregation: AggregationMethod,
        x_files_factor: f32,
    ) -> Result<Self> {
        validate_retentions(retentions)?;
        if !(0.0..=1.0).contains(&x_files_factor) || x_files_factor.is_nan() {
            return Err(WhisperError::InvalidXFilesFactor(x_files_factor));
        }

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let max_retention = retentions.iter().map(Retention::retention).max().unwrap_or(0);

        let mut header = Vec::with_capacity(
            (METADATA_SIZE + ARCHIVE_INFO_SIZE * retentions.len() as u64) as usize,
        );
        header.extend_from_slice(&aggregation.code().to_be_bytes());
        header.extend_from_slice(&max_retention.to_be_bytes());
        header.extend_from_slice(&x_files_factor.to_be_bytes());
        header.extend_from_slice(&(retentions.len() as u32).to_be_bytes());

        let mut archives = Vec::with_capacity(retentions.len());
        let mut offset = METADATA_SIZE + ARCHIVE_INFO_SIZE * retentions.len() as u64;
        for retention in retentions {
            header.extend_from_slice(&(offset as u32).to_be_bytes());
            header.extend_from_slice(&retention.seconds_per_point.to_be_bytes());
            header.extend_from_slice(&retention.points.to_be_bytes());
            archives.push(ArchiveInfo {
                offset: offset as u32,
                retention: *retention,
            });
            offset += retention.points as u64 * POINT_SIZE;
        }

        file.write_all_at(&header, 0)?;
        // Archive slots start zeroed; a hole is as good as written zeros.
        file.set_len(offset)?;

        Ok(Self {
            file,
            path,
            aggregation,
            max_retention,
            x_files_factor,
            archives,
        })
    }

    /// Open an existing archive file and parse its header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let corrupt = |path: &PathBuf, reason: &str| WhisperError::Corrupt {
            path: path.clone(),
            reason: reason.to_string(),
        };

        let mut meta = [0u8; METADATA_SIZE as usize];
        file.read_exact_at(&mut meta, 0)
            .map_err(|_| corrupt(&path, "short metadata"))?;

        let aggregation = AggregationMethod::from_code(u32::from_be_bytes(
            meta[0..4].try_into().unwrap_or_default(),
        ))
        .ok_or_else(|| corrupt(&path, "unknown aggregation code"))?;
        let max_retention = u32::from_be_bytes(meta[4..8].try_into().unwrap_or_default());
        let x_files_factor = f32::from_be_bytes(meta[8..12].try_into().unwrap_or_default());
        let archive_count = u32::from_be_bytes(meta[12..16].try_into().unwrap_or_default());

        if archive_count == 0 || archive_count > 32 {
            return Err(corrupt(&path, "implausible archive count"));
        }

        let mut infos = vec![0u8; (ARCHIVE_INFO_SIZE * archive_count as u64) as usize];
        file.read_exact_at(&mut infos, METADATA_SIZE)
            .map_err(|_| corrupt(&path, "short archive table"))?;

        let mut archives = Vec::with_capacity(archive_count as usize);
        for chunk in infos.chunks_exact(ARCHIVE_INFO_SIZE as usize) {
            let offset = u32::from_be_bytes(chunk[0..4].try_into().unwrap_or_default());
            let seconds_per_point = u32::from_be_bytes(chunk[4..8].try_into().unwrap_or_default());
            let points = u32::from_be_bytes(chunk[8..12].try_into().unwrap_or_default());
            if seconds_per_point == 0 || points == 0 {
                return Err(corrupt(&path, "zeroed archive info"));
            }
            archives.push(ArchiveInfo {
                offset,
                retention: Retention::new(seconds_per_point, points),
            });
        }

        Ok(Self {
            file,
            path,
            aggregation,
            max_retention,
            x_files_factor,
            archives,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn aggregation_method(&self) -> AggregationMethod {
        self.aggregation
    }

    pub fn x_files_factor(&self) -> f32 {
        self.x_files_factor
    }

    pub fn max_retention(&self) -> u32 {
        self.max_retention
    }

    pub fn retentions(&self) -> Vec<Retention> {
        self.archives.iter().map(|a| a.retention).collect()
    }

    /// Write a batch of samples in one pass.
    ///
    /// Each sample lands in the highest-precision archive whose history
    /// still covers it; samples older than the maximum retention are
    /// silently dropped. Within one call the last value written to an
    /// interval wins. Touched intervals are propagated down the archive
    /// chain, aggregating when at least `x_files_factor` of the expected
    /// higher-precision slots hold values.
    pub fn update_many(&mut self, points: &[TimeSeriesPoint]) -> Result<()> {
        let now = unix_now();

        let mut remaining: Vec<TimeSeriesPoint> = points.to_vec();
        for idx in 0..self.archives.len() {
            if remaining.is_empty() {
                break;
            }
            let retention = self.archives[idx].retention.retention() as i64;
            let (current, older): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|p| now - p.time < retention);
            if !current.is_empty() {
                self.archive_update_many(idx, &current)?;
            }
            remaining = older;
        }

        Ok(())
    }

    fn archive_update_many(&mut self, idx: usize, points: &[TimeSeriesPoint]) -> Result<()> {
        let archive = self.archives[idx];

        // Align and deduplicate; keep ascending interval order for the
        // propagation walk below.
        let mut aligned: std::collections::BTreeMap<i64, f64> = std::collections::BTreeMap::new();
        for p in points {
            aligned.insert(archive.interval(p.time), p.value);
        }

        let mut base = self.read_base_interval(&archive)?;
        for (&interval, &value) in &aligned {
            if base == 0 {
                // First write to this archive anchors the ring.
                base = interval;
            }
            self.write_point(&archive, base, interval, value)?;
        }

        // Cascade into lower-precision archives until a roll-up fails the
        // xFilesFactor test.
        let mut higher_idx = idx;
        for lower_idx in idx + 1..self.archives.len() {
            let lower = self.archives[lower_idx];
            let mut lower_intervals: Vec<i64> =
                aligned.keys().map(|&i| lower.interval(i)).collect();
            lower_intervals.dedup();

            let mut propagated = false;
            for interval in lower_intervals {
                if self.propagate(higher_idx, lower_idx, interval)? {
                    propagated = true;
                }
            }
            if !propagated {
                break;
            }
            higher_idx = lower_idx;
        }

        Ok(())
    }

    /// Roll one lower-archive interval up from its higher-precision slots.
    /// Returns whether a value was written.
    fn propagate(&mut self, higher_idx: usize, lower_idx: usize, lower_interval: i64) -> Result<bool> {
        let higher = self.archives[higher_idx];
        let lower = self.archives[lower_idx];

        let higher_base = self.read_base_interval(&higher)?;
        if higher_base == 0 {
            return Ok(false);
        }

        let step = higher.seconds_per_point() as i64;
        let slots = (lower.seconds_per_point() / higher.seconds_per_point()) as usize;

        let mut values = Vec::with_capacity(slots);
        for k in 0..slots {
            let expected = lower_interval + k as i64 * step;
            let (stored_interval, value) = self.read_point(&higher, higher_base, expected)?;
            if stored_interval == expected {
                values.push(value);
            }
        }

        let known_fraction = values.len() as f32 / slots as f32;
        if values.is_empty() || known_fraction < self.x_files_factor {
            return Ok(false);
        }

        let aggregated = self.aggregation.apply(&values);
        let mut lower_base = self.read_base_interval(&lower)?;
        if lower_base == 0 {
            lower_base = lower_interval;
        }
        self.write_point(&lower, lower_base, lower_interval, aggregated)?;
        Ok(true)
    }

    /// Read the values stored for `[from, until]`, served from the
    /// highest-precision archive whose history covers `from`.
    pub fn fetch(&self, from: i64, until: i64) -> Result<TimeSeries> {
        if from > until {
            return Err(WhisperError::InvalidTimeRange { from, until });
        }
        let now = unix_now();

        let archive = self
            .archives
            .iter()
            .find(|a| now - from <= a.retention.retention() as i64)
            .or_else(|| self.archives.last())
            .ok_or_else(|| WhisperError::Corrupt {
                path: self.path.clone(),
                reason: "no archives".to_string(),
            })?;

        let step = archive.seconds_per_point();
        let start = archive.interval(from);
        let end = archive.interval(until) + step as i64;
        let base = self.read_base_interval(archive)?;

        let mut values = Vec::with_capacity(((end - start) / step as i64) as usize);
        let mut interval = start;
        while interval < end {
            if base == 0 {
                values.push(None);
            } else {
                let (stored, value) = self.read_point(archive, base, interval)?;
                values.push((stored == interval).then_some(value));
            }
            interval += step as i64;
        }

        Ok(TimeSeries {
            from: start,
            until: end,
            step,
            values,
        })
    }

    fn slot_offset(&self, archive: &ArchiveInfo, base: i64, interval: i64) -> u64 {
        let step = archive.seconds_per_point() as i64;
        let slot = ((interval - base) / step).rem_euclid(archive.points() as i64);
        archive.offset as u64 + slot as u64 * POINT_SIZE
    }

    /// Interval stored in an archive's first slot; 0 when never written.
    fn read_base_interval(&self, archive: &ArchiveInfo) -> Result<i64> {
        let mut buf = [0u8; 4];
        self.file.read_exact_at(&mut buf, archive.offset as u64)?;
        Ok(u32::from_be_bytes(buf) as i64)
    }

    fn read_point(&self, archive: &ArchiveInfo, base: i64, interval: i64) -> Result<(i64, f64)> {
        let mut buf = [0u8; POINT_SIZE as usize];
        self.file
            .read_exact_at(&mut buf, self.slot_offset(archive, base, interval))?;
        let stored = u32::from_be_bytes(buf[0..4].try_into().unwrap_or_default()) as i64;
        let value = f64::from_be_bytes(buf[4..12].try_into().unwrap_or_default());
        Ok((stored, value))
    }

    fn write_point(
        &self,
        archive: &ArchiveInfo,
        base: i64,
        interval: i64,
        value: f64,
    ) -> Result<()> {
        let mut buf = [0u8; POINT_SIZE as usize];
        buf[0..4].copy_from_slice(&(interval as u32).to_be_bytes());
        buf[4..12].copy_from_slice(&value.to_be_bytes());
        self.file
            .write_all_at(&buf, self.slot_offset(archive, base, interval))?;
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
