//! Two-tier round-robin archive
//!
//! An archive holds two gauge series (for example CPU and memory) at a fixed
//! base step. Every tier keeps a bounded ring of rows; a row stores the mean of
//! all samples that landed in its step. Unknown rows are NaN.

use super::{Result, TsdbError};
use crate::persist::write_atomic;
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default base step (5 minutes)
pub const DEFAULT_STEP_SECS: u64 = 300;

/// High resolution tier: one row per base step, ~14 days at 5 minutes
pub const HIGH_RES_ROWS: u32 = 4032;

/// Low resolution tier: one row per hour at a 5 minute base step
pub const LOW_RES_STEPS_PER_ROW: u32 = 12;

/// Low resolution tier: ~1 year of hourly rows
pub const LOW_RES_ROWS: u32 = 8760;

/// Number of series stored per archive
pub const SERIES: usize = 2;

const MAGIC: &[u8; 8] = b"FLEETRRD";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 8 + 2 + 2 + 8 + 1 + 8 + 2;
const TIER_HEADER_LEN: usize = 4 + 4 + 8 + 4 + 8 * SERIES;
const MAX_TIERS: usize = 8;

/// One retention tier of an archive
#[derive(Debug, Clone)]
struct Tier {
    steps_per_row: u32,
    rows: u32,
    /// Start of the step currently being accumulated (valid when `acc_count > 0`)
    current_bucket: i64,
    acc_count: u32,
    acc_sums: [f64; SERIES],
    data: Vec<f64>,
}

impl Tier {
    fn new(steps_per_row: u32, rows: u32) -> Self {
        Self {
            steps_per_row,
            rows,
            current_bucket: 0,
            acc_count: 0,
            acc_sums: [0.0; SERIES],
            data: vec![f64::NAN; rows as usize * SERIES],
        }
    }

    fn step(&self, base_step: u64) -> i64 {
        (base_step * self.steps_per_row as u64) as i64
    }

    fn slot(&self, bucket: i64, step: i64) -> usize {
        (bucket.div_euclid(step)).rem_euclid(self.rows as i64) as usize * SERIES
    }

    fn has_data(&self) -> bool {
        self.acc_count > 0
    }

    fn update(&mut self, timestamp: i64, values: [f64; SERIES], step: i64) {
        let bucket = align(timestamp, step);

        if self.has_data() && bucket == self.current_bucket {
            self.acc_count += 1;
            for (sum, value) in self.acc_sums.iter_mut().zip(values) {
                *sum += value;
            }
        } else {
            if self.has_data() && bucket > self.current_bucket {
                // Steps that received no sample between two updates become unknown
                let skipped = ((bucket - self.current_bucket) / step - 1).min(self.rows as i64);
                for k in 1..=skipped {
                    let slot = self.slot(self.current_bucket + k * step, step);
                    self.data[slot..slot + SERIES].fill(f64::NAN);
                }
            }
            self.current_bucket = bucket;
            self.acc_count = 1;
            self.acc_sums = values;
        }

        let slot = self.slot(bucket, step);
        for (i, sum) in self.acc_sums.iter().enumerate() {
            self.data[slot + i] = sum / self.acc_count as f64;
        }
    }

    /// Oldest and newest bucket the ring still holds
    fn retention(&self, step: i64) -> Option<(i64, i64)> {
        self.has_data().then(|| {
            (
                self.current_bucket - (self.rows as i64 - 1) * step,
                self.current_bucket,
            )
        })
    }

    fn retains(&self, bucket: i64, step: i64) -> bool {
        self.has_data()
            && bucket <= self.current_bucket
            && bucket > self.current_bucket - self.rows as i64 * step
    }

    fn read(&self, bucket: i64, step: i64) -> [f64; SERIES] {
        if !self.retains(bucket, step) {
            return [f64::NAN; SERIES];
        }
        let slot = self.slot(bucket, step);
        let mut out = [f64::NAN; SERIES];
        out.copy_from_slice(&self.data[slot..slot + SERIES]);
        out
    }
}

/// Summary of an archive's layout and state
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveInfo {
    pub step_secs: u64,
    pub last_update: Option<DateTime<Utc>>,
    /// `(step seconds, rows)` for each tier, finest first
    pub tiers: Vec<(u64, u32)>,
}

/// Round-robin archive stored in a single file
#[derive(Debug, Clone)]
pub struct Archive {
    path: PathBuf,
    step: u64,
    last_update: Option<i64>,
    tiers: Vec<Tier>,
}

impl Archive {
    /// Create an archive at `path`, or open it if an archive already exists there.
    ///
    /// Fails when `path` exists but is not an archive.
    pub fn create(path: impl AsRef<Path>, step_secs: u64) -> Result<Self> {
        let path = path.as_ref();
        if step_secs == 0 {
            return Err(TsdbError::InvalidStep(step_secs));
        }

        if path.exists() {
            return Self::open(path);
        }

        let archive = Self {
            path: path.to_path_buf(),
            step: step_secs,
            last_update: None,
            tiers: vec![
                Tier::new(1, HIGH_RES_ROWS),
                Tier::new(LOW_RES_STEPS_PER_ROW, LOW_RES_ROWS),
            ],
        };
        archive.persist()?;

        debug!(path = %path.display(), step_secs, "Created archive");
        Ok(archive)
    }

    /// Open an existing archive
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| TsdbError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::decode(path, &data)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base step in seconds
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Time of the most recent successful append
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update.and_then(|ts| DateTime::from_timestamp(ts, 0))
    }

    pub fn info(&self) -> ArchiveInfo {
        ArchiveInfo {
            step_secs: self.step,
            last_update: self.last_update(),
            tiers: self
                .tiers
                .iter()
                .map(|t| (t.step(self.step) as u64, t.rows))
                .collect(),
        }
    }

    /// Append one sample and persist the archive.
    ///
    /// `timestamp` must be strictly after the last update, otherwise
    /// [`TsdbError::StaleUpdate`] is returned and the archive is unchanged.
    pub fn append(&mut self, timestamp: DateTime<Utc>, v1: f64, v2: f64) -> Result<()> {
        let ts = timestamp.timestamp();
        if let Some(last) = self.last_update {
            if ts <= last {
                return Err(TsdbError::StaleUpdate {
                    path: self.path.clone(),
                    timestamp: ts,
                    last_update: last,
                });
            }
        }

        let mut next = self.clone();
        let base_step = next.step;
        for tier in next.tiers.iter_mut() {
            let step = tier.step(base_step);
            tier.update(ts, [v1, v2], step);
        }
        next.last_update = Some(ts);
        next.persist()?;

        *self = next;
        Ok(())
    }

    /// Read rows between `start` and `end` (both inclusive after alignment).
    ///
    /// The tier whose step equals `step_secs` is used, falling back to the
    /// finest tier with a coarser step, then to the coarsest tier. Only rows
    /// inside the tier's retention window are returned.
    pub fn fetch(&self, start: DateTime<Utc>, end: DateTime<Utc>, step_secs: u64) -> FetchResult {
        let tier = self.select_tier(step_secs);
        let step = tier.step(self.step);

        let mut rows = Vec::new();
        let Some((oldest, newest)) = tier.retention(step) else {
            return FetchResult {
                step_secs: step as u64,
                rows,
            };
        };
        let first = align(start.timestamp(), step).max(oldest);
        let last = align(end.timestamp(), step).min(newest);

        let mut bucket = first;
        while bucket <= last {
            rows.push((bucket, tier.read(bucket, step)));
            bucket += step;
        }

        FetchResult {
            step_secs: step as u64,
            rows,
        }
    }

    fn select_tier(&self, step_secs: u64) -> &Tier {
        let base = self.step;
        self.tiers
            .iter()
            .find(|t| t.step(base) as u64 == step_secs)
            .or_else(|| {
                self.tiers
                    .iter()
                    .filter(|t| t.step(base) as u64 >= step_secs)
                    .min_by_key(|t| t.steps_per_row)
            })
            .or_else(|| self.tiers.iter().max_by_key(|t| t.steps_per_row))
            .expect("archive always has at least one tier")
    }

    fn encode(&self) -> BytesMut {
        let data_len: usize = self.tiers.iter().map(|t| t.data.len() * 8).sum();
        let mut buf =
            BytesMut::with_capacity(HEADER_LEN + self.tiers.len() * TIER_HEADER_LEN + data_len);

        buf.put_slice(MAGIC);
        buf.put_u16_le(FORMAT_VERSION);
        buf.put_u16_le(SERIES as u16);
        buf.put_u64_le(self.step);
        buf.put_u8(self.last_update.is_some() as u8);
        buf.put_i64_le(self.last_update.unwrap_or(0));
        buf.put_u16_le(self.tiers.len() as u16);

        for tier in &self.tiers {
            buf.put_u32_le(tier.steps_per_row);
            buf.put_u32_le(tier.rows);
            buf.put_i64_le(tier.current_bucket);
            buf.put_u32_le(tier.acc_count);
            for sum in tier.acc_sums {
                buf.put_f64_le(sum);
            }
        }
        for tier in &self.tiers {
            for value in &tier.data {
                buf.put_f64_le(*value);
            }
        }

        buf
    }

    fn decode(path: &Path, data: &[u8]) -> Result<Self> {
        if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
            return Err(TsdbError::NotAnArchive {
                path: path.to_path_buf(),
            });
        }
        let corrupt = |reason: String| TsdbError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };
        if data.len() < HEADER_LEN {
            return Err(corrupt("truncated header".to_string()));
        }

        let mut buf = &data[MAGIC.len()..];
        let version = buf.get_u16_le();
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", version)));
        }
        let series = buf.get_u16_le() as usize;
        if series != SERIES {
            return Err(corrupt(format!("expected {} series, found {}", SERIES, series)));
        }
        let step = buf.get_u64_le();
        if step == 0 {
            return Err(corrupt("zero step".to_string()));
        }
        let has_update = buf.get_u8() != 0;
        let last = buf.get_i64_le();
        let tier_count = buf.get_u16_le() as usize;
        if tier_count == 0 || tier_count > MAX_TIERS {
            return Err(corrupt(format!("invalid tier count {}", tier_count)));
        }
        if buf.remaining() < tier_count * TIER_HEADER_LEN {
            return Err(corrupt("truncated tier headers".to_string()));
        }

        let mut tiers = Vec::with_capacity(tier_count);
        for _ in 0..tier_count {
            let steps_per_row = buf.get_u32_le();
            let rows = buf.get_u32_le();
            if steps_per_row == 0 || rows == 0 {
                return Err(corrupt("empty tier".to_string()));
            }
            let current_bucket = buf.get_i64_le();
            let acc_count = buf.get_u32_le();
            let mut acc_sums = [0.0; SERIES];
            for sum in acc_sums.iter_mut() {
                *sum = buf.get_f64_le();
            }
            tiers.push(Tier {
                steps_per_row,
                rows,
                current_bucket,
                acc_count,
                acc_sums,
                data: Vec::new(),
            });
        }

        let expected: usize = tiers.iter().map(|t| t.rows as usize * SERIES * 8).sum();
        if buf.remaining() != expected {
            return Err(corrupt(format!(
                "expected {} bytes of row data, found {}",
                expected,
                buf.remaining()
            )));
        }
        for tier in tiers.iter_mut() {
            let len = tier.rows as usize * SERIES;
            tier.data = (0..len).map(|_| buf.get_f64_le()).collect();
        }

        Ok(Self {
            path: path.to_path_buf(),
            step,
            last_update: has_update.then_some(last),
            tiers,
        })
    }

    fn persist(&self) -> Result<()> {
        write_atomic(&self.path, &self.encode()).map_err(|source| TsdbError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

/// Rows returned by [`Archive::fetch`]
///
/// Iterating a series does not consume the result, so it can be walked any
/// number of times.
#[derive(Debug, Clone)]
pub struct FetchResult {
    step_secs: u64,
    rows: Vec<(i64, [f64; SERIES])>,
}

impl FetchResult {
    /// Step of the tier that served the fetch
    pub fn step_secs(&self) -> u64 {
        self.step_secs
    }

    /// Number of retained rows in the range, known or not
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Raw rows including unknown values
    pub fn rows(&self) -> impl Iterator<Item = (DateTime<Utc>, [f64; SERIES])> + '_ {
        self.rows
            .iter()
            .filter_map(|(ts, values)| DateTime::from_timestamp(*ts, 0).map(|t| (t, *values)))
    }

    /// Known values of one series, in ascending time order
    pub fn series(&self, index: usize) -> impl Iterator<Item = (DateTime<Utc>, f64)> + '_ {
        self.rows()
            .map(move |(ts, values)| (ts, values[index]))
            .filter(|(_, value)| !value.is_nan())
    }
}

/// Round a unix timestamp down to a multiple of `step`
pub fn align(timestamp: i64, step: i64) -> i64 {
    timestamp.div_euclid(step) * step
}
