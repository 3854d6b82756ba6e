//! Configuration types for the distributed LSH engine.
//!
//! [`LshConfig`] holds the hashing parameters shared by every rank,
//! [`ComputeConfig`] sizes the per-rank device pool and [`CommConfig`] bounds
//! collective waits. All three are serde-serializable; `LshConfig` can also be
//! read from and written to the plain `key value` options format.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LshError, Result};

/// The LSH family used to hash points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HashFamilyKind {
    /// `floor((a . x + b) / w)` with Gaussian `a` and uniform `b`.
    #[default]
    RandomProjections,
    /// Interval index of `a . x` among collectively estimated cut-off points.
    EntropyBased,
}

impl HashFamilyKind {
    pub fn name(&self) -> &'static str {
        match self {
            HashFamilyKind::RandomProjections => "random_projections",
            HashFamilyKind::EntropyBased => "entropy_based",
        }
    }
}

impl fmt::Display for HashFamilyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashFamilyKind {
    type Err = LshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random_projections" => Ok(HashFamilyKind::RandomProjections),
            "entropy_based" => Ok(HashFamilyKind::EntropyBased),
            "mixed_hash_functions" | "mixed" => Err(LshError::not_implemented(
                "mixed hash function family is not supported",
            )),
            other => Err(LshError::invalid_argument(format!(
                "unknown hash function family '{}'",
                other
            ))),
        }
    }
}

/// Storage order of a shard's coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryLayout {
    /// Array of structs: one point after another.
    #[default]
    Aos,
    /// Struct of arrays: one dimension after another.
    Soa,
}

impl MemoryLayout {
    pub fn name(&self) -> &'static str {
        match self {
            MemoryLayout::Aos => "aos",
            MemoryLayout::Soa => "soa",
        }
    }
}

impl fmt::Display for MemoryLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for MemoryLayout {
    type Err = LshError;

    fn from_str(s: &str) -> Result<Self> {
        [MemoryLayout::Aos, MemoryLayout::Soa]
            .into_iter()
            .find(|layout| layout.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| LshError::invalid_argument(format!("unknown memory layout '{}'", s)))
    }
}

/// Distance used for exact refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Metric {
    /// Euclidean distance.
    #[default]
    L2,
    /// Squared Euclidean distance.
    SquaredL2,
    /// Manhattan distance.
    L1,
    /// One minus cosine similarity.
    Cosine,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::L2 => "L2",
            Metric::SquaredL2 => "SquaredL2",
            Metric::L1 => "L1",
            Metric::Cosine => "Cosine",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Metric {
    type Err = LshError;

    fn from_str(s: &str) -> Result<Self> {
        [Metric::L2, Metric::SquaredL2, Metric::L1, Metric::Cosine]
            .into_iter()
            .find(|metric| metric.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| LshError::invalid_argument(format!("unknown metric '{}'", s)))
    }
}

/// Largest legal number of entropy-based intervals.
pub const MAX_CUT_OFF_POINTS: usize = 1 << 16;

/// Hashing parameters. Must be identical on every rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LshConfig {
    /// Hash family of every table.
    pub family: HashFamilyKind,

    /// Number of candidate hash functions the tables draw from.
    pub hash_pool_size: usize,

    /// Number of hash functions (K) combined per table.
    pub num_hash_functions: usize,

    /// Number of hash tables (L).
    pub num_hash_tables: usize,

    /// Number of distinct hash values per table.
    pub hash_table_size: u32,

    /// Bucket width of random projections.
    pub w: f32,

    /// Number of intervals of entropy-based functions.
    pub num_cut_off_points: usize,

    /// Seed all ranks use to generate projection parameters.
    pub seed: u64,

    /// Distance used for refinement.
    pub metric: Metric,

    /// Storage order of the shard.
    pub memory_layout: MemoryLayout,

    /// Maximum number of neighboring buckets probed per table.
    pub max_probes: usize,
}

impl Default for LshConfig {
    fn default() -> Self {
        Self {
            family: HashFamilyKind::RandomProjections,
            hash_pool_size: 10,
            num_hash_functions: 4,
            num_hash_tables: 2,
            hash_table_size: 105_619,
            w: 1.0,
            num_cut_off_points: 4,
            seed: 42,
            metric: Metric::L2,
            memory_layout: MemoryLayout::Aos,
            max_probes: 8,
        }
    }
}

impl LshConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hash family.
    pub fn with_family(mut self, family: HashFamilyKind) -> Self {
        self.family = family;
        self
    }

    /// Set the size of the hash function pool.
    pub fn with_hash_pool_size(mut self, size: usize) -> Self {
        self.hash_pool_size = size;
        self
    }

    /// Set the number of hash functions per table.
    pub fn with_num_hash_functions(mut self, k: usize) -> Self {
        self.num_hash_functions = k;
        self
    }

    /// Set the number of hash tables.
    pub fn with_num_hash_tables(mut self, l: usize) -> Self {
        self.num_hash_tables = l;
        self
    }

    /// Set the number of distinct hash values per table.
    pub fn with_hash_table_size(mut self, size: u32) -> Self {
        self.hash_table_size = size;
        self
    }

    /// Set the bucket width.
    pub fn with_w(mut self, w: f32) -> Self {
        self.w = w;
        self
    }

    /// Set the number of cut-off points.
    pub fn with_num_cut_off_points(mut self, n: usize) -> Self {
        self.num_cut_off_points = n;
        self
    }

    /// Set the parameter seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the refinement metric.
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    /// Set the shard memory layout.
    pub fn with_memory_layout(mut self, layout: MemoryLayout) -> Self {
        self.memory_layout = layout;
        self
    }

    /// Set the multi-probe limit.
    pub fn with_max_probes(mut self, probes: usize) -> Self {
        self.max_probes = probes;
        self
    }

    /// Check every value for legality.
    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, option: &str, value: impl fmt::Display, cond: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(LshError::invalid_argument(format!(
                    "Illegal {} value ({})! Legal values must fulfill: '{}'.",
                    option, value, cond
                )))
            }
        }

        check(self.hash_pool_size > 0, "hash_pool_size", self.hash_pool_size, "hash_pool_size > 0")?;
        check(
            self.num_hash_functions > 0,
            "num_hash_functions",
            self.num_hash_functions,
            "num_hash_functions > 0",
        )?;
        check(self.num_hash_tables > 0, "num_hash_tables", self.num_hash_tables, "num_hash_tables > 0")?;
        check(self.hash_table_size > 0, "hash_table_size", self.hash_table_size, "hash_table_size > 0")?;
        check(self.w > 0.0, "w", self.w, "w > 0")?;
        check(
            self.num_cut_off_points > 0 && self.num_cut_off_points <= MAX_CUT_OFF_POINTS,
            "num_cut_off_points",
            self.num_cut_off_points,
            "0 < num_cut_off_points <= 65536",
        )?;
        Ok(())
    }

    /// Parse the `key value` options format, one option per line.
    ///
    /// Empty lines are skipped. Options not present keep their default value.
    /// The result is validated.
    pub fn parse_options(text: &str) -> Result<Self> {
        fn value<T: FromStr>(lineno: usize, opt: &str, raw: &str) -> Result<T> {
            raw.trim().parse::<T>().map_err(|_| {
                LshError::invalid_argument(format!(
                    "Invalid value in line {} '{} {}'!",
                    lineno, opt, raw
                ))
            })
        }

        let mut config = Self::default();
        for (idx, line) in text.lines().enumerate() {
            let lineno = idx + 1;
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let (opt, raw) = line.split_once(' ').ok_or_else(|| {
                LshError::invalid_argument(format!("Illegal line ({}) '{}'!", lineno, line))
            })?;

            match opt {
                "hash_family" => config.family = raw.trim().parse()?,
                "hash_pool_size" => config.hash_pool_size = value(lineno, opt, raw)?,
                "num_hash_functions" => config.num_hash_functions = value(lineno, opt, raw)?,
                "num_hash_tables" => config.num_hash_tables = value(lineno, opt, raw)?,
                "hash_table_size" => config.hash_table_size = value(lineno, opt, raw)?,
                "w" => config.w = value(lineno, opt, raw)?,
                "num_cut_off_points" => config.num_cut_off_points = value(lineno, opt, raw)?,
                "seed" => config.seed = value(lineno, opt, raw)?,
                "max_probes" => config.max_probes = value(lineno, opt, raw)?,
                "metric" => config.metric = raw.trim().parse()?,
                "memory_layout" => config.memory_layout = raw.trim().parse()?,
                _ => {
                    return Err(LshError::invalid_argument(format!(
                        "Invalid option in line {} '{} {}'!",
                        lineno, opt, raw
                    )))
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Render the options format read by [`LshConfig::parse_options`].
    pub fn to_options_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for LshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "hash_family {}", self.family)?;
        writeln!(f, "hash_pool_size {}", self.hash_pool_size)?;
        writeln!(f, "num_hash_functions {}", self.num_hash_functions)?;
        writeln!(f, "num_hash_tables {}", self.num_hash_tables)?;
        writeln!(f, "hash_table_size {}", self.hash_table_size)?;
        writeln!(f, "w {}", self.w)?;
        writeln!(f, "num_cut_off_points {}", self.num_cut_off_points)?;
        writeln!(f, "seed {}", self.seed)?;
        writeln!(f, "max_probes {}", self.max_probes)?;
        writeln!(f, "metric {}", self.metric)?;
        writeln!(f, "memory_layout {}", self.memory_layout)
    }
}

/// Sizing of the per-rank compute device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// Worker threads of the device pool (0 = rayon default).
    pub num_threads: usize,

    /// Points processed by one kernel.
    pub work_group_size: usize,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            num_threads: 2,
            work_group_size: 256,
        }
    }
}

impl ComputeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn with_num_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    /// Set the kernel work group size.
    pub fn with_work_group_size(mut self, n: usize) -> Self {
        self.work_group_size = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.work_group_size == 0 {
            return Err(LshError::invalid_argument("work_group_size must be > 0"));
        }
        Ok(())
    }
}

/// Communication policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommConfig {
    /// Upper bound of every collective wait.
    pub timeout: Duration,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl CommConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the collective timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_default_config() {
        let config = LshConfig::default();
        assert_eq!(config.hash_pool_size, 10);
        assert_eq!(config.num_hash_functions, 4);
        assert_eq!(config.num_hash_tables, 2);
        assert_eq!(config.hash_table_size, 105_619);
        assert_eq!(config.num_cut_off_points, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = LshConfig::new()
            .with_family(HashFamilyKind::EntropyBased)
            .with_num_hash_tables(3)
            .with_w(2.5)
            .with_seed(7);
        assert_eq!(config.family, HashFamilyKind::EntropyBased);
        assert_eq!(config.num_hash_tables, 3);
        assert_eq!(config.w, 2.5);
        assert_eq!(config.seed, 7);
    }

    #[test]
    fn test_validate_rejects_zero_and_negative() {
        let err = LshConfig::new().with_num_hash_tables(0).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.message().contains("num_hash_tables"));

        let err = LshConfig::new().with_w(0.0).validate().unwrap_err();
        assert!(err.message().contains("w > 0"));

        assert!(ComputeConfig::new().with_work_group_size(0).validate().is_err());
    }

    #[test]
    fn test_family_from_str() {
        assert_eq!(
            "entropy_based".parse::<HashFamilyKind>().unwrap(),
            HashFamilyKind::EntropyBased
        );
        let err = "mixed_hash_functions".parse::<HashFamilyKind>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotImplemented);
        let err = "cosine".parse::<HashFamilyKind>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_options_round_trip() {
        let config = LshConfig::new()
            .with_family(HashFamilyKind::EntropyBased)
            .with_hash_table_size(1021)
            .with_w(0.5)
            .with_seed(99)
            .with_metric(Metric::Cosine)
            .with_memory_layout(MemoryLayout::Soa);
        let text = config.to_options_string();
        assert!(text.contains("metric Cosine"));
        assert!(text.contains("memory_layout soa"));
        let parsed = LshConfig::parse_options(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_layout_and_metric_options() {
        let parsed = LshConfig::parse_options("metric squaredl2\nmemory_layout SOA\n").unwrap();
        assert_eq!(parsed.metric, Metric::SquaredL2);
        assert_eq!(parsed.memory_layout, MemoryLayout::Soa);

        let err = LshConfig::parse_options("memory_layout rows").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(LshConfig::parse_options("metric hamming").is_err());
    }

    #[test]
    fn test_cut_off_points_bounded() {
        let err = LshConfig::new().with_num_cut_off_points(usize::MAX).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.message().contains("num_cut_off_points"));
        assert!(LshConfig::new().with_num_cut_off_points(MAX_CUT_OFF_POINTS).validate().is_ok());
        assert!(LshConfig::new().with_num_cut_off_points(MAX_CUT_OFF_POINTS + 1).validate().is_err());
    }

    #[test]
    fn test_parse_options_errors() {
        assert!(LshConfig::parse_options("hash_pool_size").is_err());
        assert!(LshConfig::parse_options("bogus 3").is_err());
        assert!(LshConfig::parse_options("w abc").is_err());
        assert!(LshConfig::parse_options("w -1").is_err());

        let partial = LshConfig::parse_options("\nnum_hash_tables 5\n").unwrap();
        assert_eq!(partial.num_hash_tables, 5);
        assert_eq!(partial.hash_pool_size, 10);
    }
}
