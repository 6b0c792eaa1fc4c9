//! Plugin configuration built from command-line arguments

use crate::error::ConfigError;
use crate::limiter::{DEFAULT_STAT_BURST, DEFAULT_STAT_RATE};
use crate::utils::BlockMetric;
use crate::walker::{DepthLimit, ScanRequest, DEFAULT_MAX_DEPTH};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of the scratch file the agent helper keeps between runs
const TEMPFILE_PREFIX: &str = "mackerel-plugin-nginx-cache-";

/// Validated settings for one plugin invocation
#[derive(Debug, Clone, PartialEq)]
pub struct PluginConfig {
    /// `proxy_cache_path` root
    pub cache_path: PathBuf,
    /// `max_size` of the cache, in the unit nginx was configured with
    pub capacity: u64,
    /// `keys_zone` name, used for labelling only
    pub zone_name: String,
    pub tempfile: PathBuf,
    pub stat_rate: f64,
    pub stat_burst: u32,
    pub depth_limit: DepthLimit,
    pub block_metric: BlockMetric,
    /// Hard deadline for the scan, enforced through cancellation
    pub timeout: Option<Duration>,
}

impl PluginConfig {
    /// Defaults for everything but the required nginx settings
    pub fn new(cache_path: impl Into<PathBuf>, capacity: u64, zone_name: impl Into<String>) -> Self {
        let cache_path = cache_path.into();
        let tempfile = build_tempfile_path(&cache_path);
        Self {
            cache_path,
            capacity,
            zone_name: zone_name.into(),
            tempfile,
            stat_rate: DEFAULT_STAT_RATE,
            stat_burst: DEFAULT_STAT_BURST,
            depth_limit: DepthLimit::advisory(DEFAULT_MAX_DEPTH),
            block_metric: BlockMetric::default(),
            timeout: None,
        }
    }

    pub fn scan_request(&self) -> ScanRequest {
        ScanRequest {
            root: self.cache_path.clone(),
            depth_limit: self.depth_limit,
            rate: self.stat_rate,
            burst: self.stat_burst,
            metric: self.block_metric,
        }
    }

    /// Check limiter settings up front so a bad flag fails before any scan
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingPath);
        }
        if !self.stat_rate.is_finite() || self.stat_rate <= 0.0 {
            return Err(ConfigError::InvalidRate(self.stat_rate.to_string()));
        }
        if self.stat_burst == 0 {
            return Err(ConfigError::InvalidBurst);
        }
        Ok(())
    }
}

/// Parse an nginx `max_size` value.
///
/// A trailing `m` is stripped and the rest is read as an unsigned integer.
/// `0x`, `0o`, `0b` and leading-zero octal prefixes are honoured.
pub fn parse_capacity(raw: &str) -> Result<u64, ConfigError> {
    let digits = raw.strip_suffix('m').unwrap_or(raw);

    let invalid = |reason: &str| ConfigError::InvalidCapacity {
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    if digits.is_empty() {
        return Err(invalid("empty value"));
    }

    let (radix, body) = if let Some(rest) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        (16, rest)
    } else if let Some(rest) = digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")) {
        (2, rest)
    } else if let Some(rest) = digits.strip_prefix("0o").or_else(|| digits.strip_prefix("0O")) {
        (8, rest)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };

    // from_str_radix would accept a leading '+'
    if body.is_empty() || !body.chars().all(|c| c.is_digit(radix)) {
        return Err(invalid("not an unsigned integer"));
    }

    u64::from_str_radix(body, radix).map_err(|e| invalid(&e.to_string()))
}

/// Scratch file path derived from the cache root.
///
/// Path separators become `-`, so the same root always maps to the same file.
pub fn build_tempfile_path(cache_path: &Path) -> PathBuf {
    let flattened = cache_path.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "-");
    tempfile_dir().join(format!("{}{}", TEMPFILE_PREFIX, flattened))
}

#[cfg(unix)]
fn tempfile_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

#[cfg(not(unix))]
fn tempfile_dir() -> PathBuf {
    std::env::temp_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_capacity_strips_megabyte_suffix() {
        assert_eq!(parse_capacity("500m"), Ok(500));
        assert_eq!(parse_capacity("500"), Ok(500));
        assert_eq!(parse_capacity("0"), Ok(0));
    }

    #[test]
    fn test_parse_capacity_base_prefixes() {
        assert_eq!(parse_capacity("0x10"), Ok(16));
        assert_eq!(parse_capacity("0b101m"), Ok(5));
        assert_eq!(parse_capacity("0o17"), Ok(15));
        assert_eq!(parse_capacity("017"), Ok(15));
    }

    #[test]
    fn test_parse_capacity_rejects_garbage() {
        for raw in ["", "m", "10g", "-5", "+5", "5mm", "0x", "09", " 5", "18446744073709551616"] {
            assert!(
                matches!(parse_capacity(raw), Err(ConfigError::InvalidCapacity { .. })),
                "{:?} should be rejected",
                raw
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_tempfile_path_is_deterministic() {
        let path = build_tempfile_path(Path::new("/var/cache/nginx"));
        assert_eq!(path, PathBuf::from("/tmp/mackerel-plugin-nginx-cache--var-cache-nginx"));
        assert_eq!(path, build_tempfile_path(Path::new("/var/cache/nginx")));
        assert_ne!(path, build_tempfile_path(Path::new("/var/cache/other")));
    }

    #[test]
    fn test_new_config_defaults() {
        let config = PluginConfig::new("/var/cache/nginx", 500, "zone1");

        assert_eq!(config.stat_rate, DEFAULT_STAT_RATE);
        assert_eq!(config.stat_burst, DEFAULT_STAT_BURST);
        assert!(!config.depth_limit.enforce);
        assert_eq!(config.tempfile, build_tempfile_path(Path::new("/var/cache/nginx")));
        assert!(config.validate().is_ok());

        let request = config.scan_request();
        assert_eq!(request.root, PathBuf::from("/var/cache/nginx"));
        assert_eq!(request.burst, DEFAULT_STAT_BURST);
    }

    #[test]
    fn test_validate_rejects_bad_limiter_settings() {
        let mut config = PluginConfig::new("/var/cache/nginx", 500, "zone1");
        config.stat_rate = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidRate(_))));

        config.stat_rate = 10.0;
        config.stat_burst = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidBurst));

        let empty = PluginConfig::new("", 500, "zone1");
        assert_eq!(empty.validate(), Err(ConfigError::MissingPath));
    }
}
