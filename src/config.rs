use crate::cache::MAX_FILE_ID;
use crate::pages::DEFAULT_PAGE_SIZE;

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Default amount of page data held by the cache.
pub const DEFAULT_CACHE_SIZE: usize = 32 * 1024 * 1024;

/// Smallest page size the cache accepts.
pub const MIN_PAGE_SIZE: usize = 256;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid byte size `{0}`")]
    InvalidByteSize(String),
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("page size {0} must be a multiple of 8 and at least {MIN_PAGE_SIZE}")]
    PageSize(usize),
    #[error("cache of {cache_size} bytes cannot hold a single page of {page_size} bytes")]
    CacheTooSmall { cache_size: usize, page_size: usize },
    #[error("buffer alignment {0} is not a power of two")]
    Alignment(usize),
    #[error("max file id {0} is outside 1..={MAX_FILE_ID}")]
    MaxFileId(u32),
    #[error("translation table needs at least one shard")]
    Shards,
}

/// Page cache settings.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// size of a page, in bytes
    pub page_size: usize,
    /// bytes of page data the cache holds; the slot count is derived from it
    pub cache_size: usize,
    /// off-heap bytes the memory arena may hand out, `None` for no limit
    pub memory_budget: Option<usize>,
    /// alignment of the slot buffer region
    pub buffer_alignment: usize,
    /// number of translation table shards
    pub table_shards: usize,
    /// highest file id the swapper registry hands out
    pub max_file_id: u32,
    /// open file swappers with O_DIRECT
    pub direct_io: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            memory_budget: None,
            buffer_alignment: 4096,
            table_shards: 64,
            max_file_id: MAX_FILE_ID,
            direct_io: false,
        }
    }
}

impl Config {
    /// Creates a config holding exactly `slots` pages of `page_size` bytes.
    pub fn with_slots(slots: usize, page_size: usize) -> Self {
        Self {
            page_size,
            cache_size: slots * page_size,
            ..Self::default()
        }
    }

    /// Reads `SLOTCACHE_*` environment variables on top of the defaults.
    ///
    /// Unset variables keep their default value. Malformed ones are reported.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = env("SLOTCACHE_PAGE_SIZE") {
            config.page_size = parse_byte_size(&value)?;
        }
        if let Some(value) = env("SLOTCACHE_CACHE_SIZE") {
            config.cache_size = parse_byte_size(&value)?;
        }
        if let Some(value) = env("SLOTCACHE_MEMORY_BUDGET") {
            config.memory_budget = Some(parse_byte_size(&value)?);
        }
        if let Some(value) = env("SLOTCACHE_BUFFER_ALIGNMENT") {
            config.buffer_alignment = parse_byte_size(&value)?;
        }
        if let Some(value) = env("SLOTCACHE_TABLE_SHARDS") {
            config.table_shards = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SLOTCACHE_TABLE_SHARDS",
                value,
            })?;
        }
        if let Some(value) = env("SLOTCACHE_MAX_FILE_ID") {
            config.max_file_id = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SLOTCACHE_MAX_FILE_ID",
                value,
            })?;
        }
        if let Some(value) = env("SLOTCACHE_DIRECT_IO") {
            config.direct_io = match value.as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "SLOTCACHE_DIRECT_IO",
                        value,
                    });
                }
            };
        }

        Ok(config)
    }

    /// Like [`Config::try_from_env`], falling back to the defaults when the
    /// environment is malformed.
    pub fn from_env() -> Self {
        Self::try_from_env().unwrap_or_else(|err| {
            log::warn!("ignoring page cache environment: {err}");
            Self::default()
        })
    }

    /// Number of slots the cache will have. Rounds down.
    pub fn slot_count(&self) -> usize {
        self.cache_size / self.page_size
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_multiple_of(8) {
            return Err(ConfigError::PageSize(self.page_size));
        }
        if self.slot_count() == 0 {
            return Err(ConfigError::CacheTooSmall {
                cache_size: self.cache_size,
                page_size: self.page_size,
            });
        }
        if !self.buffer_alignment.is_power_of_two() {
            return Err(ConfigError::Alignment(self.buffer_alignment));
        }
        if self.max_file_id == 0 || self.max_file_id > MAX_FILE_ID {
            return Err(ConfigError::MaxFileId(self.max_file_id));
        }
        if self.table_shards == 0 {
            return Err(ConfigError::Shards);
        }
        Ok(())
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

static BYTE_SIZE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*(?:([kKmMgGtT])(?:i?[bB])?|[bB])?\s*$").unwrap()
});

/// Parses sizes like `8192`, `8k`, `8KiB`, `2 MiB` or `513g`. Units are binary.
pub fn parse_byte_size(value: &str) -> Result<usize, ConfigError> {
    let invalid = || ConfigError::InvalidByteSize(value.to_string());
    let captures = BYTE_SIZE.captures(value).ok_or_else(invalid)?;
    let number: usize = captures[1].parse().map_err(|_| invalid())?;
    let shift = match captures.get(2).map(|unit| unit.as_str()) {
        None => 0,
        Some("k" | "K") => 10,
        Some("m" | "M") => 20,
        Some("g" | "G") => 30,
        Some(_) => 40,
    };
    number.checked_mul(1 << shift).ok_or_else(invalid)
}

pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::from_env);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sizes() {
        assert_eq!(parse_byte_size("8192"), Ok(8192));
        assert_eq!(parse_byte_size("8k"), Ok(8192));
        assert_eq!(parse_byte_size("8KiB"), Ok(8192));
        assert_eq!(parse_byte_size(" 2 MiB "), Ok(2 * 1024 * 1024));
        assert_eq!(parse_byte_size("513g"), Ok(513 << 30));
        assert_eq!(parse_byte_size("1T"), Ok(1 << 40));
        assert_eq!(parse_byte_size("64b"), Ok(64));
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("12 apples").is_err());
        assert!(parse_byte_size("-1k").is_err());
    }

    #[test]
    fn slot_count_rounds_down() {
        let mut config = Config::with_slots(8, 8192);
        assert_eq!(config.slot_count(), 8);
        config.cache_size += 8191;
        assert_eq!(config.slot_count(), 8);
        config.cache_size += 1;
        assert_eq!(config.slot_count(), 9);
    }

    #[test]
    fn validation() {
        assert_eq!(Config::default().validate(), Ok(()));

        let config = Config::with_slots(8, 100);
        assert_eq!(config.validate(), Err(ConfigError::PageSize(100)));

        let config = Config {
            cache_size: 4096,
            page_size: 8192,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CacheTooSmall { .. })
        ));

        let config = Config {
            buffer_alignment: 3000,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Alignment(3000)));

        let config = Config {
            max_file_id: 0,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MaxFileId(0)));
    }
}
