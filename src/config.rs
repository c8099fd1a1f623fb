//! Allocator configuration
//!
//! Values come from defaults, an optional TOML file and `HANDLEMEM_*`
//! environment variables, in that order of precedence (last wins).

use crate::error::{Error, Result};
use crate::memory::handle::{
    BIG_CHUNK_MAX_TABLE_LENGTH, REGISTERED_MAX_CAPACITY, SMALL_CHUNK_MAX_CHAIN_LENGTH,
};
use crate::memory::size_class::CHAIN_INCREMENT;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Capacity bounds of a [`HandleAllocator`](crate::HandleAllocator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum number of slab buffers per chunk size
    pub small_chunk_max_chain_length: usize,
    /// Maximum number of simultaneous big chunks
    pub big_chunk_max_table_length: usize,
    /// Initial registry capacity, rounded up to a power of two
    pub registry_initial_capacity: usize,
    /// Maximum registry capacity, a power of two
    pub registry_max_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            small_chunk_max_chain_length: SMALL_CHUNK_MAX_CHAIN_LENGTH,
            big_chunk_max_table_length: BIG_CHUNK_MAX_TABLE_LENGTH,
            registry_initial_capacity: 1,
            registry_max_capacity: REGISTERED_MAX_CAPACITY,
        }
    }
}

impl MemoryConfig {
    /// Load configuration from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let loaded: MemoryConfig = builder
            .add_source(::config::Environment::with_prefix("HANDLEMEM").try_parsing(true))
            .build()?
            .try_deserialize()?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject bounds the handle layout cannot address
    pub fn validate(&self) -> Result<()> {
        if self.small_chunk_max_chain_length < CHAIN_INCREMENT
            || self.small_chunk_max_chain_length > SMALL_CHUNK_MAX_CHAIN_LENGTH
        {
            return Err(Error::Config(format!(
                "small_chunk_max_chain_length must be within {}..={}, got {}",
                CHAIN_INCREMENT, SMALL_CHUNK_MAX_CHAIN_LENGTH, self.small_chunk_max_chain_length
            )));
        }
        if self.big_chunk_max_table_length == 0
            || self.big_chunk_max_table_length > BIG_CHUNK_MAX_TABLE_LENGTH
        {
            return Err(Error::Config(format!(
                "big_chunk_max_table_length must be within 1..={}, got {}",
                BIG_CHUNK_MAX_TABLE_LENGTH, self.big_chunk_max_table_length
            )));
        }
        if !self.registry_max_capacity.is_power_of_two()
            || self.registry_max_capacity > REGISTERED_MAX_CAPACITY
        {
            return Err(Error::Config(format!(
                "registry_max_capacity must be a power of two up to {}, got {}",
                REGISTERED_MAX_CAPACITY, self.registry_max_capacity
            )));
        }
        if self.registry_initial_capacity == 0
            || self.registry_initial_capacity > self.registry_max_capacity
        {
            return Err(Error::Config(format!(
                "registry_initial_capacity must be within 1..={}, got {}",
                self.registry_max_capacity, self.registry_initial_capacity
            )));
        }

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        MemoryConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let config = MemoryConfig {
            registry_max_capacity: 6,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = MemoryConfig {
            small_chunk_max_chain_length: SMALL_CHUNK_MAX_CHAIN_LENGTH + 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = MemoryConfig {
            registry_initial_capacity: 8,
            registry_max_capacity: 4,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("handlemem_config_{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "big_chunk_max_table_length = 128").unwrap();
        writeln!(file, "registry_max_capacity = 1024").unwrap();
        drop(file);

        let config = MemoryConfig::load(Some(&path)).unwrap();
        assert_eq!(config.big_chunk_max_table_length, 128);
        assert_eq!(config.registry_max_capacity, 1024);
        assert_eq!(config.small_chunk_max_chain_length, SMALL_CHUNK_MAX_CHAIN_LENGTH);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_toml_round_trip() {
        let config = MemoryConfig {
            registry_max_capacity: 64,
            ..Default::default()
        };
        let text = config.to_toml().unwrap();
        let parsed: MemoryConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
