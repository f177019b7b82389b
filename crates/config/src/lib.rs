// DLPatch - Preloader Download Handler Patcher
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use anyhow::{Context, Result};
use dlpatch_core::Platform;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default schema version for YAML profiles
fn default_schema_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unsupported schema_version '{0}'. Supported versions: '1.0'")]
    UnsupportedSchema(String),
    #[error("Invalid size format '{0}'")]
    InvalidSize(String),
    #[error("Code region is empty")]
    EmptyRange,
    #[error("Code region {base:#x}+{size:#x} overflows the 32-bit address space")]
    RangeOverflow { base: u64, size: u64 },
    #[error("'{field}' = {value:#x} is not halfword aligned")]
    Misaligned { field: &'static str, value: u32 },
    #[error("Cache line size {0} is not a power of two of at least 4 bytes")]
    BadCacheLine(u32),
}

/// Code region scanned for signatures.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CodeRange {
    pub base: u32,
    pub size: String, // e.g. "1MiB"
}

/// A device family described in YAML.
///
/// Only `name` and `code` are required. Every other field falls back to the
/// MT6572 value.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PlatformProfile {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub name: String,
    pub code: CodeRange,
    #[serde(default)]
    pub handler_window: Option<u32>,
    #[serde(default)]
    pub boot_arg_cell: Option<u32>,
    #[serde(default)]
    pub handler_arg: Option<u32>,
    #[serde(default)]
    pub boot_flag: Option<u32>,
    #[serde(default)]
    pub uart_base: Option<u32>,
    #[serde(default)]
    pub cache_line: Option<u32>,
}

impl PlatformProfile {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read platform profile at {:?}", path))?;
        let profile: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse platform profile YAML {:?}", path))?;
        tracing::debug!("Loaded platform profile '{}' from {:?}", profile.name, path);
        Ok(profile)
    }

    /// Validates the profile and resolves it into a [`Platform`].
    pub fn to_platform(&self) -> Result<Platform, ConfigError> {
        if self.schema_version != "1.0" {
            return Err(ConfigError::UnsupportedSchema(self.schema_version.clone()));
        }

        let size = parse_size(&self.code.size)?;
        if size == 0 {
            return Err(ConfigError::EmptyRange);
        }
        let base = self.code.base;
        let end = base as u64 + size;
        if end > u32::MAX as u64 {
            return Err(ConfigError::RangeOverflow {
                base: base as u64,
                size,
            });
        }

        let defaults = Platform::MT6572;
        let platform = Platform {
            code_base: base,
            code_end: end as u32,
            handler_window: self.handler_window.unwrap_or(defaults.handler_window),
            boot_arg_cell: self.boot_arg_cell.unwrap_or(defaults.boot_arg_cell),
            handler_arg: self.handler_arg.unwrap_or(defaults.handler_arg),
            boot_flag: self.boot_flag.unwrap_or(defaults.boot_flag),
            uart_base: self.uart_base.unwrap_or(defaults.uart_base),
            cache_line: self.cache_line.unwrap_or(defaults.cache_line),
        };

        for (field, value) in [
            ("code.base", platform.code_base),
            ("code.size", platform.code_end - platform.code_base),
            ("handler_window", platform.handler_window),
            ("boot_arg_cell", platform.boot_arg_cell),
        ] {
            if value & 1 != 0 {
                return Err(ConfigError::Misaligned { field, value });
            }
        }

        if platform.cache_line < 4 || !platform.cache_line.is_power_of_two() {
            return Err(ConfigError::BadCacheLine(platform.cache_line));
        }

        Ok(platform)
    }
}

/// Loads a profile file and resolves it in one step.
pub fn load_platform<P: AsRef<Path>>(path: P) -> Result<Platform> {
    let path = path.as_ref();
    let profile = PlatformProfile::from_file(path)?;
    profile
        .to_platform()
        .with_context(|| format!("Invalid platform profile '{}'", profile.name))
}

/// Parses "1MiB", "64KiB" or "1MB" style sizes into bytes.
///
/// A bare number is taken as a byte count.
pub fn parse_size(size_str: &str) -> Result<u64, ConfigError> {
    use human_size::{Byte, Size, SpecificSize};

    let trimmed = size_str.trim();
    if let Ok(bytes) = trimmed.parse::<u64>() {
        return Ok(bytes);
    }
    let s: Size = trimmed
        .parse()
        .map_err(|_| ConfigError::InvalidSize(size_str.to_string()))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}
