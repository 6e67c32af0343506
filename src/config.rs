//! Runtime configuration.
//!
//! Configuration is set programmatically through [`RuntimeConfig::builder`]
//! or loaded from the environment with [`RuntimeConfig::from_env`].
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `WASM_SHIM_INITIAL_PAGES` | Pages of linear memory at start | 2 |
//! | `WASM_SHIM_MAX_PAGES` | Upper bound on linear memory pages | 65536 |
//! | `WASM_SHIM_CONTROL_BLOCK` | Address of the unwind control block | 16 |
//! | `WASM_SHIM_UNWIND_STACK_END` | End of the unwind-data area | 1024 |
//! | `WASM_SHIM_BUFSIZ` | Stream write buffer size in bytes | 8192 |
//! | `WASM_SHIM_READ_CHUNK` | Bytes per backend read | 4096 |
//! | `WASM_SHIM_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust
//! use wasm_shim::config::{Access, RuntimeConfig};
//!
//! let config = RuntimeConfig::builder()
//!   .max_pages(256)
//!   .buffer_size(1024)
//!   .mount("/assets", Access::READ_ONLY)
//!   .build()
//!   .unwrap();
//!
//! assert_eq!(config.mounts.len(), 2);
//! ```

use std::env;

use tracing_subscriber::filter::LevelFilter;

use crate::error::ConfigError;
pub use crate::stdio::Access;

/// Largest page count a 32-bit memory can have.
pub const MAX_PAGES: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
  Off,
  Error,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

impl LogLevel {
  pub fn parse(s: &str) -> Option<Self> {
    match s.to_lowercase().as_str() {
      "off" | "none" | "0" => Some(LogLevel::Off),
      "error" | "err" | "1" => Some(LogLevel::Error),
      "warn" | "warning" | "2" => Some(LogLevel::Warn),
      "info" | "3" => Some(LogLevel::Info),
      "debug" | "4" => Some(LogLevel::Debug),
      "trace" | "5" => Some(LogLevel::Trace),
      _ => None,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      LogLevel::Off => "off",
      LogLevel::Error => "error",
      LogLevel::Warn => "warn",
      LogLevel::Info => "info",
      LogLevel::Debug => "debug",
      LogLevel::Trace => "trace",
    }
  }

  pub fn filter(&self) -> LevelFilter {
    match self {
      LogLevel::Off => LevelFilter::OFF,
      LogLevel::Error => LevelFilter::ERROR,
      LogLevel::Warn => LevelFilter::WARN,
      LogLevel::Info => LevelFilter::INFO,
      LogLevel::Debug => LevelFilter::DEBUG,
      LogLevel::Trace => LevelFilter::TRACE,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
  /// Pages the memory starts with.
  /// Default: 2.
  pub initial_pages: u32,

  /// Growth never goes past this many pages.
  /// Default: 65536 (4 GiB).
  pub max_pages: u32,
}

impl Default for MemoryConfig {
  fn default() -> Self {
    Self {
      initial_pages: 2,
      max_pages: MAX_PAGES,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendConfig {
  /// Address of the 8-byte control block.
  /// Default: 16.
  pub control_block: u32,

  /// End of the unwind-data area that follows the control block.
  /// Default: 1024.
  pub stack_end: u32,
}

impl Default for SuspendConfig {
  fn default() -> Self {
    Self {
      control_block: 16,
      stack_end: 1024,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioConfig {
  /// Bytes a stream buffers before a write reaches its backend.
  /// Default: 8192 (`BUFSIZ`).
  pub buffer_size: usize,

  /// Bytes the default backend returns per read.
  /// Default: 4096.
  pub read_chunk: usize,
}

impl Default for StdioConfig {
  fn default() -> Self {
    Self {
      buffer_size: crate::stdio::BUFSIZ,
      read_chunk: 4096,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
  pub level: LogLevel,
}

/// A mount created when the runtime starts, served by an in-memory store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
  pub path: String,
  pub access: Access,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
  pub memory: MemoryConfig,
  pub suspend: SuspendConfig,
  pub stdio: StdioConfig,
  pub log: LogConfig,
  pub mounts: Vec<MountConfig>,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      memory: MemoryConfig::default(),
      suspend: SuspendConfig::default(),
      stdio: StdioConfig::default(),
      log: LogConfig::default(),
      mounts: vec![MountConfig {
        path: "/".into(),
        access: Access::READ_WRITE,
      }],
    }
  }
}

impl RuntimeConfig {
  pub fn builder() -> RuntimeConfigBuilder {
    RuntimeConfigBuilder::new()
  }

  /// Loads configuration from `WASM_SHIM_*` environment variables.
  ///
  /// Unset variables keep their defaults. Values that would make the
  /// configuration invalid are ignored; values that do not parse are
  /// ignored with a warning.
  pub fn from_env() -> Self {
    Self::from_lookup(|name| env::var(name).ok())
  }

  /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let mut config = Self::default();

    let number = |name: &str| -> Option<u64> {
      let raw = lookup(name)?;
      match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(err) => {
          tracing::warn!(var = name, value = %raw, error = %err, "ignoring unparsable variable");
          None
        }
      }
    };

    if let Some(val) = number("WASM_SHIM_MAX_PAGES").and_then(|v| u32::try_from(v).ok())
      && (1..=MAX_PAGES).contains(&val)
    {
      config.memory.max_pages = val;
    }

    if let Some(val) = number("WASM_SHIM_INITIAL_PAGES").and_then(|v| u32::try_from(v).ok())
      && val <= config.memory.max_pages
    {
      config.memory.initial_pages = val;
    }

    if let Some(val) = number("WASM_SHIM_CONTROL_BLOCK").and_then(|v| u32::try_from(v).ok())
      && val > 0
      && val % 4 == 0
    {
      config.suspend.control_block = val;
    }

    if let Some(val) = number("WASM_SHIM_UNWIND_STACK_END").and_then(|v| u32::try_from(v).ok())
      && val > config.suspend.control_block + 8
    {
      config.suspend.stack_end = val;
    }

    if let Some(val) = number("WASM_SHIM_BUFSIZ")
      && val > 0
    {
      config.stdio.buffer_size = val as usize;
    }

    if let Some(val) = number("WASM_SHIM_READ_CHUNK")
      && val > 0
    {
      config.stdio.read_chunk = val as usize;
    }

    if let Some(level) = lookup("WASM_SHIM_LOG_LEVEL").as_deref().and_then(LogLevel::parse) {
      config.log.level = level;
    }

    config
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let invalid = |field: &str, message: &str| ConfigError::InvalidValue {
      field: field.into(),
      message: message.into(),
    };

    if self.memory.max_pages == 0 || self.memory.max_pages > MAX_PAGES {
      return Err(invalid("memory.max_pages", "must be between 1 and 65536"));
    }

    if self.memory.initial_pages > self.memory.max_pages {
      return Err(invalid("memory.initial_pages", "must not exceed max_pages"));
    }

    if self.suspend.control_block == 0 || self.suspend.control_block % 4 != 0 {
      return Err(invalid(
        "suspend.control_block",
        "must be a non-zero multiple of 4",
      ));
    }

    if self.suspend.stack_end <= self.suspend.control_block.saturating_add(8) {
      return Err(invalid(
        "suspend.stack_end",
        "must leave room for unwind data after the control block",
      ));
    }

    if self.stdio.buffer_size == 0 {
      return Err(invalid("stdio.buffer_size", "must be at least 1"));
    }

    if self.stdio.read_chunk == 0 {
      return Err(invalid("stdio.read_chunk", "must be at least 1"));
    }

    for (i, mount) in self.mounts.iter().enumerate() {
      if !mount.path.starts_with('/') {
        return Err(invalid("mounts", "mount paths must be absolute"));
      }
      if self.mounts[..i].iter().any(|other| other.path == mount.path) {
        return Err(invalid("mounts", "duplicate mount path"));
      }
    }

    Ok(())
  }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
  config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn initial_pages(
    mut self,
    pages: u32,
  ) -> Self {
    self.config.memory.initial_pages = pages;
    self
  }

  pub fn max_pages(
    mut self,
    pages: u32,
  ) -> Self {
    self.config.memory.max_pages = pages;
    self
  }

  pub fn control_block(
    mut self,
    address: u32,
  ) -> Self {
    self.config.suspend.control_block = address;
    self
  }

  pub fn stack_end(
    mut self,
    address: u32,
  ) -> Self {
    self.config.suspend.stack_end = address;
    self
  }

  pub fn buffer_size(
    mut self,
    size: usize,
  ) -> Self {
    self.config.stdio.buffer_size = size;
    self
  }

  pub fn read_chunk(
    mut self,
    size: usize,
  ) -> Self {
    self.config.stdio.read_chunk = size;
    self
  }

  pub fn log_level(
    mut self,
    level: LogLevel,
  ) -> Self {
    self.config.log.level = level;
    self
  }

  /// Adds an in-memory mount at `path`.
  pub fn mount(
    mut self,
    path: &str,
    access: Access,
  ) -> Self {
    self.config.mounts.push(MountConfig {
      path: path.into(),
      access,
    });
    self
  }

  /// Drops every mount, including the default `/`.
  pub fn clear_mounts(mut self) -> Self {
    self.config.mounts.clear();
    self
  }

  pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
    self.config.validate()?;
    Ok(self.config)
  }

  pub fn build_unchecked(self) -> RuntimeConfig {
    self.config
  }
}
