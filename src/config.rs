//! Emulator configuration.
//!
//! Settings come from three layers: built-in defaults, an optional config
//! file, and command-line overrides (strongest). Config files are `key=value`
//! lines with `#` comments; boolean keys accept `true`/`yes`/`1`/`on` for
//! compatibility with existing emulator configs.

use crate::dma_model::DmaConfig;
use crate::sku::{sku_config, Sku};
use crate::trace::{TRACE_COMMANDS, TRACE_DMA, TRACE_NONE, TRACE_OPS};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::io;
use std::path::Path;

const MIB: usize = 1024 * 1024;

fn default_sku() -> String {
  "NPM8K".to_string()
}

fn default_socket() -> String {
  crate::protocol::NPM_EMU_DEFAULT_SOCKET.to_string()
}

fn default_system_bw() -> f64 {
  50.0
}

fn default_l1_bw() -> f64 {
  100.0
}

fn default_clock() -> u64 {
  1000
}

/// Accept `true`/`false`, `yes`/`no`, `on`/`off`, `1`/`0` for boolean keys
fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
  #[derive(Deserialize)]
  #[serde(untagged)]
  enum Flag {
    Bool(bool),
    Int(i64),
    Str(String),
  }

  match Flag::deserialize(deserializer)? {
    Flag::Bool(b) => Ok(b),
    Flag::Int(i) => Ok(i != 0),
    Flag::Str(s) => match s.trim().to_lowercase().as_str() {
      "true" | "yes" | "1" | "on" => Ok(true),
      "false" | "no" | "0" | "off" => Ok(false),
      other => Err(serde::de::Error::custom(format!("invalid boolean: {}", other))),
    },
  }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmuConfig {
  #[serde(default = "default_sku")]
  pub sku: String,

  /// L2 cache size in MB; 0 means the SKU default
  #[serde(default)]
  pub l2_size_mb: u64,

  #[serde(default, deserialize_with = "de_flag")]
  pub tiling: bool,

  #[serde(default, deserialize_with = "de_flag")]
  pub timing: bool,

  #[serde(default, deserialize_with = "de_flag")]
  pub verbose: bool,

  #[serde(default = "default_socket")]
  pub socket: String,

  #[serde(default = "default_system_bw")]
  pub dma_system_bw_gbps: f64,

  #[serde(default = "default_l1_bw")]
  pub dma_l1_bw_gbps: f64,

  #[serde(default = "default_clock")]
  pub clock_freq_mhz: u64,

  #[serde(default, deserialize_with = "de_flag")]
  pub trace_commands: bool,

  #[serde(default, deserialize_with = "de_flag")]
  pub trace_dma: bool,

  #[serde(default, deserialize_with = "de_flag")]
  pub trace_ops: bool,

  /// Trace output file; empty means stdout
  #[serde(default)]
  pub trace_file: String,
}

impl Default for EmuConfig {
  fn default() -> Self {
    Self {
      sku: default_sku(),
      l2_size_mb: 0,
      tiling: false,
      timing: false,
      verbose: false,
      socket: default_socket(),
      dma_system_bw_gbps: default_system_bw(),
      dma_l1_bw_gbps: default_l1_bw(),
      clock_freq_mhz: default_clock(),
      trace_commands: false,
      trace_dma: false,
      trace_ops: false,
      trace_file: String::new(),
    }
  }
}

impl EmuConfig {
  pub fn resolved_sku(&self) -> io::Result<Sku> {
    Sku::parse(&self.sku)
  }

  /// L2 size in bytes: the file/CLI override when set, else the SKU default
  pub fn resolved_l2_size(&self, sku: Sku) -> usize {
    if self.l2_size_mb > 0 {
      self.l2_size_mb as usize * MIB
    } else {
      sku_config(sku).l2_size_default
    }
  }

  pub fn trace_categories(&self) -> u32 {
    let mut categories = TRACE_NONE;
    if self.trace_commands {
      categories |= TRACE_COMMANDS;
    }
    if self.trace_dma {
      categories |= TRACE_DMA;
    }
    if self.trace_ops {
      categories |= TRACE_OPS;
    }
    categories
  }

  pub fn dma_config(&self) -> DmaConfig {
    DmaConfig {
      system_bw_gbps: self.dma_system_bw_gbps,
      l1_bw_gbps: self.dma_l1_bw_gbps,
      clock_freq_mhz: self.clock_freq_mhz,
    }
  }
}

/// Load configuration from the given file
pub fn load_config_file(path: &Path) -> io::Result<EmuConfig> {
  let content = fs::read_to_string(path).map_err(|e| {
    io::Error::new(
      io::ErrorKind::NotFound,
      format!("failed to read config file {:?}: {}", path, e),
    )
  })?;

  toml::from_str::<EmuConfig>(&content).map_err(|e| {
    io::Error::new(
      io::ErrorKind::InvalidData,
      format!("failed to parse config file {:?}: {}", path, e),
    )
  })
}

/// Apply CLI parameter overrides to configuration.
/// Command line wins over the config file for every key it names.
#[allow(clippy::too_many_arguments)]
pub fn apply_cli_overrides(
  config: &mut EmuConfig,
  socket: Option<&str>,
  sku: Option<&str>,
  l2_size_mb: Option<u64>,
  tiling: bool,
  timing: bool,
  verbose: bool,
  trace_commands: bool,
  trace_dma: bool,
  trace_ops: bool,
  trace_all: bool,
  trace_file: Option<&str>,
) {
  if let Some(socket) = socket {
    config.socket = socket.to_string();
  }
  if let Some(sku) = sku {
    config.sku = sku.to_string();
  }
  if let Some(l2) = l2_size_mb {
    config.l2_size_mb = l2;
  }
  if tiling {
    config.tiling = true;
  }
  if timing {
    config.timing = true;
  }
  if verbose {
    config.verbose = true;
  }
  if trace_commands || trace_all {
    config.trace_commands = true;
  }
  if trace_dma || trace_all {
    config.trace_dma = true;
  }
  if trace_ops || trace_all {
    config.trace_ops = true;
  }
  if let Some(trace_file) = trace_file {
    config.trace_file = trace_file.to_string();
  }
}

/// Validate configuration before the server starts
pub fn validate_config(config: &EmuConfig) -> io::Result<()> {
  let sku = config.resolved_sku()?;
  let sku_cfg = sku_config(sku);

  if config.l2_size_mb > 0 {
    let l2_bytes = config.l2_size_mb as usize * MIB;
    if l2_bytes < sku_cfg.l2_size_min || l2_bytes > sku_cfg.l2_size_max {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
          "l2_size_mb={} out of range for {} ({}..{} MB)",
          config.l2_size_mb,
          sku.name(),
          sku_cfg.l2_size_min / MIB,
          sku_cfg.l2_size_max / MIB
        ),
      ));
    }
  }

  if config.dma_system_bw_gbps <= 0.0 || config.dma_l1_bw_gbps <= 0.0 {
    return Err(io::Error::new(
      io::ErrorKind::InvalidData,
      "DMA bandwidths must be positive",
    ));
  }

  if config.clock_freq_mhz == 0 {
    return Err(io::Error::new(
      io::ErrorKind::InvalidData,
      "clock_freq_mhz must be positive",
    ));
  }

  if config.socket.trim().is_empty() {
    return Err(io::Error::new(io::ErrorKind::InvalidData, "socket path cannot be empty"));
  }

  Ok(())
}

/// Load and merge configuration: defaults, then the optional file, then CLI
#[allow(clippy::too_many_arguments)]
pub fn load_configs(
  config_path: Option<&Path>,
  socket: Option<&str>,
  sku: Option<&str>,
  l2_size_mb: Option<u64>,
  tiling: bool,
  timing: bool,
  verbose: bool,
  trace_commands: bool,
  trace_dma: bool,
  trace_ops: bool,
  trace_all: bool,
  trace_file: Option<&str>,
) -> io::Result<EmuConfig> {
  let mut config = match config_path {
    Some(path) => load_config_file(path)?,
    None => EmuConfig::default(),
  };

  apply_cli_overrides(
    &mut config,
    socket,
    sku,
    l2_size_mb,
    tiling,
    timing,
    verbose,
    trace_commands,
    trace_dma,
    trace_ops,
    trace_all,
    trace_file,
  );

  validate_config(&config)?;

  Ok(config)
}
