/// NPM SKU table and element types shared by the driver and the emulator.
use std::io;

/// Device SKU variants
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sku {
  Npm4k = 0,
  Npm8k = 1,
  Npm16k = 2,
  Npm32k = 3,
  Npm64k = 4,
  Mock = 5,
  Emulator = 6,
}

impl Sku {
  pub fn from_u32(value: u32) -> Option<Self> {
    match value {
      0 => Some(Sku::Npm4k),
      1 => Some(Sku::Npm8k),
      2 => Some(Sku::Npm16k),
      3 => Some(Sku::Npm32k),
      4 => Some(Sku::Npm64k),
      5 => Some(Sku::Mock),
      6 => Some(Sku::Emulator),
      _ => None,
    }
  }

  /// Parse a SKU name, accepting both "NPM8K" and bare "8K"/"8" forms
  pub fn parse(s: &str) -> io::Result<Self> {
    let lower = s.trim().to_lowercase();
    let digits = lower.strip_prefix("npm").unwrap_or(&lower);
    match digits.trim_end_matches('k') {
      "4" => Ok(Sku::Npm4k),
      "8" => Ok(Sku::Npm8k),
      "16" => Ok(Sku::Npm16k),
      "32" => Ok(Sku::Npm32k),
      "64" => Ok(Sku::Npm64k),
      _ => Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unknown SKU: {}", s),
      )),
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Sku::Npm4k => "NPM4K",
      Sku::Npm8k => "NPM8K",
      Sku::Npm16k => "NPM16K",
      Sku::Npm32k => "NPM32K",
      Sku::Npm64k => "NPM64K",
      Sku::Mock => "Mock",
      Sku::Emulator => "Emulator",
    }
  }
}

const MIB: usize = 1024 * 1024;

/// Per-SKU hardware parameters
#[derive(Debug, Clone, Copy)]
pub struct SkuConfig {
  pub sku: Sku,
  pub num_engines: usize,
  pub l1_size: usize,
  pub l2_size_default: usize,
  pub l2_size_min: usize,
  pub l2_size_max: usize,
  pub int4_macs: u64,
  pub int8_macs: u64,
  pub fp16_macs: u64,
}

const fn sku_row(sku: Sku, engines: usize, int4: u64, int8: u64, fp16: u64) -> SkuConfig {
  SkuConfig {
    sku,
    num_engines: engines,
    l1_size: MIB,
    l2_size_default: 8 * MIB,
    l2_size_min: MIB,
    l2_size_max: 32 * MIB,
    int4_macs: int4,
    int8_macs: int8,
    fp16_macs: fp16,
  }
}

pub const SKU_CONFIGS: [SkuConfig; 7] = [
  sku_row(Sku::Npm4k, 1, 16_000, 4_000, 2_000),
  sku_row(Sku::Npm8k, 1, 32_000, 8_000, 4_000),
  sku_row(Sku::Npm16k, 2, 64_000, 16_000, 8_000),
  sku_row(Sku::Npm32k, 4, 128_000, 32_000, 16_000),
  sku_row(Sku::Npm64k, 8, 256_000, 64_000, 32_000),
  sku_row(Sku::Mock, 1, 0, 0, 0),
  sku_row(Sku::Emulator, 1, 0, 0, 0),
];

pub fn sku_config(sku: Sku) -> &'static SkuConfig {
  &SKU_CONFIGS[sku as usize]
}

/// Tensor element types. The numeric values mirror the host tensor engine's
/// type tags so they pass through the wire protocol unchanged.
#[allow(non_camel_case_types)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
  F32 = 0,
  F16 = 1,
  Q4_0 = 2,
  Q4_1 = 3,
  Q5_0 = 6,
  Q5_1 = 7,
  Q8_0 = 8,
  Q8_1 = 9,
  Q2_K = 10,
  Q3_K = 11,
  Q4_K = 12,
  Q5_K = 13,
  Q6_K = 14,
  Q8_K = 15,
  BF16 = 30,
}

impl ElemType {
  pub fn from_u32(value: u32) -> Option<Self> {
    match value {
      0 => Some(ElemType::F32),
      1 => Some(ElemType::F16),
      2 => Some(ElemType::Q4_0),
      3 => Some(ElemType::Q4_1),
      6 => Some(ElemType::Q5_0),
      7 => Some(ElemType::Q5_1),
      8 => Some(ElemType::Q8_0),
      9 => Some(ElemType::Q8_1),
      10 => Some(ElemType::Q2_K),
      11 => Some(ElemType::Q3_K),
      12 => Some(ElemType::Q4_K),
      13 => Some(ElemType::Q5_K),
      14 => Some(ElemType::Q6_K),
      15 => Some(ElemType::Q8_K),
      30 => Some(ElemType::BF16),
      _ => None,
    }
  }

  pub fn is_quantized(&self) -> bool {
    !matches!(self, ElemType::F32 | ElemType::F16 | ElemType::BF16)
  }

  /// Elements per quantization block (1 for dense float types)
  pub fn block_size(&self) -> usize {
    match self {
      ElemType::F32 | ElemType::F16 | ElemType::BF16 => 1,
      ElemType::Q4_0
      | ElemType::Q4_1
      | ElemType::Q5_0
      | ElemType::Q5_1
      | ElemType::Q8_0
      | ElemType::Q8_1 => 32,
      ElemType::Q2_K
      | ElemType::Q3_K
      | ElemType::Q4_K
      | ElemType::Q5_K
      | ElemType::Q6_K
      | ElemType::Q8_K => 256,
    }
  }

  /// Bytes per quantization block (bytes per element for dense float types)
  pub fn type_size(&self) -> usize {
    match self {
      ElemType::F32 => 4,
      ElemType::F16 | ElemType::BF16 => 2,
      ElemType::Q4_0 => 18,
      ElemType::Q4_1 => 20,
      ElemType::Q5_0 => 22,
      ElemType::Q5_1 => 24,
      ElemType::Q8_0 => 34,
      ElemType::Q8_1 => 36,
      ElemType::Q2_K => 84,
      ElemType::Q3_K => 110,
      ElemType::Q4_K => 144,
      ElemType::Q5_K => 176,
      ElemType::Q6_K => 210,
      ElemType::Q8_K => 292,
    }
  }

  /// Bytes taken by `n` elements laid out in this type's wire format.
  /// A trailing partial block still occupies a whole block.
  pub fn row_size(&self, n: usize) -> usize {
    n.div_ceil(self.block_size()) * self.type_size()
  }
}
