//! Dequantisation support for quantised weight formats.
//!
//! The host tensor engine stores weights in block-quantised layouts; before
//! dispatching a matmul the backend expands them to dense FP32 through a
//! per-type function looked up in a [`DequantRegistry`]. The registry is an
//! injected capability table: the built-in set covers the formats this crate
//! decodes itself, and embedders may register more.

use crate::sku::ElemType;
use half::f16;
use std::collections::HashMap;

/// Expand `src` (block-quantised bytes) into `dst` dense FP32 values.
/// `dst.len()` selects the element count; `src` must hold at least
/// `row_size(dst.len())` bytes.
pub type DequantFn = fn(src: &[u8], dst: &mut [f32]);

pub struct DequantRegistry {
  fns: HashMap<ElemType, DequantFn>,
}

impl DequantRegistry {
  pub fn new() -> Self {
    Self { fns: HashMap::new() }
  }

  /// Registry pre-loaded with the built-in decoders
  pub fn with_builtin() -> Self {
    let mut registry = Self::new();
    registry.register(ElemType::Q4_0, dequantize_q4_0);
    registry.register(ElemType::Q8_0, dequantize_q8_0);
    registry.register(ElemType::Q4_K, dequantize_q4_k);
    registry
  }

  pub fn register(&mut self, elem_type: ElemType, f: DequantFn) {
    self.fns.insert(elem_type, f);
  }

  pub fn lookup(&self, elem_type: ElemType) -> Option<DequantFn> {
    self.fns.get(&elem_type).copied()
  }
}

impl Default for DequantRegistry {
  fn default() -> Self {
    Self::with_builtin()
  }
}

fn read_f16(bytes: &[u8]) -> f32 {
  f16::from_le_bytes([bytes[0], bytes[1]]).to_f32()
}

/// Q4_0: 32 elements per 18-byte block {d: f16, qs: [u8; 16]}.
/// Low nibbles hold elements 0..16, high nibbles 16..32, both biased by 8.
pub fn dequantize_q4_0(src: &[u8], dst: &mut [f32]) {
  const BLOCK: usize = 32;
  const BLOCK_BYTES: usize = 18;

  for (block_idx, out) in dst.chunks_mut(BLOCK).enumerate() {
    let base = block_idx * BLOCK_BYTES;
    let d = read_f16(&src[base..base + 2]);
    let qs = &src[base + 2..base + 18];

    for (i, &byte) in qs.iter().enumerate() {
      out[i] = ((byte & 0x0F) as i32 - 8) as f32 * d;
      out[i + 16] = ((byte >> 4) as i32 - 8) as f32 * d;
    }
  }
}

/// Q8_0: 32 elements per 34-byte block {d: f16, qs: [i8; 32]}
pub fn dequantize_q8_0(src: &[u8], dst: &mut [f32]) {
  const BLOCK: usize = 32;
  const BLOCK_BYTES: usize = 34;

  for (block_idx, out) in dst.chunks_mut(BLOCK).enumerate() {
    let base = block_idx * BLOCK_BYTES;
    let d = read_f16(&src[base..base + 2]);
    let qs = &src[base + 2..base + 34];

    for (i, &byte) in qs.iter().enumerate() {
      out[i] = (byte as i8) as f32 * d;
    }
  }
}

/// 6-bit scale/min pair for sub-block `is` of a k-quant super-block
fn extract_scale_min(scales: &[u8; 12], is: usize) -> (f32, f32) {
  if is < 4 {
    let sc = scales[is] & 63;
    let m = scales[is + 4] & 63;
    (sc as f32, m as f32)
  } else {
    let sc = (scales[is + 4] & 0x0F) | ((scales[is - 4] >> 6) << 4);
    let m = (scales[is + 4] >> 4) | ((scales[is] >> 6) << 4);
    (sc as f32, m as f32)
  }
}

/// Q4_K: 256 elements per 144-byte super-block
/// {d: f16, dmin: f16, scales: [u8; 12], qs: [u8; 128]}.
/// Eight 32-element sub-blocks with 6-bit scales/mins against d and dmin.
pub fn dequantize_q4_k(src: &[u8], dst: &mut [f32]) {
  const SUPER_BLOCK: usize = 256;
  const SUPER_BLOCK_BYTES: usize = 144;

  for (sb_idx, out) in dst.chunks_mut(SUPER_BLOCK).enumerate() {
    let base = sb_idx * SUPER_BLOCK_BYTES;
    let d = read_f16(&src[base..base + 2]);
    let dmin = read_f16(&src[base + 2..base + 4]);

    let mut scales = [0u8; 12];
    scales.copy_from_slice(&src[base + 4..base + 16]);

    let qs = &src[base + 16..base + 144];

    let mut ys = 0;
    for j in (0..SUPER_BLOCK).step_by(64) {
      let q = &qs[j / 2..j / 2 + 32];

      let is = j / 32;
      let (sc1, m1) = extract_scale_min(&scales, is);
      let d1 = d * sc1;
      let dm1 = dmin * m1;

      let (sc2, m2) = extract_scale_min(&scales, is + 1);
      let d2 = d * sc2;
      let dm2 = dmin * m2;

      for &byte in q {
        out[ys] = d1 * (byte & 0x0F) as f32 - dm1;
        ys += 1;
      }
      for &byte in q {
        out[ys] = d2 * (byte >> 4) as f32 - dm2;
        ys += 1;
      }
    }
  }
}

/// Quantize dense FP32 into Q8_0 blocks. Used to produce test vectors and by
/// embedders that need device-side weight round trips.
pub fn quantize_q8_0(src: &[f32]) -> Vec<u8> {
  const BLOCK: usize = 32;
  assert!(src.len() % BLOCK == 0, "Q8_0 input must be a multiple of 32 elements");

  let mut out = Vec::with_capacity(src.len() / BLOCK * 34);
  for chunk in src.chunks(BLOCK) {
    let amax = chunk.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()));
    let d = amax / 127.0;
    let inv_d = if d != 0.0 { 1.0 / d } else { 0.0 };

    out.extend_from_slice(&f16::from_f32(d).to_le_bytes());
    for &v in chunk {
      out.push((v * inv_d).round() as i8 as u8);
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn q8_0_round_trip_error_is_small() {
    let src: Vec<f32> = (0..64).map(|i| ((i * 37 % 100) as f32 - 50.0) / 100.0).collect();
    let quantized = quantize_q8_0(&src);
    assert_eq!(quantized.len(), 2 * 34);

    let mut restored = vec![0.0f32; 64];
    dequantize_q8_0(&quantized, &mut restored);

    for (a, b) in src.iter().zip(restored.iter()) {
      assert!((a - b).abs() < 0.01, "q8_0 error too large: {} vs {}", a, b);
    }
  }

  #[test]
  fn q8_0_zero_block() {
    let src = vec![0.0f32; 32];
    let quantized = quantize_q8_0(&src);
    let mut restored = vec![1.0f32; 32];
    dequantize_q8_0(&quantized, &mut restored);
    assert_eq!(restored, vec![0.0f32; 32]);
  }

  #[test]
  fn q4_0_nibble_layout() {
    // one block: d = 1.0, all quants = 0b0001_0010 -> low nibble 2, high 1
    let mut src = Vec::new();
    src.extend_from_slice(&f16::from_f32(1.0).to_le_bytes());
    src.extend_from_slice(&[0x12u8; 16]);

    let mut dst = vec![0.0f32; 32];
    dequantize_q4_0(&src, &mut dst);
    // biased by 8: low nibble 2 -> -6, high nibble 1 -> -7
    assert!(dst[..16].iter().all(|&v| v == -6.0));
    assert!(dst[16..].iter().all(|&v| v == -7.0));
  }

  #[test]
  fn q4_k_uniform_block() {
    // d = 1.0, dmin = 0.0, all 6-bit scales = 1, all quants = 5
    let mut src = vec![0u8; 144];
    src[0..2].copy_from_slice(&f16::from_f32(1.0).to_le_bytes());
    src[2..4].copy_from_slice(&f16::from_f32(0.0).to_le_bytes());
    for i in 0..4 {
      src[4 + i] = 1; // scales for sub-blocks 0..4
    }
    for i in 8..12 {
      src[4 + i] = 0x11; // packed scales for sub-blocks 4..8
    }
    for b in &mut src[16..144] {
      *b = 0x55;
    }

    let mut dst = vec![0.0f32; 256];
    dequantize_q4_k(&src, &mut dst);
    assert!(dst.iter().all(|&v| (v - 5.0).abs() < 1e-6), "got {:?}", &dst[..8]);
  }

  #[test]
  fn extract_scale_min_packing() {
    let mut scales = [0u8; 12];
    // sub-block 0: scale 13, min 7
    scales[0] = 13;
    scales[4] = 7;
    assert_eq!(extract_scale_min(&scales, 0), (13.0, 7.0));

    // sub-block 4: low 4 bits in scales[8], high 2 bits in scales[0]/[4] bits 6..8
    scales[0] = 13 | (0b10 << 6);
    scales[4] = 7 | (0b01 << 6);
    scales[8] = 0x3A; // low nibble 0xA = 10, high nibble 3
    let (sc, m) = extract_scale_min(&scales, 4);
    assert_eq!(sc, (10 | (0b10 << 4)) as f32);
    assert_eq!(m, (3 | (0b01 << 4)) as f32);
  }

  #[test]
  fn registry_lookup() {
    let registry = DequantRegistry::with_builtin();
    assert!(registry.lookup(ElemType::Q8_0).is_some());
    assert!(registry.lookup(ElemType::Q4_K).is_some());
    assert!(registry.lookup(ElemType::Q6_K).is_none());
    assert!(registry.lookup(ElemType::F32).is_none());

    let mut registry = DequantRegistry::new();
    assert!(registry.lookup(ElemType::Q8_0).is_none());
    registry.register(ElemType::Q8_0, dequantize_q8_0);
    assert!(registry.lookup(ElemType::Q8_0).is_some());
  }
}
