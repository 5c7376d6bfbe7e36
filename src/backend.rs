//! Graph-node dispatcher.
//!
//! Bridges the host tensor engine to an NPM device: decides per node whether
//! the device can run it, registers tensor buffers lazily, dequantises
//! quantised weights into a reusable FP32 scratch buffer, and issues one
//! device matmul per batch element.
//!
//! The handle cache is keyed by the tensor's raw data pointer, so pointer
//! identity stands in for value identity: the host allocator must not hand
//! the same address to a different tensor across unregister/register without
//! this dispatcher seeing it. Growing a buffer is handled by
//! unregister-then-register; silent pointer reuse is not detected.

use crate::device::{MatmulParams, NpmDevice};
use crate::quantize::DequantRegistry;
use crate::sku::ElemType;
use log::{info, warn};
use std::collections::HashMap;
use std::env;
use std::io;
use std::sync::OnceLock;

/// Host tensor view. `ne` counts elements per dimension, `nb` is the byte
/// stride per dimension (`nb[0]` strides blocks for quantised layouts).
#[derive(Debug, Clone, Copy)]
pub struct TensorDesc {
  pub elem_type: ElemType,
  pub ne: [i64; 4],
  pub nb: [usize; 4],
  pub data: *mut u8,
}

impl TensorDesc {
  /// A dense tensor with standard strides
  pub fn contiguous(elem_type: ElemType, ne: [i64; 4], data: *mut u8) -> Self {
    let row = elem_type.row_size(ne[0] as usize);
    let nb = [
      elem_type.type_size(),
      row,
      row * ne[1] as usize,
      row * ne[1] as usize * ne[2] as usize,
    ];
    Self { elem_type, ne, nb, data }
  }

  pub fn nelements(&self) -> i64 {
    self.ne.iter().product()
  }

  pub fn nbytes(&self) -> usize {
    self.elem_type.row_size(self.ne[0] as usize)
      * self.ne[1] as usize
      * self.ne[2] as usize
      * self.ne[3] as usize
  }

  pub fn is_contiguous(&self) -> bool {
    let row = self.elem_type.row_size(self.ne[0] as usize);
    self.nb[0] == self.elem_type.type_size()
      && self.nb[1] == row
      && self.nb[2] == self.nb[1] * self.ne[1] as usize
      && self.nb[3] == self.nb[2] * self.ne[2] as usize
  }
}

/// Matmul node: `output = input * weights^T` in row-major terms.
/// Shapes follow the host engine: weights (K, N, ...), input (K, M, ...),
/// output (N, M, ...).
#[derive(Debug, Clone, Copy)]
pub struct MatmulNode {
  pub weights: TensorDesc,
  pub input: TensorDesc,
  pub output: TensorDesc,
}

#[derive(Debug, Clone, Copy)]
pub enum GraphNode {
  Noop,
  Reshape,
  View,
  Permute,
  Transpose,
  MulMat(MatmulNode),
}

/// `NPM_LOG_CPU_FALLBACK` logs why a node was left to the CPU
fn log_cpu_fallback() -> bool {
  static FLAG: OnceLock<bool> = OnceLock::new();
  *FLAG.get_or_init(|| {
    matches!(env::var("NPM_LOG_CPU_FALLBACK").as_deref(), Ok("1") | Ok("true"))
  })
}

/// Minimum K-dimension divisor for quantised weight types
fn alignment_block(elem_type: ElemType) -> i64 {
  match elem_type {
    ElemType::F32 | ElemType::F16 | ElemType::BF16 => 1,
    other => other.block_size() as i64,
  }
}

pub struct NpmBackend {
  dev: Box<dyn NpmDevice>,
  dequant: DequantRegistry,

  // tensor data ptr -> (handle, registered size)
  buffer_handles: HashMap<usize, (u64, usize)>,

  // FP32 scratch for dequantised weights, reused across calls
  dequant_buffer: Vec<f32>,
  dequant_handle: u64,
  dequant_handle_size: usize,

  min_batch: i64,
}

impl NpmBackend {
  pub fn new(dev: Box<dyn NpmDevice>, dequant: DequantRegistry) -> Self {
    Self {
      dev,
      dequant,
      buffer_handles: HashMap::new(),
      dequant_buffer: Vec::new(),
      dequant_handle: 0,
      dequant_handle_size: 0,
      min_batch: 1,
    }
  }

  /// Require all three matmul leading dimensions to reach `min_batch`
  pub fn with_min_batch(mut self, min_batch: i64) -> Self {
    self.min_batch = min_batch;
    self
  }

  pub fn device(&self) -> &dyn NpmDevice {
    self.dev.as_ref()
  }

  /// Whether this backend can execute `node`; false reroutes it to the CPU
  pub fn supports_op(&self, node: &GraphNode) -> bool {
    let mm = match node {
      GraphNode::Noop
      | GraphNode::Reshape
      | GraphNode::View
      | GraphNode::Permute
      | GraphNode::Transpose => return true,
      GraphNode::MulMat(mm) => mm,
    };

    let weights = &mm.weights;
    let input = &mm.input;
    let k = weights.ne[0];

    let contiguous_ok = weights.is_contiguous() && input.is_contiguous();

    // weights: FP32, or a quantised type we can expand to FP32
    let weights_type_ok = weights.elem_type == ElemType::F32
      || (weights.elem_type.is_quantized() && self.dequant.lookup(weights.elem_type).is_some());
    // activations and output: FP32 only
    let type_ok = weights_type_ok
      && input.elem_type == ElemType::F32
      && mm.output.elem_type == ElemType::F32;

    // quantised weights need K divisible by the block size
    let alignment_ok = k % alignment_block(weights.elem_type) == 0;

    let size_ok = mm.output.ne[0] >= self.min_batch
      && mm.output.ne[1] >= self.min_batch
      && input.ne[0] >= self.min_batch;

    let supported = contiguous_ok && type_ok && alignment_ok && size_ok;
    if !supported && log_cpu_fallback() {
      info!(
        "[NPM->CPU] MUL_MAT fallback: contiguous={}, types=({:?},{:?}), K={}, alignment={}, size={}",
        contiguous_ok, weights.elem_type, input.elem_type, k, alignment_ok, size_ok
      );
    }
    supported
  }

  fn buffer_handle(&mut self, ptr: *mut u8, size: usize, update_data: bool) -> io::Result<u64> {
    if let Some(&(handle, _)) = self.buffer_handles.get(&(ptr as usize)) {
      if update_data {
        if let Err(e) = self.dev.update_buffer(handle, ptr, size) {
          warn!("update_buffer failed for cached handle {}: {}", handle, e);
        }
      }
      return Ok(handle);
    }

    let handle = self.dev.register_buffer(ptr, size)?;
    self.buffer_handles.insert(ptr as usize, (handle, size));
    Ok(handle)
  }

  /// Handle for the dequant scratch buffer. The placement is reused while it
  /// is large enough and re-registered (grow) otherwise, so the shared-memory
  /// bump allocator is not exhausted by repeated matmuls.
  fn dequant_handle_for(&mut self, ptr: *mut u8, size: usize) -> io::Result<u64> {
    if self.dequant_handle != 0 && self.dequant_handle_size >= size {
      if self.dev.update_buffer(self.dequant_handle, ptr, size).is_ok() {
        return Ok(self.dequant_handle);
      }
    }

    if self.dequant_handle != 0 {
      self.dev.unregister_buffer(self.dequant_handle);
      self.dequant_handle = 0;
      self.dequant_handle_size = 0;
    }

    let handle = self.dev.register_buffer(ptr, size)?;
    self.dequant_handle = handle;
    self.dequant_handle_size = size;
    Ok(handle)
  }

  fn mul_mat(&mut self, mm: &MatmulNode) -> io::Result<()> {
    let weights = mm.weights;
    let input = mm.input;
    let output = mm.output;

    let [ne00, ne01, ne02, ne03] = weights.ne;
    let [ne10, ne11, ne12, ne13] = input.ne;
    let [ne0, ne1, _, _] = output.ne;

    let invalid = |msg: &str| io::Error::new(io::ErrorKind::InvalidInput, msg.to_string());

    if ne0 != ne01 || ne1 != ne11 || ne00 != ne10 {
      return Err(invalid("matmul shape mismatch"));
    }
    if input.elem_type != ElemType::F32 || output.elem_type != ElemType::F32 {
      return Err(invalid("activations and output must be FP32"));
    }
    if ne02 <= 0 || ne03 <= 0 {
      return Err(invalid("weight batch dimensions must be positive"));
    }

    // expand quantised weights into the FP32 scratch buffer
    let dequantized = weights.elem_type != ElemType::F32;
    let n_elements = weights.nelements() as usize;
    if dequantized {
      let to_float = self
        .dequant
        .lookup(weights.elem_type)
        .ok_or_else(|| invalid("no dequantise function for weight type"))?;
      if self.dequant_buffer.len() < n_elements {
        self.dequant_buffer.resize(n_elements, 0.0);
      }
      let src = unsafe { std::slice::from_raw_parts(weights.data, weights.nbytes()) };
      to_float(src, &mut self.dequant_buffer[..n_elements]);
    }

    // register (or refresh) the three buffers. Activations change between
    // inference steps, so their shared-memory copy is updated every call.
    let handle_a = self.buffer_handle(input.data, input.nbytes(), true)?;
    let handle_b = if dequantized {
      let ptr = self.dequant_buffer.as_mut_ptr() as *mut u8;
      self.dequant_handle_for(ptr, n_elements * 4)?
    } else {
      self.buffer_handle(weights.data, weights.nbytes(), false)?
    };
    let handle_c = self.buffer_handle(output.data, output.nbytes(), false)?;

    // broadcast factors along the two batch dimensions
    let r2 = ne12 / ne02;
    let r3 = ne13 / ne03;
    if r2 <= 0 || r3 <= 0 {
      return Err(invalid("batch dimensions do not broadcast"));
    }

    // dequantised weights are laid out densely, so their batch strides are
    // FP32 strides rather than the original quantised ones
    let fp32_nb02 = ne00 as usize * ne01 as usize * 4;
    let fp32_nb03 = fp32_nb02 * ne02 as usize;

    for i13 in 0..ne13 {
      for i12 in 0..ne12 {
        let i03 = i13 / r3;
        let i02 = i12 / r2;

        let b_offset = if dequantized {
          i02 as usize * fp32_nb02 + i03 as usize * fp32_nb03
        } else {
          i02 as usize * weights.nb[2] + i03 as usize * weights.nb[3]
        };

        let params = MatmulParams {
          a_handle: handle_a,
          a_offset: i12 as usize * input.nb[2] + i13 as usize * input.nb[3],
          b_handle: handle_b,
          b_offset,
          c_handle: handle_c,
          c_offset: i12 as usize * output.nb[2] + i13 as usize * output.nb[3],
          m: ne11,
          n: ne01,
          k: ne10,
          lda: ne10,
          ldb: ne00,
          ldc: ne0,
          type_a: ElemType::F32,
          type_b: ElemType::F32,
          type_c: ElemType::F32,
        };

        self.dev.matmul(&params)?;
      }
    }

    Ok(())
  }

  /// Execute a graph: matmul nodes dispatch to the device, shape ops are
  /// no-ops, and the device is synced at the end
  pub fn compute(&mut self, nodes: &[GraphNode]) -> io::Result<()> {
    for node in nodes {
      match node {
        GraphNode::MulMat(mm) => self.mul_mat(mm)?,
        GraphNode::Noop
        | GraphNode::Reshape
        | GraphNode::View
        | GraphNode::Permute
        | GraphNode::Transpose => {},
      }
    }
    self.dev.sync()
  }

  /// Unregister every cached handle (the dequant handle included) and shut
  /// the device down
  pub fn teardown(&mut self) {
    let handles: Vec<u64> = self.buffer_handles.values().map(|&(h, _)| h).collect();
    for handle in handles {
      self.dev.unregister_buffer(handle);
    }
    self.buffer_handles.clear();

    if self.dequant_handle != 0 {
      self.dev.unregister_buffer(self.dequant_handle);
      self.dequant_handle = 0;
      self.dequant_handle_size = 0;
    }

    self.dev.shutdown();
  }
}

impl Drop for NpmBackend {
  fn drop(&mut self) {
    self.teardown();
  }
}
