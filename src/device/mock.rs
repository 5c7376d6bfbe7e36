//! Mock device: executes matmul on the host CPU.
//!
//! Validates the device abstraction without an emulator process. Buffers stay
//! in host memory; only dense FP32 operands are supported.

use super::{Fence, MatmulParams, NpmDevice};
use crate::sku::{sku_config, ElemType, Sku};
use std::collections::HashMap;
use std::io;

struct BufferEntry {
  ptr: *mut u8,
  size: usize,
}

pub struct MockDevice {
  sku: Sku,
  num_engines: usize,
  l1_size: usize,
  l2_size: usize,
  buffers: HashMap<u64, BufferEntry>,
  next_handle: u64,
}

impl std::fmt::Debug for MockDevice {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MockDevice")
      .field("sku", &self.sku)
      .field("num_engines", &self.num_engines)
      .finish()
  }
}

impl MockDevice {
  pub fn new() -> Self {
    let cfg = sku_config(Sku::Mock);
    Self {
      sku: Sku::Mock,
      num_engines: cfg.num_engines,
      l1_size: cfg.l1_size,
      l2_size: cfg.l2_size_default,
      buffers: HashMap::new(),
      next_handle: 1, // handle 0 is reserved/invalid
    }
  }

  fn resolve(&self, handle: u64, offset: usize) -> Option<(*mut u8, usize)> {
    let entry = self.buffers.get(&handle)?;
    if offset >= entry.size {
      return None;
    }
    Some((unsafe { entry.ptr.add(offset) }, entry.size - offset))
  }
}

impl Default for MockDevice {
  fn default() -> Self {
    Self::new()
  }
}

impl NpmDevice for MockDevice {
  fn sku(&self) -> Sku {
    self.sku
  }

  fn num_engines(&self) -> usize {
    self.num_engines
  }

  fn l1_size(&self) -> usize {
    self.l1_size
  }

  fn l2_size(&self) -> usize {
    self.l2_size
  }

  fn register_buffer(&mut self, ptr: *mut u8, size: usize) -> io::Result<u64> {
    if ptr.is_null() || size == 0 {
      return Err(io::Error::new(io::ErrorKind::InvalidInput, "null buffer or zero size"));
    }
    let handle = self.next_handle;
    self.next_handle += 1;
    self.buffers.insert(handle, BufferEntry { ptr, size });
    Ok(handle)
  }

  fn unregister_buffer(&mut self, handle: u64) {
    self.buffers.remove(&handle);
  }

  fn update_buffer(&mut self, handle: u64, ptr: *const u8, size: usize) -> io::Result<()> {
    let entry = self
      .buffers
      .get_mut(&handle)
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unknown buffer handle"))?;
    if size > entry.size {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "update larger than registered size",
      ));
    }
    // the device reads host memory directly, so just track the new location
    entry.ptr = ptr as *mut u8;
    Ok(())
  }

  fn matmul(&mut self, params: &MatmulParams) -> io::Result<()> {
    if params.type_a != ElemType::F32 || params.type_b != ElemType::F32 || params.type_c != ElemType::F32 {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "mock device supports FP32 operands only",
      ));
    }
    if params.m <= 0 || params.n <= 0 || params.k <= 0 {
      return Err(io::Error::new(io::ErrorKind::InvalidInput, "dimensions must be positive"));
    }

    let (m, n, k) = (params.m as usize, params.n as usize, params.k as usize);
    let (lda, ldb, ldc) = (params.lda as usize, params.ldb as usize, params.ldc as usize);

    let a_count = (m - 1) * lda + k;
    let b_count = (n - 1) * ldb + k;
    let c_count = (m - 1) * ldc + n;

    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, "invalid buffer handle");
    let (a_ptr, a_room) = self.resolve(params.a_handle, params.a_offset).ok_or_else(invalid)?;
    let (b_ptr, b_room) = self.resolve(params.b_handle, params.b_offset).ok_or_else(invalid)?;
    let (c_ptr, c_room) = self.resolve(params.c_handle, params.c_offset).ok_or_else(invalid)?;
    if a_count * 4 > a_room || b_count * 4 > b_room || c_count * 4 > c_room {
      return Err(invalid());
    }

    // C = A * B^T
    unsafe {
      let a = std::slice::from_raw_parts(a_ptr as *const f32, a_count);
      let b = std::slice::from_raw_parts(b_ptr as *const f32, b_count);
      let c = std::slice::from_raw_parts_mut(c_ptr as *mut f32, c_count);

      for mi in 0..m {
        for ni in 0..n {
          let mut sum = 0.0f32;
          for ki in 0..k {
            sum += a[mi * lda + ki] * b[ni * ldb + ki];
          }
          c[mi * ldc + ni] = sum;
        }
      }
    }

    Ok(())
  }

  fn sync(&mut self) -> io::Result<()> {
    Ok(()) // everything is synchronous
  }

  fn fence_create(&mut self) -> io::Result<Fence> {
    Ok(1) // opaque sentinel; fences signal immediately
  }

  fn fence_destroy(&mut self, _fence: Fence) {}

  fn fence_wait(&mut self, _fence: Fence, _timeout_ns: u64) -> io::Result<()> {
    Ok(())
  }

  fn shutdown(&mut self) {
    self.buffers.clear();
  }
}
