//! NPM device abstraction.
//!
//! A device exposes buffer registration and matmul dispatch behind a common
//! trait so the backend can run against any implementation:
//!   - [`mock::MockDevice`]: in-process CPU execution
//!   - [`emulator::EmulatorDevice`]: IPC to the separate emulator process
//!
//! Buffers are host-allocated; the device registers them and refers to them
//! by opaque 64-bit handles afterwards. Handle 0 is reserved and always means
//! "missing".

pub mod emulator;
pub mod mock;

use crate::sku::{ElemType, Sku};
use log::{error, info};
use std::env;
use std::io;

pub use emulator::EmulatorDevice;
pub use mock::MockDevice;

/// Completion token. All operations complete synchronously today, so fences
/// signal immediately; the id stays opaque to callers.
pub type Fence = u64;

/// Matrix multiplication parameters: C = A * B^T with A row-major (M x K),
/// B row-major (N x K) and C row-major (M x N). Leading dimensions are row
/// strides in elements.
#[derive(Debug, Clone, Copy)]
pub struct MatmulParams {
  pub a_handle: u64,
  pub a_offset: usize,
  pub b_handle: u64,
  pub b_offset: usize,
  pub c_handle: u64,
  pub c_offset: usize,
  pub m: i64,
  pub n: i64,
  pub k: i64,
  pub lda: i64,
  pub ldb: i64,
  pub ldc: i64,
  pub type_a: ElemType,
  pub type_b: ElemType,
  pub type_c: ElemType,
}

pub trait NpmDevice: std::fmt::Debug {
  // device info
  fn sku(&self) -> Sku;
  fn num_engines(&self) -> usize;
  fn l1_size(&self) -> usize;
  fn l2_size(&self) -> usize;

  // memory management. The caller keeps ownership of the host buffer and
  // must keep it alive (and at the same address) until unregistered.
  fn register_buffer(&mut self, ptr: *mut u8, size: usize) -> io::Result<u64>;
  fn unregister_buffer(&mut self, handle: u64);

  /// Refresh device-visible bytes after the host buffer was modified.
  /// Fails with `InvalidInput` when `size` exceeds the registered size.
  fn update_buffer(&mut self, handle: u64, ptr: *const u8, size: usize) -> io::Result<()>;

  // compute
  fn matmul(&mut self, params: &MatmulParams) -> io::Result<()>;

  // synchronization
  fn sync(&mut self) -> io::Result<()>;
  fn fence_create(&mut self) -> io::Result<Fence>;
  fn fence_destroy(&mut self, fence: Fence);
  fn fence_wait(&mut self, fence: Fence, timeout_ns: u64) -> io::Result<()>;

  /// Release all device resources. Further calls fail.
  fn shutdown(&mut self);
}

/// Create a device by implementation name: "mock", "emulator" or "hardware"
pub fn create_device(device_type: &str) -> io::Result<Box<dyn NpmDevice>> {
  info!("NPM: creating device type: {}", device_type);
  match device_type {
    "mock" => {
      let dev = MockDevice::new();
      info!("NPM: mock device initialized");
      Ok(Box::new(dev))
    },
    "emulator" => {
      let socket = env::var("NPM_EMULATOR_SOCKET").ok();
      let dev = EmulatorDevice::connect(socket.as_deref())?;
      info!("NPM: emulator device initialized (socket: {})", dev.socket_path());
      Ok(Box::new(dev))
    },
    "hardware" => {
      // real NPM silicon; no backend for it is built into the emulator
      error!("NPM: hardware device backend not available in this build");
      Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "hardware device type recognized but not available",
      ))
    },
    other => {
      error!("NPM: unknown device type: {} (valid: mock, emulator, hardware)", other);
      Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unknown device type: {}", other),
      ))
    },
  }
}

/// Create a device from the `NPM_DEVICE` environment variable (default mock)
pub fn create_device_from_env() -> io::Result<Box<dyn NpmDevice>> {
  let device_type = env::var("NPM_DEVICE").unwrap_or_else(|_| "mock".to_string());
  create_device(&device_type)
}
