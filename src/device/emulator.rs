//! Emulator device: IPC client for the npm-emulator process.
//!
//! Connects over a Unix socket and ships tensor bytes through a shared-memory
//! region created here and attached by the server on HELLO. Every request gets
//! exactly one response, matched by sequence id.

use super::{Fence, MatmulParams, NpmDevice};
use crate::protocol::*;
use crate::shm::{ShmRegion, SHM_DEFAULT_ALIGNMENT};
use crate::sku::Sku;
use log::{debug, error};
use std::collections::HashMap;
use std::env;
use std::io;
use std::os::unix::net::UnixStream;
use std::sync::OnceLock;
use std::time::Duration;

/// Default shared memory size (1.5 GB), sized for dequantized weights
pub const NPM_EMU_DEFAULT_SHM_SIZE: usize = 1536 * 1024 * 1024;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// `NPM_DEBUG` enables verbose client-side tracing
fn npm_debug() -> bool {
  static FLAG: OnceLock<bool> = OnceLock::new();
  *FLAG.get_or_init(|| {
    matches!(env::var("NPM_DEBUG").as_deref(), Ok("1") | Ok("true"))
  })
}

#[derive(Debug, Clone, Copy)]
struct BufferInfo {
  handle: u64,
  shm_offset: usize,
  size: usize,
}

pub struct EmulatorDevice {
  stream: Option<UnixStream>,
  socket_path: String,
  seq_id: u32,
  shm: Option<ShmRegion>,

  // device info from the HELLO reply
  sku: Sku,
  num_engines: usize,
  l1_size: usize,
  l2_size: usize,

  // host ptr -> shm placement, keyed by address
  buffers: HashMap<usize, BufferInfo>,
}

impl std::fmt::Debug for EmulatorDevice {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EmulatorDevice")
      .field("socket_path", &self.socket_path)
      .field("sku", &self.sku)
      .finish()
  }
}

impl EmulatorDevice {
  /// Connect with the default 1.5 GiB shared-memory region.
  /// `socket_path` overrides `NPM_EMULATOR_SOCKET` and the built-in default.
  pub fn connect(socket_path: Option<&str>) -> io::Result<Self> {
    Self::connect_with(socket_path, NPM_EMU_DEFAULT_SHM_SIZE)
  }

  pub fn connect_with(socket_path: Option<&str>, shm_size: usize) -> io::Result<Self> {
    let path = match socket_path {
      Some(p) => p.to_string(),
      None => env::var("NPM_EMULATOR_SOCKET").unwrap_or_else(|_| NPM_EMU_DEFAULT_SOCKET.to_string()),
    };

    let stream = UnixStream::connect(&path).map_err(|e| {
      error!("failed to connect to emulator at {}: {}", path, e);
      error!("make sure npm-emulator is running: npm-emulator --tiling");
      e
    })?;
    stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
    stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;

    let shm = ShmRegion::create(shm_size)?;

    let mut dev = Self {
      stream: Some(stream),
      socket_path: path,
      seq_id: 0,
      sku: Sku::Emulator,
      num_engines: 0,
      l1_size: 0,
      l2_size: 0,
      buffers: HashMap::new(),
      shm: Some(shm),
    };

    // HELLO handshake: announce the region and take the device info
    let hello = {
      let shm = dev.shm.as_ref().expect("shm just created");
      HelloReq::new(shm.name(), shm.size() as u64)
    };
    dev.send_request(Cmd::Hello, Some(&hello))?;
    let (_, rsp): (MsgHeader, HelloRsp) = dev.recv_response()?;

    match Status::from_u8(rsp.status) {
      Some(Status::Ok) => {},
      Some(Status::VersionMismatch) => {
        return Err(io::Error::new(
          io::ErrorKind::InvalidData,
          "emulator rejected protocol version",
        ));
      },
      other => {
        return Err(io::Error::new(
          io::ErrorKind::ConnectionRefused,
          format!("HELLO failed: {:?}", other.map(|s| s.name())),
        ));
      },
    }

    dev.sku = Sku::from_u32(rsp.sku).unwrap_or(Sku::Emulator);
    dev.num_engines = rsp.num_engines as usize;
    dev.l1_size = rsp.l1_size as usize;
    dev.l2_size = rsp.l2_size as usize;

    if npm_debug() {
      debug!(
        "emulator device: sku={} engines={} l1={} l2={}",
        dev.sku.name(),
        dev.num_engines,
        dev.l1_size,
        dev.l2_size
      );
    }

    Ok(dev)
  }

  pub fn socket_path(&self) -> &str {
    &self.socket_path
  }

  fn stream(&mut self) -> io::Result<&mut UnixStream> {
    self
      .stream
      .as_mut()
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device is shut down"))
  }

  fn shm(&mut self) -> io::Result<&mut ShmRegion> {
    self
      .shm
      .as_mut()
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "device is shut down"))
  }

  fn send_request<T: Copy>(&mut self, cmd: Cmd, payload: Option<&T>) -> io::Result<()> {
    let size = payload.map_or(0, |_| payload_size::<T>());
    let hdr = MsgHeader::new(cmd, self.seq_id, size);
    self.seq_id = self.seq_id.wrapping_add(1);

    let stream = self.stream()?;
    write_struct(stream, &hdr)?;
    if let Some(payload) = payload {
      write_struct(stream, payload)?;
    }
    Ok(())
  }

  fn recv_response<T: Copy>(&mut self) -> io::Result<(MsgHeader, T)> {
    let stream = self.stream()?;
    let hdr: MsgHeader = read_struct(stream)?;
    hdr.validate()?;
    let payload: T = read_struct(stream)?;
    Ok((hdr, payload))
  }

  fn find_by_handle(&self, handle: u64) -> Option<(usize, BufferInfo)> {
    self
      .buffers
      .iter()
      .find(|(_, info)| info.handle == handle)
      .map(|(&ptr, &info)| (ptr, info))
  }

  fn status_error(context: &str, raw: u8) -> io::Error {
    let kind = match Status::from_u8(raw) {
      Some(Status::InvalidHandle) | Some(Status::InvalidParams) => io::ErrorKind::InvalidInput,
      Some(Status::OutOfMemory) => io::ErrorKind::OutOfMemory,
      Some(Status::Timeout) => io::ErrorKind::TimedOut,
      _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, format!("{} failed: {}", context, status_name(raw)))
  }
}

impl NpmDevice for EmulatorDevice {
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

    // place the bytes into shared memory
    let shm = self.shm()?;
    let shm_offset = shm
      .alloc(size, SHM_DEFAULT_ALIGNMENT)
      .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "shared memory exhausted"))?;
    let dst = shm.bytes_mut(shm_offset, size).expect("alloc stays in bounds");
    unsafe {
      dst.copy_from_slice(std::slice::from_raw_parts(ptr, size));
    }

    let req = RegisterBufferReq {
      shm_offset: shm_offset as u64,
      size: size as u64,
      flags: 0,
      reserved: 0,
    };
    self.send_request(Cmd::RegisterBuffer, Some(&req))?;
    let (_, rsp): (MsgHeader, RegisterBufferRsp) = self.recv_response()?;
    if rsp.status != Status::Ok as u8 {
      return Err(Self::status_error("REGISTER_BUFFER", rsp.status));
    }

    let handle = rsp.handle;
    self.buffers.insert(ptr as usize, BufferInfo { handle, shm_offset, size });

    if npm_debug() {
      debug!("registered buffer ptr={:?} size={} -> handle={}", ptr, size, handle);
    }

    Ok(handle)
  }

  fn unregister_buffer(&mut self, handle: u64) {
    if let Some((ptr, _)) = self.find_by_handle(handle) {
      self.buffers.remove(&ptr);
    }

    // inform the server; the response is ignored on teardown paths
    let req = UnregisterBufferReq { handle };
    if self.send_request(Cmd::UnregisterBuffer, Some(&req)).is_ok() {
      let _ = self.recv_response::<UnregisterBufferRsp>();
    }
  }

  fn update_buffer(&mut self, handle: u64, ptr: *const u8, size: usize) -> io::Result<()> {
    let (_, info) = self
      .find_by_handle(handle)
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unknown buffer handle"))?;
    if size > info.size {
      return Err(io::Error::new(
        io::ErrorKind::InvalidInput,
        "update larger than registered size",
      ));
    }

    // refresh the shared-memory copy in place; no re-registration needed
    let shm = self.shm()?;
    let dst = shm
      .bytes_mut(info.shm_offset, size)
      .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "stale shm placement"))?;
    unsafe {
      dst.copy_from_slice(std::slice::from_raw_parts(ptr, size));
    }
    Ok(())
  }

  fn matmul(&mut self, params: &MatmulParams) -> io::Result<()> {
    let req = MatmulReq {
      a_handle: params.a_handle,
      a_offset: params.a_offset as u64,
      b_handle: params.b_handle,
      b_offset: params.b_offset as u64,
      c_handle: params.c_handle,
      c_offset: params.c_offset as u64,
      m: params.m,
      n: params.n,
      k: params.k,
      lda: params.lda,
      ldb: params.ldb,
      ldc: params.ldc,
      type_a: params.type_a as u32,
      type_b: params.type_b as u32,
      type_c: params.type_c as u32,
      flags: 0,
    };
    self.send_request(Cmd::Matmul, Some(&req))?;
    let (_, rsp): (MsgHeader, MatmulRsp) = self.recv_response()?;
    if rsp.status != Status::Ok as u8 {
      return Err(Self::status_error("MATMUL", rsp.status));
    }

    if npm_debug() {
      debug!("matmul done: cycles={} dma_bytes={}", { rsp.cycles }, { rsp.dma_bytes });
    }

    // copy the output buffer back from shared memory to the host
    if let Some((ptr, info)) = self.find_by_handle(params.c_handle) {
      let shm = self.shm()?;
      let src = shm
        .bytes(info.shm_offset, info.size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "stale shm placement"))?;
      unsafe {
        std::slice::from_raw_parts_mut(ptr as *mut u8, info.size).copy_from_slice(src);
      }
    }

    Ok(())
  }

  fn sync(&mut self) -> io::Result<()> {
    self.send_request::<()>(Cmd::Sync, None)?;
    let (_, rsp): (MsgHeader, SyncRsp) = self.recv_response()?;
    if rsp.status != Status::Ok as u8 {
      return Err(Self::status_error("SYNC", rsp.status));
    }
    Ok(())
  }

  fn fence_create(&mut self) -> io::Result<Fence> {
    self.send_request::<()>(Cmd::FenceCreate, None)?;
    let (_, rsp): (MsgHeader, FenceCreateRsp) = self.recv_response()?;
    if rsp.status != Status::Ok as u8 {
      return Err(Self::status_error("FENCE_CREATE", rsp.status));
    }
    Ok(rsp.fence_id)
  }

  fn fence_destroy(&mut self, fence: Fence) {
    let req = FenceDestroyReq { fence_id: fence };
    if self.send_request(Cmd::FenceDestroy, Some(&req)).is_ok() {
      let _ = self.recv_response::<FenceDestroyRsp>();
    }
  }

  fn fence_wait(&mut self, fence: Fence, timeout_ns: u64) -> io::Result<()> {
    let req = FenceWaitReq {
      fence_id: fence,
      timeout_ns,
    };
    self.send_request(Cmd::FenceWait, Some(&req))?;
    let (_, rsp): (MsgHeader, FenceWaitRsp) = self.recv_response()?;
    match Status::from_u8(rsp.status) {
      Some(Status::Ok) => Ok(()),
      Some(Status::Timeout) => Err(io::Error::new(io::ErrorKind::TimedOut, "fence wait timed out")),
      _ => Err(Self::status_error("FENCE_WAIT", rsp.status)),
    }
  }

  fn shutdown(&mut self) {
    if self.stream.is_some() {
      // clean disconnect; errors on a dying socket are uninteresting
      if self.send_request::<()>(Cmd::Goodbye, None).is_ok() {
        let _ = self.recv_response::<GoodbyeRsp>();
      }
      self.stream = None;
    }
    self.shm = None; // unmaps and unlinks the region
    self.buffers.clear();
  }
}

impl Drop for EmulatorDevice {
  fn drop(&mut self) {
    self.shutdown();
  }
}
