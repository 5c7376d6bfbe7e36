//! Wire protocol between the NPM client driver and the emulator process.
//!
//! All messages start with a fixed [`MsgHeader`] followed by a command-specific
//! payload. Structures are packed little-endian with no padding; the protocol
//! only runs over a local stream socket so no byte swapping is performed.

use std::io::{self, Read, Write};

pub const NPM_EMU_MAGIC: u32 = 0x454D_504E; // "NPME" in little-endian
pub const NPM_EMU_VERSION_MAJOR: u8 = 1;
pub const NPM_EMU_VERSION_MINOR: u8 = 0;

pub const NPM_EMU_DEFAULT_SOCKET: &str = "/tmp/npm-emulator.sock";
pub const NPM_EMU_MAX_SHM_NAME: usize = 64;

// Command tags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
  Hello = 0x00,
  Goodbye = 0x01,
  Ping = 0x02,
  RegisterBuffer = 0x20,
  UnregisterBuffer = 0x21,
  Matmul = 0x30,
  Sync = 0x40,
  FenceCreate = 0x41,
  FenceDestroy = 0x42,
  FenceWait = 0x43,
}

impl Cmd {
  pub fn from_u8(value: u8) -> Option<Self> {
    match value {
      0x00 => Some(Cmd::Hello),
      0x01 => Some(Cmd::Goodbye),
      0x02 => Some(Cmd::Ping),
      0x20 => Some(Cmd::RegisterBuffer),
      0x21 => Some(Cmd::UnregisterBuffer),
      0x30 => Some(Cmd::Matmul),
      0x40 => Some(Cmd::Sync),
      0x41 => Some(Cmd::FenceCreate),
      0x42 => Some(Cmd::FenceDestroy),
      0x43 => Some(Cmd::FenceWait),
      _ => None,
    }
  }
}

// Response status codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  Ok = 0,
  Error = 1,
  VersionMismatch = 2,
  InvalidHandle = 3,
  OutOfMemory = 4,
  InvalidParams = 5,
  Timeout = 6,
}

impl Status {
  pub fn from_u8(value: u8) -> Option<Self> {
    match value {
      0 => Some(Status::Ok),
      1 => Some(Status::Error),
      2 => Some(Status::VersionMismatch),
      3 => Some(Status::InvalidHandle),
      4 => Some(Status::OutOfMemory),
      5 => Some(Status::InvalidParams),
      6 => Some(Status::Timeout),
      _ => None,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Status::Ok => "OK",
      Status::Error => "ERROR",
      Status::VersionMismatch => "VERSION_MISMATCH",
      Status::InvalidHandle => "INVALID_HANDLE",
      Status::OutOfMemory => "OUT_OF_MEMORY",
      Status::InvalidParams => "INVALID_PARAMS",
      Status::Timeout => "TIMEOUT",
    }
  }
}

/// Status name used on the request side of command traces
pub fn status_name(raw: u8) -> &'static str {
  match Status::from_u8(raw) {
    Some(status) => status.name(),
    None => "UNKNOWN",
  }
}

// Message header (all messages start with this)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct MsgHeader {
  pub magic: u32,
  pub version_major: u8,
  pub version_minor: u8,
  pub cmd: u8,
  pub flags: u8,
  pub seq_id: u32,
  pub payload_size: u32,
}

impl MsgHeader {
  pub fn new(cmd: Cmd, seq_id: u32, payload_size: u32) -> Self {
    Self {
      magic: NPM_EMU_MAGIC,
      version_major: NPM_EMU_VERSION_MAJOR,
      version_minor: NPM_EMU_VERSION_MINOR,
      cmd: cmd as u8,
      flags: 0,
      seq_id,
      payload_size,
    }
  }

  /// Reject headers with the wrong magic or an incompatible protocol major.
  /// A failure here aborts the connection without a reply.
  pub fn validate(&self) -> io::Result<()> {
    let magic = self.magic;
    if magic != NPM_EMU_MAGIC {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("invalid magic 0x{:08x}", magic),
      ));
    }
    let major = self.version_major;
    if major != NPM_EMU_VERSION_MAJOR {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("protocol major mismatch: peer v{}, local v{}", major, NPM_EMU_VERSION_MAJOR),
      ));
    }
    Ok(())
  }
}

// HELLO: version handshake + shared memory setup
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct HelloReq {
  pub version_major: u8,
  pub version_minor: u8,
  pub reserved: [u8; 2],
  pub shm_name: [u8; NPM_EMU_MAX_SHM_NAME],
  pub shm_size: u64,
}

impl HelloReq {
  pub fn new(shm_name: &str, shm_size: u64) -> Self {
    let mut name = [0u8; NPM_EMU_MAX_SHM_NAME];
    let bytes = shm_name.as_bytes();
    let n = bytes.len().min(NPM_EMU_MAX_SHM_NAME - 1);
    name[..n].copy_from_slice(&bytes[..n]);
    Self {
      version_major: NPM_EMU_VERSION_MAJOR,
      version_minor: NPM_EMU_VERSION_MINOR,
      reserved: [0; 2],
      shm_name: name,
      shm_size,
    }
  }

  /// NUL-terminated name as a string
  pub fn shm_name_str(&self) -> String {
    let raw = self.shm_name;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
  }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct HelloRsp {
  pub status: u8,
  pub version_major: u8,
  pub version_minor: u8,
  pub reserved: u8,
  pub sku: u32,
  pub num_engines: u32,
  pub l1_size: u64,
  pub l2_size: u64,
}

// GOODBYE: clean disconnect (request has no payload)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct GoodbyeRsp {
  pub status: u8,
  pub reserved: [u8; 3],
}

// PING: keep-alive with echo payload
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct PingReq {
  pub echo_data: u64,
  pub timestamp: u64,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct PingRsp {
  pub status: u8,
  pub reserved: [u8; 3],
  pub client_timestamp: u64,
  pub server_timestamp: u64,
  pub echo_data: u64,
}

// REGISTER_BUFFER
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct RegisterBufferReq {
  pub shm_offset: u64,
  pub size: u64,
  pub flags: u32,
  pub reserved: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct RegisterBufferRsp {
  pub status: u8,
  pub reserved: [u8; 3],
  pub handle: u64,
}

// UNREGISTER_BUFFER
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct UnregisterBufferReq {
  pub handle: u64,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct UnregisterBufferRsp {
  pub status: u8,
  pub reserved: [u8; 3],
}

// MATMUL: C = A * B^T
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct MatmulReq {
  pub a_handle: u64,
  pub a_offset: u64,
  pub b_handle: u64,
  pub b_offset: u64,
  pub c_handle: u64,
  pub c_offset: u64,
  pub m: i64,
  pub n: i64,
  pub k: i64,
  pub lda: i64,
  pub ldb: i64,
  pub ldc: i64,
  pub type_a: u32,
  pub type_b: u32,
  pub type_c: u32,
  pub flags: u32,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct MatmulRsp {
  pub status: u8,
  pub reserved: [u8; 3],
  pub cycles: u64,
  pub dma_bytes: u64,
}

// SYNC
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct SyncRsp {
  pub status: u8,
  pub reserved: [u8; 3],
}

// FENCE_CREATE / FENCE_DESTROY / FENCE_WAIT
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct FenceCreateRsp {
  pub status: u8,
  pub reserved: [u8; 3],
  pub fence_id: u64,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct FenceDestroyReq {
  pub fence_id: u64,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct FenceDestroyRsp {
  pub status: u8,
  pub reserved: [u8; 3],
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct FenceWaitReq {
  pub fence_id: u64,
  pub timeout_ns: u64,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct FenceWaitRsp {
  pub status: u8,
  pub reserved: [u8; 3],
}

// Helper functions for reading/writing packed structs on a stream.
// A short read maps to an error and is treated as peer disconnect.

pub fn read_struct<T: Copy, R: Read>(stream: &mut R) -> io::Result<T> {
  unsafe {
    let mut data: T = std::mem::zeroed();
    let bytes =
      std::slice::from_raw_parts_mut(&mut data as *mut T as *mut u8, std::mem::size_of::<T>());
    stream.read_exact(bytes)?;
    Ok(data)
  }
}

pub fn write_struct<T: Copy, W: Write>(stream: &mut W, data: &T) -> io::Result<()> {
  unsafe {
    let bytes =
      std::slice::from_raw_parts(data as *const T as *const u8, std::mem::size_of::<T>());
    stream.write_all(bytes)?;
    Ok(())
  }
}

/// Payload size of a message body type, as carried in `MsgHeader::payload_size`
pub fn payload_size<T>() -> u32 {
  std::mem::size_of::<T>() as u32
}
