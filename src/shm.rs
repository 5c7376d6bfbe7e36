//! Named shared-memory region with a bump allocator.
//!
//! The client driver creates a region and the emulator process attaches to it
//! by name, so tensor data crosses the process boundary without a socket copy.
//! Names follow the POSIX convention `/npm-shm-<pid>` and are backed by files
//! under `/dev/shm`, which keeps them interoperable with `shm_open` peers.

use log::warn;
use memmap2::MmapMut;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process;

pub const SHM_DEFAULT_ALIGNMENT: usize = 64;

fn shm_path(name: &str) -> PathBuf {
  PathBuf::from("/dev/shm").join(name.trim_start_matches('/'))
}

pub struct ShmRegion {
  name: String,
  map: MmapMut,
  size: usize,
  allocated: usize,
  is_owner: bool,
}

impl ShmRegion {
  /// Create a new region of exactly `size` bytes, mapped read/write.
  /// The name embeds the creating process id for uniqueness.
  pub fn create(size: usize) -> io::Result<Self> {
    let name = format!("/npm-shm-{}", process::id());
    Self::create_named(&name, size)
  }

  pub fn create_named(name: &str, size: usize) -> io::Result<Self> {
    if size == 0 {
      return Err(io::Error::new(io::ErrorKind::InvalidInput, "shm size must be nonzero"));
    }
    let path = shm_path(name);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(true)
      .open(&path)?;
    file.set_len(size as u64)?;
    let map = unsafe { MmapMut::map_mut(&file)? };
    Ok(Self {
      name: name.to_string(),
      map,
      size,
      allocated: 0,
      is_owner: true,
    })
  }

  /// Attach to an existing region by name. Fails if it does not exist.
  pub fn attach(name: &str, size: usize) -> io::Result<Self> {
    let path = shm_path(name);
    let file = OpenOptions::new().read(true).write(true).open(&path)?;
    let actual = file.metadata()?.len() as usize;
    if actual < size {
      return Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("shm {} is {} bytes, expected at least {}", name, actual, size),
      ));
    }
    let map = unsafe { MmapMut::map_mut(&file)? };
    Ok(Self {
      name: name.to_string(),
      map,
      size,
      allocated: 0,
      is_owner: false,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn allocated(&self) -> usize {
    self.allocated
  }

  /// Bump-allocate `size` bytes, returning the region offset.
  /// Returns `None` when the arena is exhausted; the caller surfaces this
  /// as OUT_OF_MEMORY. Allocations are never freed individually.
  pub fn alloc(&mut self, size: usize, alignment: usize) -> Option<usize> {
    if size == 0 {
      return None;
    }
    let alignment = if alignment == 0 { SHM_DEFAULT_ALIGNMENT } else { alignment };
    let offset = (self.allocated + alignment - 1) & !(alignment - 1);
    let new_allocated = offset.checked_add(size)?;
    if new_allocated > self.size {
      return None;
    }
    self.allocated = new_allocated;
    Some(offset)
  }

  /// Reset the allocator watermark. Does not zero the backing bytes.
  pub fn reset(&mut self) {
    self.allocated = 0;
  }

  pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
    if offset.checked_add(len)? > self.size {
      return None;
    }
    Some(&self.map[offset..offset + len])
  }

  pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
    if offset.checked_add(len)? > self.size {
      return None;
    }
    Some(&mut self.map[offset..offset + len])
  }

  /// View a range of the region as f32 values. The offset must be 4-byte
  /// aligned, which every default-aligned allocation satisfies.
  pub fn f32_slice(&self, offset: usize, count: usize) -> Option<&[f32]> {
    let bytes = self.bytes(offset, count.checked_mul(4)?)?;
    if bytes.as_ptr() as usize % 4 != 0 {
      return None;
    }
    Some(unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, count) })
  }

  /// Raw base pointer for callers that need aliasing views into registered
  /// regions. The regions come from the bump allocator and do not overlap.
  pub fn as_mut_ptr(&mut self) -> *mut u8 {
    self.map.as_mut_ptr()
  }

  pub fn f32_slice_mut(&mut self, offset: usize, count: usize) -> Option<&mut [f32]> {
    let bytes = self.bytes_mut(offset, count.checked_mul(4)?)?;
    if bytes.as_ptr() as usize % 4 != 0 {
      return None;
    }
    Some(unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut f32, count) })
  }
}

impl Drop for ShmRegion {
  fn drop(&mut self) {
    // The owner removes the OS name so the region cannot be re-attached.
    if self.is_owner {
      if let Err(e) = fs::remove_file(shm_path(&self.name)) {
        warn!("failed to unlink shm {}: {}", self.name, e);
      }
    }
  }
}
