//! Emulator server.
//!
//! Accepts one client at a time on a Unix socket, attaches the client's
//! shared memory on HELLO, and executes compute requests against it. Matmul
//! runs either as a plain nested loop or through the tile scheduler, which
//! drives the memory-hierarchy and DMA models to produce cycle and traffic
//! estimates.

use crate::config::{validate_config, EmuConfig};
use crate::dma_model::{DmaKind, DmaModel};
use crate::memory_model::MemoryHierarchy;
use crate::protocol::*;
use crate::shm::ShmRegion;
use crate::sku::{sku_config, Sku};
use crate::trace::{TraceEmitter, TraceEvent, STATUS_REQ, TRACE_COMMANDS, TRACE_DMA, TRACE_OPS};
use log::{error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct BufferEntry {
  shm_offset: usize,
  size: usize,
  #[allow(dead_code)]
  flags: u32,
}

pub struct EmuServer {
  config: EmuConfig,
  sku: Sku,
  num_engines: usize,
  l1_size: usize,
  l2_size: usize,

  listener: UnixListener,
  socket_path: String,

  // shared memory attached from the current client
  shm: Option<ShmRegion>,

  // buffer registry: handle -> placement
  buffers: HashMap<u64, BufferEntry>,
  next_handle: u64,
  next_fence_id: u64,

  mem: MemoryHierarchy,
  dma: DmaModel,
  trace: TraceEmitter,

  start: Instant,
  total_matmul_ops: u64,
  shutdown: Arc<AtomicBool>,
}

impl EmuServer {
  pub fn new(config: EmuConfig) -> io::Result<Self> {
    validate_config(&config)?;

    let sku = config.resolved_sku()?;
    let sku_cfg = sku_config(sku);
    let l2_size = config.resolved_l2_size(sku);

    let trace = TraceEmitter::new(config.trace_categories(), &config.trace_file, true);

    // remove a stale socket from a previous run before binding
    let socket_path = config.socket.clone();
    let _ = fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;

    Ok(Self {
      sku,
      num_engines: sku_cfg.num_engines,
      l1_size: sku_cfg.l1_size,
      l2_size,
      listener,
      socket_path,
      shm: None,
      buffers: HashMap::new(),
      next_handle: 1,
      next_fence_id: 1,
      mem: MemoryHierarchy::new(sku_cfg.num_engines, sku_cfg.l1_size, l2_size),
      dma: DmaModel::new(config.dma_config()),
      trace,
      start: Instant::now(),
      total_matmul_ops: 0,
      shutdown: Arc::new(AtomicBool::new(false)),
      config,
    })
  }

  /// Flag checked between clients; set it and poke the socket to stop `run`
  pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
    Arc::clone(&self.shutdown)
  }

  pub fn socket_path(&self) -> &str {
    &self.socket_path
  }

  fn print_banner(&self) {
    let cfg = sku_config(self.sku);
    println!();
    println!("+---------------------------------------------------------+");
    println!("|           NPM Hardware Emulator v{}.{}                    |", NPM_EMU_VERSION_MAJOR, NPM_EMU_VERSION_MINOR);
    println!("+---------------------------------------------------------+");
    println!("|  SKU:         {:<10}                                |", self.sku.name());
    println!("|  Engines:     {:<3}                                       |", self.num_engines);
    println!("|  L1 Size:     {:<4} KB (per engine)                      |", self.l1_size / 1024);
    println!("|  L2 Size:     {:<4} MB (shared)                          |", self.l2_size / (1024 * 1024));
    if cfg.int4_macs > 0 {
      println!("|  INT4 MACs:   {:<6} /cycle                             |", cfg.int4_macs);
      println!("|  INT8 MACs:   {:<6} /cycle                             |", cfg.int8_macs);
      println!("|  FP16 MACs:   {:<6} /cycle                             |", cfg.fp16_macs);
    }
    println!("+---------------------------------------------------------+");
    println!("|  Socket:      {:<39}  |", self.socket_path);
    println!("|  Tiling:      {:<8}                                  |", if self.config.tiling { "enabled" } else { "disabled" });
    println!("|  Timing:      {:<8}                                  |", if self.config.timing { "enabled" } else { "disabled" });
    println!("|  Verbose:     {:<8}                                  |", if self.config.verbose { "enabled" } else { "disabled" });
    println!("+---------------------------------------------------------+");
    println!();
  }

  /// Serve clients until shutdown is requested
  pub fn run(&mut self) -> io::Result<()> {
    self.print_banner();

    while !self.shutdown.load(Ordering::Relaxed) {
      match self.serve_one() {
        Ok(()) => {},
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => {
          if self.shutdown.load(Ordering::Relaxed) {
            break;
          }
          error!("accept failed: {}", e);
          break;
        },
      }
    }

    info!("server shutting down");
    Ok(())
  }

  /// Accept and serve a single client session
  pub fn serve_one(&mut self) -> io::Result<()> {
    let (mut stream, _) = self.listener.accept()?;
    if self.shutdown.load(Ordering::Relaxed) {
      return Ok(());
    }

    info!("client connected");
    if let Err(e) = self.serve_client(&mut stream) {
      warn!("client session ended: {}", e);
    }
    info!("client disconnected (matmul ops: {})", self.total_matmul_ops);

    // drop any session state the client left behind
    self.end_session();
    Ok(())
  }

  fn end_session(&mut self) {
    self.shm = None;
    self.buffers.clear();
    self.mem.reset();
    self.dma.reset_stats();
  }

  fn serve_client(&mut self, stream: &mut UnixStream) -> io::Result<()> {
    loop {
      if self.shutdown.load(Ordering::Relaxed) {
        return Ok(());
      }

      // a short read here is the peer disconnecting
      let hdr: MsgHeader = read_struct(stream)?;

      // protocol corruption closes the connection without a reply
      hdr.validate()?;

      let cmd_tag = hdr.cmd;
      let cmd = match Cmd::from_u8(cmd_tag) {
        Some(cmd) => cmd,
        None => {
          error!("unknown command: 0x{:02x}", cmd_tag);
          return Err(io::Error::new(io::ErrorKind::InvalidData, "unknown command"));
        },
      };

      match cmd {
        Cmd::Hello => self.handle_hello(stream, &hdr)?,
        Cmd::Goodbye => {
          self.handle_goodbye(stream, &hdr)?;
          return Ok(());
        },
        Cmd::Ping => self.handle_ping(stream, &hdr)?,
        Cmd::RegisterBuffer => self.handle_register_buffer(stream, &hdr)?,
        Cmd::UnregisterBuffer => self.handle_unregister_buffer(stream, &hdr)?,
        Cmd::Matmul => self.handle_matmul(stream, &hdr)?,
        Cmd::Sync => self.handle_sync(stream, &hdr)?,
        Cmd::FenceCreate => self.handle_fence_create(stream, &hdr)?,
        Cmd::FenceDestroy => self.handle_fence_destroy(stream, &hdr)?,
        Cmd::FenceWait => self.handle_fence_wait(stream, &hdr)?,
      }
    }
  }

  fn respond<T: Copy>(&mut self, stream: &mut UnixStream, cmd: Cmd, seq_id: u32, rsp: &T) -> io::Result<()> {
    let hdr = MsgHeader::new(cmd, seq_id, payload_size::<T>());
    write_struct(stream, &hdr)?;
    write_struct(stream, rsp)
  }

  fn handle_hello(&mut self, stream: &mut UnixStream, hdr: &MsgHeader) -> io::Result<()> {
    let seq = hdr.seq_id;
    let req: HelloReq = read_struct(stream)?;
    let shm_name = req.shm_name_str();
    let (ver_major, ver_minor) = (req.version_major, req.version_minor);
    let shm_size = req.shm_size;

    if self.trace.enabled(TRACE_COMMANDS) {
      let details = json!({
        "version": format!("{}.{}", ver_major, ver_minor),
        "shm_name": shm_name,
        "shm_size": shm_size,
      });
      self.trace.command(TraceEvent::Hello, seq, STATUS_REQ, Some(details));
    }

    info!("HELLO from client v{}.{}, shm={} size={}", ver_major, ver_minor, shm_name, shm_size);

    let mut status = Status::Ok;
    if ver_major != NPM_EMU_VERSION_MAJOR {
      status = Status::VersionMismatch;
    } else {
      match ShmRegion::attach(&shm_name, shm_size as usize) {
        Ok(region) => self.shm = Some(region),
        Err(e) => {
          error!("failed to attach shm {}: {}", shm_name, e);
          status = Status::Error;
        },
      }
    }

    let rsp = HelloRsp {
      status: status as u8,
      version_major: NPM_EMU_VERSION_MAJOR,
      version_minor: NPM_EMU_VERSION_MINOR,
      reserved: 0,
      sku: self.sku as u32,
      num_engines: self.num_engines as u32,
      l1_size: self.l1_size as u64,
      l2_size: self.l2_size as u64,
    };
    self.respond(stream, Cmd::Hello, seq, &rsp)?;

    if self.trace.enabled(TRACE_COMMANDS) {
      let details = json!({
        "sku": self.sku.name(),
        "engines": self.num_engines,
        "l1_size": self.l1_size,
        "l2_size": self.l2_size,
      });
      self.trace.command(TraceEvent::Hello, seq, status.name(), Some(details));
    }
    Ok(())
  }

  fn handle_goodbye(&mut self, stream: &mut UnixStream, hdr: &MsgHeader) -> io::Result<()> {
    let seq = hdr.seq_id;
    if self.trace.enabled(TRACE_COMMANDS) {
      self.trace.command(TraceEvent::Goodbye, seq, STATUS_REQ, None);
    }
    info!("GOODBYE from client");

    self.end_session();

    let rsp = GoodbyeRsp {
      status: Status::Ok as u8,
      reserved: [0; 3],
    };
    self.respond(stream, Cmd::Goodbye, seq, &rsp)?;

    if self.trace.enabled(TRACE_COMMANDS) {
      self.trace.command(TraceEvent::Goodbye, seq, Status::Ok.name(), None);
    }
    Ok(())
  }

  fn handle_ping(&mut self, stream: &mut UnixStream, hdr: &MsgHeader) -> io::Result<()> {
    let seq = hdr.seq_id;
    let req: PingReq = read_struct(stream)?;
    let (echo_data, client_timestamp) = (req.echo_data, req.timestamp);

    if self.trace.enabled(TRACE_COMMANDS) {
      let details = json!({
        "echo_data": format!("0x{:016x}", echo_data),
        "timestamp": client_timestamp,
      });
      self.trace.command(TraceEvent::Ping, seq, STATUS_REQ, Some(details));
    }

    let server_timestamp = self.start.elapsed().as_nanos() as u64;
    let rsp = PingRsp {
      status: Status::Ok as u8,
      reserved: [0; 3],
      client_timestamp,
      server_timestamp,
      echo_data,
    };
    self.respond(stream, Cmd::Ping, seq, &rsp)?;

    if self.trace.enabled(TRACE_COMMANDS) {
      let details = json!({
        "client_timestamp": client_timestamp,
        "server_timestamp": server_timestamp,
        "echo_data": format!("0x{:016x}", echo_data),
      });
      self.trace.command(TraceEvent::Ping, seq, Status::Ok.name(), Some(details));
    }
    Ok(())
  }

  fn handle_register_buffer(&mut self, stream: &mut UnixStream, hdr: &MsgHeader) -> io::Result<()> {
    let seq = hdr.seq_id;
    let req: RegisterBufferReq = read_struct(stream)?;
    let (shm_offset, size, flags) = (req.shm_offset, req.size, req.flags);

    if self.trace.enabled(TRACE_COMMANDS) {
      let details = json!({
        "shm_offset": shm_offset,
        "size": size,
        "flags": format!("0x{:x}", flags),
      });
      self.trace.command(TraceEvent::RegisterBuffer, seq, STATUS_REQ, Some(details));
    }

    let handle = self.next_handle;
    self.next_handle += 1;
    self.buffers.insert(
      handle,
      BufferEntry {
        shm_offset: shm_offset as usize,
        size: size as usize,
        flags,
      },
    );

    info!("REGISTER_BUFFER offset={} size={} -> handle={}", shm_offset, size, handle);

    let rsp = RegisterBufferRsp {
      status: Status::Ok as u8,
      reserved: [0; 3],
      handle,
    };
    self.respond(stream, Cmd::RegisterBuffer, seq, &rsp)?;

    if self.trace.enabled(TRACE_COMMANDS) {
      self.trace.command(
        TraceEvent::RegisterBuffer,
        seq,
        Status::Ok.name(),
        Some(json!({ "handle": handle })),
      );
    }
    Ok(())
  }

  fn handle_unregister_buffer(&mut self, stream: &mut UnixStream, hdr: &MsgHeader) -> io::Result<()> {
    let seq = hdr.seq_id;
    let req: UnregisterBufferReq = read_struct(stream)?;
    let handle = req.handle;

    if self.trace.enabled(TRACE_COMMANDS) {
      self.trace.command(
        TraceEvent::UnregisterBuffer,
        seq,
        STATUS_REQ,
        Some(json!({ "handle": handle })),
      );
    }

    // idempotent: unknown handles still succeed
    self.buffers.remove(&handle);
    info!("UNREGISTER_BUFFER handle={}", handle);

    let rsp = UnregisterBufferRsp {
      status: Status::Ok as u8,
      reserved: [0; 3],
    };
    self.respond(stream, Cmd::UnregisterBuffer, seq, &rsp)?;

    if self.trace.enabled(TRACE_COMMANDS) {
      self.trace.command(TraceEvent::UnregisterBuffer, seq, Status::Ok.name(), None);
    }
    Ok(())
  }

  /// Absolute shm offset and remaining room for (handle, offset), or None
  /// when the handle is unknown or the offset is out of range
  fn resolve(&self, handle: u64, offset: u64) -> Option<(usize, usize)> {
    let entry = self.buffers.get(&handle)?;
    let offset = offset as usize;
    if offset >= entry.size {
      return None;
    }
    Some((entry.shm_offset + offset, entry.size - offset))
  }

  fn buffer_size(&self, handle: u64) -> usize {
    self.buffers.get(&handle).map_or(0, |b| b.size)
  }

  fn handle_matmul(&mut self, stream: &mut UnixStream, hdr: &MsgHeader) -> io::Result<()> {
    let seq = hdr.seq_id;
    let req: MatmulReq = read_struct(stream)?;
    let (m, n, k) = (req.m, req.n, req.k);
    let (a_handle, b_handle, c_handle) = (req.a_handle, req.b_handle, req.c_handle);

    if self.trace.enabled(TRACE_COMMANDS) {
      let details = json!({
        "M": m, "N": n, "K": k,
        "a_handle": a_handle, "b_handle": b_handle, "c_handle": c_handle,
        "a_size": self.buffer_size(a_handle),
        "b_size": self.buffer_size(b_handle),
        "c_size": self.buffer_size(c_handle),
        "destination": "NPM",
      });
      self.trace.command(TraceEvent::Matmul, seq, STATUS_REQ, Some(details));
    }

    info!(
      "MATMUL M={} N={} K={} (tiling={}, timing={})",
      m,
      n,
      k,
      if self.config.tiling { "on" } else { "off" },
      if self.config.timing { "on" } else { "off" }
    );

    let tile_size = if self.config.tiling {
      calculate_tile_size(self.l1_size)
    } else {
      0
    };

    if self.trace.enabled(TRACE_OPS) {
      let details = json!({
        "tiling": self.config.tiling,
        "timing": self.config.timing,
        "tile_size": tile_size,
        "l1_size": self.l1_size,
        "l2_size": self.l2_size,
      });
      self.trace.op(TraceEvent::MatmulStart, m, n, k, 0, Some(details));
    }

    let (status, cycles, dma_bytes) = self.execute_matmul(&req, tile_size);
    if status == Status::Ok {
      self.total_matmul_ops += 1;
    }

    let rsp = MatmulRsp {
      status: status as u8,
      reserved: [0; 3],
      cycles,
      dma_bytes,
    };
    self.respond(stream, Cmd::Matmul, seq, &rsp)?;

    if self.trace.enabled(TRACE_COMMANDS) {
      let details = json!({ "cycles": cycles, "dma_bytes": dma_bytes });
      self.trace.command(TraceEvent::Matmul, seq, status.name(), Some(details));
    }
    Ok(())
  }

  fn execute_matmul(&mut self, req: &MatmulReq, tile_size: usize) -> (Status, u64, u64) {
    if req.m <= 0 || req.n <= 0 || req.k <= 0 || req.lda <= 0 || req.ldb <= 0 || req.ldc <= 0 {
      return (Status::InvalidParams, 0, 0);
    }

    let (m, n, k) = (req.m as usize, req.n as usize, req.k as usize);
    let (lda, ldb, ldc) = (req.lda as usize, req.ldb as usize, req.ldc as usize);

    let a_count = (m - 1) * lda + k;
    let b_count = (n - 1) * ldb + k;
    let c_count = (m - 1) * ldc + n;

    // resolve buffer handles against the attached region
    let resolved = (
      self.resolve(req.a_handle, req.a_offset),
      self.resolve(req.b_handle, req.b_offset),
      self.resolve(req.c_handle, req.c_offset),
    );
    let ((a_abs, a_room), (b_abs, b_room), (c_abs, c_room)) = match resolved {
      (Some(a), Some(b), Some(c)) => (a, b, c),
      _ => return (Status::InvalidHandle, 0, 0),
    };
    if a_count * 4 > a_room || b_count * 4 > b_room || c_count * 4 > c_room {
      return (Status::InvalidHandle, 0, 0);
    }
    if a_abs % 4 != 0 || b_abs % 4 != 0 || c_abs % 4 != 0 {
      return (Status::InvalidParams, 0, 0);
    }

    let shm = match self.shm.as_mut() {
      Some(shm) => shm,
      None => return (Status::Error, 0, 0),
    };
    let base = shm.as_mut_ptr();

    // Registered regions come from the client's bump allocator and do not
    // overlap; both peers honour registered bounds by protocol.
    let (a, b, c) = unsafe {
      (
        std::slice::from_raw_parts(base.add(a_abs) as *const f32, a_count),
        std::slice::from_raw_parts(base.add(b_abs) as *const f32, b_count),
        std::slice::from_raw_parts_mut(base.add(c_abs) as *mut f32, c_count),
      )
    };

    if tile_size > 0 {
      let sku_cfg = sku_config(self.sku);
      let fp32_macs_per_cycle = if sku_cfg.fp16_macs > 0 {
        sku_cfg.fp16_macs / 2
      } else {
        2000
      };

      self.dma.reset_stats();

      let outcome = run_tiled_matmul(
        req,
        a,
        b,
        c,
        &mut self.mem,
        &mut self.dma,
        &mut self.trace,
        tile_size,
        fp32_macs_per_cycle,
        self.config.timing,
      );

      info!(
        "MATMUL tiled: {} bytes DMA, tile={}, L2 hits={}, misses={}, cycles={}",
        outcome.dma_bytes, tile_size, outcome.l2_hits, outcome.l2_misses, outcome.cycles
      );

      (Status::Ok, outcome.cycles, outcome.dma_bytes)
    } else {
      // C = A * B^T, A: (M, K), B: (N, K), C: (M, N)
      for mi in 0..m {
        for ni in 0..n {
          let mut sum = 0.0f32;
          for ki in 0..k {
            sum += a[mi * lda + ki] * b[ni * ldb + ki];
          }
          c[mi * ldc + ni] = sum;
        }
      }
      (Status::Ok, 0, 0)
    }
  }

  fn handle_sync(&mut self, stream: &mut UnixStream, hdr: &MsgHeader) -> io::Result<()> {
    let seq = hdr.seq_id;
    if self.trace.enabled(TRACE_COMMANDS) {
      self.trace.command(TraceEvent::Sync, seq, STATUS_REQ, None);
    }

    // all work completes synchronously, nothing to wait for
    let rsp = SyncRsp {
      status: Status::Ok as u8,
      reserved: [0; 3],
    };
    self.respond(stream, Cmd::Sync, seq, &rsp)?;

    if self.trace.enabled(TRACE_COMMANDS) {
      self.trace.command(TraceEvent::Sync, seq, Status::Ok.name(), None);
    }
    Ok(())
  }

  fn handle_fence_create(&mut self, stream: &mut UnixStream, hdr: &MsgHeader) -> io::Result<()> {
    let seq = hdr.seq_id;
    if self.trace.enabled(TRACE_COMMANDS) {
      self.trace.command(TraceEvent::FenceCreate, seq, STATUS_REQ, None);
    }

    let fence_id = self.next_fence_id;
    self.next_fence_id += 1;

    let rsp = FenceCreateRsp {
      status: Status::Ok as u8,
      reserved: [0; 3],
      fence_id,
    };
    self.respond(stream, Cmd::FenceCreate, seq, &rsp)?;

    if self.trace.enabled(TRACE_COMMANDS) {
      self.trace.command(
        TraceEvent::FenceCreate,
        seq,
        Status::Ok.name(),
        Some(json!({ "fence_id": fence_id })),
      );
    }
    Ok(())
  }

  fn handle_fence_destroy(&mut self, stream: &mut UnixStream, hdr: &MsgHeader) -> io::Result<()> {
    let seq = hdr.seq_id;
    let req: FenceDestroyReq = read_struct(stream)?;
    let fence_id = req.fence_id;

    if self.trace.enabled(TRACE_COMMANDS) {
      self.trace.command(
        TraceEvent::FenceDestroy,
        seq,
        STATUS_REQ,
        Some(json!({ "fence_id": fence_id })),
      );
    }

    let rsp = FenceDestroyRsp {
      status: Status::Ok as u8,
      reserved: [0; 3],
    };
    self.respond(stream, Cmd::FenceDestroy, seq, &rsp)?;

    if self.trace.enabled(TRACE_COMMANDS) {
      self.trace.command(TraceEvent::FenceDestroy, seq, Status::Ok.name(), None);
    }
    Ok(())
  }

  fn handle_fence_wait(&mut self, stream: &mut UnixStream, hdr: &MsgHeader) -> io::Result<()> {
    let seq = hdr.seq_id;
    let req: FenceWaitReq = read_struct(stream)?;
    let (fence_id, timeout_ns) = (req.fence_id, req.timeout_ns);

    if self.trace.enabled(TRACE_COMMANDS) {
      let details = json!({ "fence_id": fence_id, "timeout_ns": timeout_ns });
      self.trace.command(TraceEvent::FenceWait, seq, STATUS_REQ, Some(details));
    }

    // fences signal immediately; the timeout is carried for future use
    let rsp = FenceWaitRsp {
      status: Status::Ok as u8,
      reserved: [0; 3],
    };
    self.respond(stream, Cmd::FenceWait, seq, &rsp)?;

    if self.trace.enabled(TRACE_COMMANDS) {
      self.trace.command(TraceEvent::FenceWait, seq, Status::Ok.name(), None);
    }
    Ok(())
  }
}

impl Drop for EmuServer {
  fn drop(&mut self) {
    let _ = fs::remove_file(&self.socket_path);
  }
}

/// Derive the square tile side from L1 capacity: three FP32 tiles (A, B and
/// the C accumulator) must fit. Rounded down to a power of two, minimum 32.
pub fn calculate_tile_size(l1_size: usize) -> usize {
  let elements = l1_size / 4;
  let tile_elements = elements / 3;
  let tile = (tile_elements as f64).sqrt() as usize;
  let tile = tile.max(32);

  let mut pot = 1;
  while pot * 2 <= tile {
    pot *= 2;
  }
  pot
}

pub(crate) struct TiledOutcome {
  pub cycles: u64,
  pub dma_bytes: u64,
  pub l2_hits: u64,
  pub l2_misses: u64,
}

fn f32_bytes(s: &[f32]) -> &[u8] {
  unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, s.len() * 4) }
}

/// Run a transfer through the DMA model and emit its trace event.
/// `engine_id` is -1 for system DMA, the engine index for L1 DMA.
fn issue_dma(dma: &mut DmaModel, trace: &mut TraceEmitter, kind: DmaKind, bytes: usize, engine_id: i32) {
  let cycles = dma.transfer(kind, bytes, engine_id.max(0) as usize);
  if trace.enabled(TRACE_DMA) {
    trace.dma(kind.trace_event(), bytes as u64, cycles, engine_id);
  }
}

/// Tiled matmul: iterate (m, n) output tiles, accumulate over k tiles, and
/// drive the memory hierarchy and DMA models per tile. The A and B fetches
/// are staged DDR -> L2 (DMA only on a miss) and always re-fetched L2 -> L1;
/// the C tile is written back L1 -> L2 -> DDR after its k loop. All work runs
/// on engine 0.
#[allow(clippy::too_many_arguments)]
pub(crate) fn run_tiled_matmul(
  req: &MatmulReq,
  a: &[f32],
  b: &[f32],
  c: &mut [f32],
  mem: &mut MemoryHierarchy,
  dma: &mut DmaModel,
  trace: &mut TraceEmitter,
  tile_size: usize,
  fp32_macs_per_cycle: u64,
  timing: bool,
) -> TiledOutcome {
  let (m, n, k) = (req.m as usize, req.n as usize, req.k as usize);
  let (lda, ldb, ldc) = (req.lda as usize, req.ldb as usize, req.ldc as usize);
  let (a_handle, b_handle) = ({ req.a_handle }, { req.b_handle });

  let l2_hits_before = mem.l2_hits();
  let l2_misses_start = mem.l2_misses();

  if trace.enabled(TRACE_OPS) {
    let num_m_tiles = m.div_ceil(tile_size);
    let num_n_tiles = n.div_ceil(tile_size);
    let num_k_tiles = k.div_ceil(tile_size);
    let details = json!({
      "tile_size": tile_size,
      "num_m_tiles": num_m_tiles,
      "num_n_tiles": num_n_tiles,
      "num_k_tiles": num_k_tiles,
      "total_tiles": num_m_tiles * num_n_tiles,
      "a_total_bytes": m * k * 4,
      "b_total_bytes": n * k * 4,
      "c_total_bytes": m * n * 4,
    });
    trace.op(TraceEvent::TilingPlan, m as i64, n as i64, k as i64, 0, Some(details));
  }

  for m_tile in (0..m).step_by(tile_size) {
    for n_tile in (0..n).step_by(tile_size) {
      let actual_m = tile_size.min(m - m_tile);
      let actual_n = tile_size.min(n - n_tile);

      // initialize the C sub-tile
      for mi in 0..actual_m {
        for ni in 0..actual_n {
          c[(m_tile + mi) * ldc + (n_tile + ni)] = 0.0;
        }
      }

      // accumulate over K tiles
      for k_tile in (0..k).step_by(tile_size) {
        let actual_k = tile_size.min(k - k_tile);

        // tile byte extents for cache tracking, keyed on the tile start
        let a_start = m_tile * lda + k_tile;
        let a_tile_offset = a_start * 4;
        let a_tile_bytes = actual_m * actual_k * 4;

        let b_start = n_tile * ldb + k_tile;
        let b_tile_offset = b_start * 4;
        let b_tile_bytes = actual_n * actual_k * 4;

        // stage A: DDR -> L2 on miss, then always L2 -> L1
        let misses_before = mem.l2_misses();
        mem.stage_to_l2(a_handle, a_tile_offset, a_tile_bytes, f32_bytes(&a[a_start..]));
        let a_l2_miss = mem.l2_misses() > misses_before;
        if a_l2_miss {
          issue_dma(dma, trace, DmaKind::DdrToL2, a_tile_bytes, -1);
        }
        mem.stage_to_l1(0, a_handle, a_tile_offset, a_tile_bytes);
        issue_dma(dma, trace, DmaKind::L2ToL1, a_tile_bytes, 0);

        // stage B the same way
        let misses_before = mem.l2_misses();
        mem.stage_to_l2(b_handle, b_tile_offset, b_tile_bytes, f32_bytes(&b[b_start..]));
        let b_l2_miss = mem.l2_misses() > misses_before;
        if b_l2_miss {
          issue_dma(dma, trace, DmaKind::DdrToL2, b_tile_bytes, -1);
        }
        mem.stage_to_l1(0, b_handle, b_tile_offset, b_tile_bytes);
        issue_dma(dma, trace, DmaKind::L2ToL1, b_tile_bytes, 0);

        // C_tile += A_tile * B_tile^T
        for mi in 0..actual_m {
          for ni in 0..actual_n {
            let mut sum = 0.0f32;
            for ki in 0..actual_k {
              sum += a[(m_tile + mi) * lda + (k_tile + ki)] * b[(n_tile + ni) * ldb + (k_tile + ki)];
            }
            c[(m_tile + mi) * ldc + (n_tile + ni)] += sum;
          }
        }

        let mut compute_cycles = 0u64;
        if timing {
          let ops = 2 * actual_m as u64 * actual_n as u64 * actual_k as u64;
          compute_cycles = ops.div_ceil(fp32_macs_per_cycle);
          dma.advance_cycles(compute_cycles);
        }

        if trace.enabled(TRACE_OPS) {
          let details = json!({
            "m_off": m_tile, "n_off": n_tile, "k_off": k_tile,
            "actual_m": actual_m, "actual_n": actual_n, "actual_k": actual_k,
            "a_tile_bytes": a_tile_bytes, "b_tile_bytes": b_tile_bytes,
            "a_l2_hit": !a_l2_miss, "b_l2_hit": !b_l2_miss,
          });
          trace.op(
            TraceEvent::MatmulTile,
            actual_m as i64,
            actual_n as i64,
            actual_k as i64,
            compute_cycles,
            Some(details),
          );
        }
      }

      // C tile writeback: L1 -> L2 -> DDR
      let c_tile_bytes = actual_m * actual_n * 4;
      issue_dma(dma, trace, DmaKind::L1ToL2, c_tile_bytes, 0);
      issue_dma(dma, trace, DmaKind::L2ToDdr, c_tile_bytes, -1);
    }
  }

  let outcome = TiledOutcome {
    cycles: if timing { dma.current_cycle() } else { 0 },
    dma_bytes: dma.total_bytes(),
    l2_hits: mem.l2_hits() - l2_hits_before,
    l2_misses: mem.l2_misses() - l2_misses_start,
  };

  if trace.enabled(TRACE_OPS) {
    let details = json!({
      "l2_hits": outcome.l2_hits,
      "l2_misses": outcome.l2_misses,
      "total_dma_bytes": outcome.dma_bytes,
      "tile_size": tile_size,
    });
    trace.op(TraceEvent::MatmulEnd, m as i64, n as i64, k as i64, outcome.cycles, Some(details));
  }

  outcome
}
