//! Structured trace emitter.
//!
//! Events are single JSON objects, one per line, on stdout or a trace file.
//! Producers check `enabled` before formatting details so disabled categories
//! cost a single bit test.
//!
//! Schema:
//!   command: {"ts":123,"cat":"cmd","type":"MATMUL","seq":42,"status":"OK","details":{...}}
//!   dma:     {"ts":123,"cat":"dma","type":"DDR_TO_L2","bytes":4096,"cycles":64,"engine":-1}
//!   op:      {"ts":123,"cat":"op","type":"MATMUL_END","M":64,"N":128,"K":64,"cycles":8192}

use log::warn;
use serde_json::{json, Value};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::time::Instant;

pub const TRACE_NONE: u32 = 0;
pub const TRACE_COMMANDS: u32 = 1 << 0;
pub const TRACE_DMA: u32 = 1 << 1;
pub const TRACE_OPS: u32 = 1 << 2;
pub const TRACE_ALL: u32 = u32::MAX;

/// Status string used for the request side of a command pair
pub const STATUS_REQ: &str = "REQ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
  // commands (request/response pairs)
  Hello,
  Goodbye,
  Ping,
  RegisterBuffer,
  UnregisterBuffer,
  Matmul,
  Sync,
  FenceCreate,
  FenceDestroy,
  FenceWait,
  // DMA transfers
  DdrToL2,
  L2ToDdr,
  L2ToL1,
  L1ToL2,
  // compute operations
  MatmulStart,
  MatmulTile,
  MatmulEnd,
  TilingPlan,
}

impl TraceEvent {
  pub fn name(&self) -> &'static str {
    match self {
      TraceEvent::Hello => "HELLO",
      TraceEvent::Goodbye => "GOODBYE",
      TraceEvent::Ping => "PING",
      TraceEvent::RegisterBuffer => "REGISTER_BUFFER",
      TraceEvent::UnregisterBuffer => "UNREGISTER_BUFFER",
      TraceEvent::Matmul => "MATMUL",
      TraceEvent::Sync => "SYNC",
      TraceEvent::FenceCreate => "FENCE_CREATE",
      TraceEvent::FenceDestroy => "FENCE_DESTROY",
      TraceEvent::FenceWait => "FENCE_WAIT",
      TraceEvent::DdrToL2 => "DDR_TO_L2",
      TraceEvent::L2ToDdr => "L2_TO_DDR",
      TraceEvent::L2ToL1 => "L2_TO_L1",
      TraceEvent::L1ToL2 => "L1_TO_L2",
      TraceEvent::MatmulStart => "MATMUL_START",
      TraceEvent::MatmulTile => "MATMUL_TILE",
      TraceEvent::MatmulEnd => "MATMUL_END",
      TraceEvent::TilingPlan => "TILING_PLAN",
    }
  }
}

pub struct TraceEmitter {
  categories: u32,
  out: Box<dyn Write + Send>,
  flush_immediate: bool,
  start: Instant,
}

impl TraceEmitter {
  /// Create an emitter writing to `trace_file`, or stdout when the path is
  /// empty. An unopenable file degrades to stdout with a warning.
  pub fn new(categories: u32, trace_file: &str, flush_immediate: bool) -> Self {
    let out: Box<dyn Write + Send> = if trace_file.is_empty() {
      Box::new(io::stdout())
    } else {
      match File::create(trace_file) {
        Ok(f) => Box::new(BufWriter::new(f)),
        Err(e) => {
          warn!("could not open trace file {}: {}, using stdout", trace_file, e);
          Box::new(io::stdout())
        },
      }
    };
    Self::with_writer(categories, out, flush_immediate)
  }

  pub fn with_writer(categories: u32, out: Box<dyn Write + Send>, flush_immediate: bool) -> Self {
    Self {
      categories,
      out,
      flush_immediate,
      start: Instant::now(),
    }
  }

  /// O(1) category test; call before formatting details
  pub fn enabled(&self, category: u32) -> bool {
    self.categories & category != 0
  }

  fn relative_ts(&self) -> u64 {
    self.start.elapsed().as_nanos() as u64
  }

  fn emit(&mut self, value: Value) {
    if writeln!(self.out, "{}", value).is_err() {
      return;
    }
    if self.flush_immediate {
      let _ = self.out.flush();
    }
  }

  /// Trace an IPC command. `status` is a status-code name, or [`STATUS_REQ`]
  /// for the request side.
  pub fn command(&mut self, event: TraceEvent, seq_id: u32, status: &str, details: Option<Value>) {
    if !self.enabled(TRACE_COMMANDS) {
      return;
    }
    let mut obj = json!({
      "ts": self.relative_ts(),
      "cat": "cmd",
      "type": event.name(),
      "seq": seq_id,
      "status": status,
    });
    if let Some(details) = details {
      obj["details"] = details;
    }
    self.emit(obj);
  }

  /// Trace a DMA transfer. `engine_id` is -1 for system DMA.
  pub fn dma(&mut self, event: TraceEvent, bytes: u64, cycles: u64, engine_id: i32) {
    if !self.enabled(TRACE_DMA) {
      return;
    }
    let obj = json!({
      "ts": self.relative_ts(),
      "cat": "dma",
      "type": event.name(),
      "bytes": bytes,
      "cycles": cycles,
      "engine": engine_id,
    });
    self.emit(obj);
  }

  /// Trace a compute operation
  pub fn op(&mut self, event: TraceEvent, m: i64, n: i64, k: i64, cycles: u64, details: Option<Value>) {
    if !self.enabled(TRACE_OPS) {
      return;
    }
    let mut obj = json!({
      "ts": self.relative_ts(),
      "cat": "op",
      "type": event.name(),
      "M": m,
      "N": n,
      "K": k,
      "cycles": cycles,
    });
    if let Some(details) = details {
      obj["details"] = details;
    }
    self.emit(obj);
  }

  pub fn flush(&mut self) {
    let _ = self.out.flush();
  }
}

impl Drop for TraceEmitter {
  fn drop(&mut self) {
    let _ = self.out.flush();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Mutex};

  #[derive(Clone)]
  struct SharedBuf(Arc<Mutex<Vec<u8>>>);

  impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }

  fn capture(categories: u32) -> (TraceEmitter, SharedBuf) {
    let buf = SharedBuf(Arc::new(Mutex::new(Vec::new())));
    let emitter = TraceEmitter::with_writer(categories, Box::new(buf.clone()), true);
    (emitter, buf)
  }

  fn lines(buf: &SharedBuf) -> Vec<Value> {
    let raw = buf.0.lock().unwrap().clone();
    String::from_utf8(raw)
      .unwrap()
      .lines()
      .map(|l| serde_json::from_str(l).unwrap())
      .collect()
  }

  #[test]
  fn category_bits() {
    let (emitter, _) = capture(TRACE_COMMANDS | TRACE_OPS);
    assert!(emitter.enabled(TRACE_COMMANDS));
    assert!(emitter.enabled(TRACE_OPS));
    assert!(!emitter.enabled(TRACE_DMA));

    let (emitter, _) = capture(TRACE_ALL);
    assert!(emitter.enabled(TRACE_DMA));
  }

  #[test]
  fn disabled_category_emits_nothing() {
    let (mut emitter, buf) = capture(TRACE_COMMANDS);
    emitter.dma(TraceEvent::DdrToL2, 4096, 64, -1);
    assert!(lines(&buf).is_empty());
  }

  #[test]
  fn command_event_shape() {
    let (mut emitter, buf) = capture(TRACE_COMMANDS);
    emitter.command(TraceEvent::Hello, 1, STATUS_REQ, Some(json!({"shm_size": 1024})));
    emitter.command(TraceEvent::Hello, 1, "OK", None);

    let events = lines(&buf);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["cat"], "cmd");
    assert_eq!(events[0]["type"], "HELLO");
    assert_eq!(events[0]["seq"], 1);
    assert_eq!(events[0]["status"], "REQ");
    assert_eq!(events[0]["details"]["shm_size"], 1024);
    assert_eq!(events[1]["status"], "OK");
    assert!(events[1].get("details").is_none());
  }

  #[test]
  fn dma_and_op_event_shape() {
    let (mut emitter, buf) = capture(TRACE_DMA | TRACE_OPS);
    emitter.dma(TraceEvent::L2ToL1, 4096, 33, 0);
    emitter.op(TraceEvent::MatmulEnd, 64, 128, 64, 8192, None);

    let events = lines(&buf);
    assert_eq!(events[0]["cat"], "dma");
    assert_eq!(events[0]["type"], "L2_TO_L1");
    assert_eq!(events[0]["bytes"], 4096);
    assert_eq!(events[0]["engine"], 0);
    assert_eq!(events[1]["cat"], "op");
    assert_eq!(events[1]["M"], 64);
    assert_eq!(events[1]["cycles"], 8192);
  }

  #[test]
  fn timestamps_are_monotonic() {
    let (mut emitter, buf) = capture(TRACE_OPS);
    emitter.op(TraceEvent::MatmulStart, 1, 1, 1, 0, None);
    emitter.op(TraceEvent::MatmulEnd, 1, 1, 1, 0, None);
    let events = lines(&buf);
    let ts0 = events[0]["ts"].as_u64().unwrap();
    let ts1 = events[1]["ts"].as_u64().unwrap();
    assert!(ts1 >= ts0);
  }
}
