//! End-to-end client/server tests over a loopback Unix socket.

use npm_emu::config::EmuConfig;
use npm_emu::device::emulator::EmulatorDevice;
use npm_emu::device::{MatmulParams, NpmDevice};
use npm_emu::protocol::*;
use npm_emu::server::EmuServer;
use npm_emu::sku::{ElemType, Sku};
use std::io::Read;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use tempfile::TempDir;

// one server/client pair at a time: the client's shm name embeds the pid
static TEST_MUTEX: Mutex<()> = Mutex::new(());

const TEST_SHM_SIZE: usize = 4 * 1024 * 1024;

fn test_config(tiling: bool, timing: bool) -> EmuConfig {
  let mut config = EmuConfig::default();
  config.tiling = tiling;
  config.timing = timing;
  config
}

fn spawn_server(config: EmuConfig, sessions: usize) -> (TempDir, String, JoinHandle<()>) {
  let dir = TempDir::new().unwrap();
  let socket = dir.path().join("npm-emu-test.sock").to_string_lossy().to_string();
  let mut config = config;
  config.socket = socket.clone();

  let mut server = EmuServer::new(config).unwrap();
  let handle = thread::spawn(move || {
    for _ in 0..sessions {
      server.serve_one().unwrap();
    }
  });
  (dir, socket, handle)
}

fn reference_matmul(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
  let mut c = vec![0.0f32; m * n];
  for mi in 0..m {
    for ni in 0..n {
      let mut sum = 0.0f32;
      for ki in 0..k {
        sum += a[mi * k + ki] * b[ni * k + ki];
      }
      c[mi * n + ni] = sum;
    }
  }
  c
}

fn test_inputs(m: usize, n: usize, k: usize) -> (Vec<f32>, Vec<f32>) {
  let a: Vec<f32> = (0..m * k).map(|i| ((i * 31 % 100) as f32 - 50.0) / 100.0).collect();
  let b: Vec<f32> = (0..n * k).map(|i| ((i * 17 % 100) as f32 - 50.0) / 100.0).collect();
  (a, b)
}

fn fp32_params(a: u64, b: u64, c: u64, m: usize, n: usize, k: usize) -> MatmulParams {
  MatmulParams {
    a_handle: a,
    a_offset: 0,
    b_handle: b,
    b_offset: 0,
    c_handle: c,
    c_offset: 0,
    m: m as i64,
    n: n as i64,
    k: k as i64,
    lda: k as i64,
    ldb: k as i64,
    ldc: n as i64,
    type_a: ElemType::F32,
    type_b: ElemType::F32,
    type_c: ElemType::F32,
  }
}

#[test]
fn hello_handshake_reports_device_info() {
  let _guard = TEST_MUTEX.lock().unwrap();
  let (_dir, socket, handle) = spawn_server(test_config(false, false), 1);

  let mut dev = EmulatorDevice::connect_with(Some(&socket), TEST_SHM_SIZE).unwrap();
  assert_eq!(dev.sku(), Sku::Npm8k);
  assert_eq!(dev.num_engines(), 1);
  assert_eq!(dev.l1_size(), 1024 * 1024);
  assert_eq!(dev.l2_size(), 8 * 1024 * 1024);

  dev.shutdown();
  handle.join().unwrap();
}

#[test]
fn simple_matmul_over_ipc_matches_reference() {
  let _guard = TEST_MUTEX.lock().unwrap();
  let (_dir, socket, handle) = spawn_server(test_config(false, false), 1);

  let mut dev = EmulatorDevice::connect_with(Some(&socket), TEST_SHM_SIZE).unwrap();

  let (m, n, k) = (64, 128, 64);
  let (mut a, mut b) = test_inputs(m, n, k);
  let mut c = vec![0.0f32; m * n];
  let reference = reference_matmul(&a, &b, m, n, k);

  let ha = dev.register_buffer(a.as_mut_ptr() as *mut u8, a.len() * 4).unwrap();
  let hb = dev.register_buffer(b.as_mut_ptr() as *mut u8, b.len() * 4).unwrap();
  let hc = dev.register_buffer(c.as_mut_ptr() as *mut u8, c.len() * 4).unwrap();

  dev.matmul(&fp32_params(ha, hb, hc, m, n, k)).unwrap();
  for (got, want) in c.iter().zip(reference.iter()) {
    assert!((got - want).abs() < 1e-4);
  }

  // synchronization primitives all complete immediately
  dev.sync().unwrap();
  let fence = dev.fence_create().unwrap();
  dev.fence_wait(fence, 1_000_000).unwrap();
  dev.fence_destroy(fence);

  dev.shutdown();
  handle.join().unwrap();
}

#[test]
fn tiled_matmul_over_ipc_matches_reference() {
  let _guard = TEST_MUTEX.lock().unwrap();
  let (_dir, socket, handle) = spawn_server(test_config(true, true), 1);

  let mut dev = EmulatorDevice::connect_with(Some(&socket), TEST_SHM_SIZE).unwrap();

  // trailing tiles in every dimension
  let (m, n, k) = (65, 130, 65);
  let (mut a, mut b) = test_inputs(m, n, k);
  let mut c = vec![0.0f32; m * n];
  let reference = reference_matmul(&a, &b, m, n, k);

  let ha = dev.register_buffer(a.as_mut_ptr() as *mut u8, a.len() * 4).unwrap();
  let hb = dev.register_buffer(b.as_mut_ptr() as *mut u8, b.len() * 4).unwrap();
  let hc = dev.register_buffer(c.as_mut_ptr() as *mut u8, c.len() * 4).unwrap();

  // run twice back to back; the second run rides the warm L2
  dev.matmul(&fp32_params(ha, hb, hc, m, n, k)).unwrap();
  dev.matmul(&fp32_params(ha, hb, hc, m, n, k)).unwrap();

  for (i, (got, want)) in c.iter().zip(reference.iter()).enumerate() {
    assert!((got - want).abs() < 1e-4, "element {}: {} vs {}", i, got, want);
  }

  dev.shutdown();
  handle.join().unwrap();
}

#[test]
fn large_tiled_matmul_stays_within_tolerance() {
  let _guard = TEST_MUTEX.lock().unwrap();
  let (_dir, socket, handle) = spawn_server(test_config(true, true), 1);

  let mut dev = EmulatorDevice::connect_with(Some(&socket), TEST_SHM_SIZE).unwrap();

  let (m, n, k) = (256, 512, 256);
  let (mut a, mut b) = test_inputs(m, n, k);
  let mut c = vec![0.0f32; m * n];
  let reference = reference_matmul(&a, &b, m, n, k);

  let ha = dev.register_buffer(a.as_mut_ptr() as *mut u8, a.len() * 4).unwrap();
  let hb = dev.register_buffer(b.as_mut_ptr() as *mut u8, b.len() * 4).unwrap();
  let hc = dev.register_buffer(c.as_mut_ptr() as *mut u8, c.len() * 4).unwrap();

  dev.matmul(&fp32_params(ha, hb, hc, m, n, k)).unwrap();

  // tiled accumulation reassociates the K sum; inputs are within [-0.5, 0.5]
  let max_err = c
    .iter()
    .zip(reference.iter())
    .map(|(got, want)| (got - want).abs())
    .fold(0.0f32, f32::max);
  assert!(max_err < 1e-3, "max element error {}", max_err);

  dev.shutdown();
  handle.join().unwrap();
}

#[test]
fn update_buffer_refreshes_device_bytes() {
  let _guard = TEST_MUTEX.lock().unwrap();
  let (_dir, socket, handle) = spawn_server(test_config(false, false), 1);

  let mut dev = EmulatorDevice::connect_with(Some(&socket), TEST_SHM_SIZE).unwrap();

  let (m, n, k) = (2, 2, 2);
  let mut a = vec![1.0f32, 0.0, 0.0, 1.0];
  let mut b = vec![3.0f32, 0.0, 0.0, 3.0];
  let mut c = vec![0.0f32; 4];

  let ha = dev.register_buffer(a.as_mut_ptr() as *mut u8, 16).unwrap();
  let hb = dev.register_buffer(b.as_mut_ptr() as *mut u8, 16).unwrap();
  let hc = dev.register_buffer(c.as_mut_ptr() as *mut u8, 16).unwrap();

  dev.matmul(&fp32_params(ha, hb, hc, m, n, k)).unwrap();
  assert_eq!(c, [3.0, 0.0, 0.0, 3.0]);

  // modify the host activations and refresh the device copy in place
  a.copy_from_slice(&[2.0, 0.0, 0.0, 2.0]);
  dev.update_buffer(ha, a.as_ptr() as *const u8, 16).unwrap();
  dev.matmul(&fp32_params(ha, hb, hc, m, n, k)).unwrap();
  assert_eq!(c, [6.0, 0.0, 0.0, 6.0]);

  // growing past the registered size is rejected client-side
  assert!(dev.update_buffer(ha, a.as_ptr() as *const u8, 32).is_err());

  dev.shutdown();
  handle.join().unwrap();
}

#[test]
fn invalid_handle_leaves_session_usable() {
  let _guard = TEST_MUTEX.lock().unwrap();
  let (_dir, socket, handle) = spawn_server(test_config(false, false), 1);

  let mut dev = EmulatorDevice::connect_with(Some(&socket), TEST_SHM_SIZE).unwrap();

  let mut a = vec![1.0f32; 4];
  let ha = dev.register_buffer(a.as_mut_ptr() as *mut u8, 16).unwrap();

  // unknown output handle: the request fails but the connection survives
  assert!(dev.matmul(&fp32_params(ha, ha, 999, 2, 2, 2)).is_err());
  dev.sync().unwrap();

  // unregistering twice is fine (idempotent on the server)
  dev.unregister_buffer(ha);
  dev.unregister_buffer(ha);

  dev.shutdown();
  handle.join().unwrap();
}

#[test]
fn raw_ping_echoes_sequence_and_payload() {
  let _guard = TEST_MUTEX.lock().unwrap();
  let (_dir, socket, handle) = spawn_server(test_config(false, false), 1);

  let mut stream = UnixStream::connect(&socket).unwrap();

  for seq in [7u32, 8, 9] {
    let hdr = MsgHeader::new(Cmd::Ping, seq, payload_size::<PingReq>());
    let req = PingReq {
      echo_data: 0xDEAD_BEEF_0000_0000 | seq as u64,
      timestamp: 12345,
    };
    write_struct(&mut stream, &hdr).unwrap();
    write_struct(&mut stream, &req).unwrap();

    let rsp_hdr: MsgHeader = read_struct(&mut stream).unwrap();
    rsp_hdr.validate().unwrap();
    assert_eq!({ rsp_hdr.seq_id }, seq);
    assert_eq!({ rsp_hdr.cmd }, Cmd::Ping as u8);

    let rsp: PingRsp = read_struct(&mut stream).unwrap();
    assert_eq!({ rsp.status }, Status::Ok as u8);
    assert_eq!({ rsp.echo_data }, 0xDEAD_BEEF_0000_0000 | seq as u64);
    assert_eq!({ rsp.client_timestamp }, 12345);
  }

  // GOODBYE ends the session cleanly
  let hdr = MsgHeader::new(Cmd::Goodbye, 10, 0);
  write_struct(&mut stream, &hdr).unwrap();
  let rsp_hdr: MsgHeader = read_struct(&mut stream).unwrap();
  assert_eq!({ rsp_hdr.cmd }, Cmd::Goodbye as u8);
  let rsp: GoodbyeRsp = read_struct(&mut stream).unwrap();
  assert_eq!({ rsp.status }, Status::Ok as u8);

  handle.join().unwrap();
}

#[test]
fn bad_magic_closes_connection_without_reply() {
  let _guard = TEST_MUTEX.lock().unwrap();
  let (_dir, socket, handle) = spawn_server(test_config(false, false), 1);

  let mut stream = UnixStream::connect(&socket).unwrap();

  let mut hdr = MsgHeader::new(Cmd::Ping, 1, payload_size::<PingReq>());
  hdr.magic = 0x0BAD_0BAD;
  write_struct(&mut stream, &hdr).unwrap();
  let req = PingReq { echo_data: 0, timestamp: 0 };
  write_struct(&mut stream, &req).unwrap();

  // no reply: the next read sees the connection closed
  let mut buf = [0u8; 1];
  assert_eq!(stream.read(&mut buf).unwrap_or(0), 0);

  handle.join().unwrap();
}

#[test]
fn unknown_command_closes_connection() {
  let _guard = TEST_MUTEX.lock().unwrap();
  let (_dir, socket, handle) = spawn_server(test_config(false, false), 1);

  let mut stream = UnixStream::connect(&socket).unwrap();

  let mut hdr = MsgHeader::new(Cmd::Ping, 1, 0);
  hdr.cmd = 0x77;
  write_struct(&mut stream, &hdr).unwrap();

  let mut buf = [0u8; 1];
  assert_eq!(stream.read(&mut buf).unwrap_or(0), 0);

  handle.join().unwrap();
}

#[test]
fn server_survives_abrupt_disconnect() {
  let _guard = TEST_MUTEX.lock().unwrap();
  let (_dir, socket, handle) = spawn_server(test_config(false, false), 2);

  // first client drops without GOODBYE
  {
    let _stream = UnixStream::connect(&socket).unwrap();
  }

  // second client still gets served
  let mut dev = EmulatorDevice::connect_with(Some(&socket), TEST_SHM_SIZE).unwrap();
  assert_eq!(dev.num_engines(), 1);
  dev.shutdown();

  handle.join().unwrap();
}
