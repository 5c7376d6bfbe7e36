use npm_emu::device::{create_device, MatmulParams, NpmDevice};
use npm_emu::sku::{ElemType, Sku};

fn fp32_params(a: u64, b: u64, c: u64, m: i64, n: i64, k: i64) -> MatmulParams {
  MatmulParams {
    a_handle: a,
    a_offset: 0,
    b_handle: b,
    b_offset: 0,
    c_handle: c,
    c_offset: 0,
    m,
    n,
    k,
    lda: k,
    ldb: k,
    ldc: n,
    type_a: ElemType::F32,
    type_b: ElemType::F32,
    type_c: ElemType::F32,
  }
}

#[test]
fn factory_creates_mock() {
  let dev = create_device("mock").expect("mock device should always be available");
  assert_eq!(dev.sku(), Sku::Mock);
  assert_eq!(dev.num_engines(), 1);
  assert_eq!(dev.l1_size(), 1024 * 1024);
}

#[test]
fn hardware_is_recognized_but_unsupported() {
  let err = create_device("hardware").unwrap_err();
  assert_eq!(err.kind(), std::io::ErrorKind::Unsupported);
}

#[test]
fn bogus_device_type_is_rejected() {
  let err = create_device("bogus").unwrap_err();
  assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}

#[test]
fn mock_matmul_through_trait_object() {
  let mut dev = create_device("mock").unwrap();

  let mut a = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3
  let mut b = [1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0]; // 4x3
  let mut c = [0.0f32; 8];

  let ha = dev.register_buffer(a.as_mut_ptr() as *mut u8, a.len() * 4).unwrap();
  let hb = dev.register_buffer(b.as_mut_ptr() as *mut u8, b.len() * 4).unwrap();
  let hc = dev.register_buffer(c.as_mut_ptr() as *mut u8, c.len() * 4).unwrap();

  dev.matmul(&fp32_params(ha, hb, hc, 2, 4, 3)).unwrap();
  assert_eq!(c, [1.0, 2.0, 3.0, 6.0, 4.0, 5.0, 6.0, 15.0]);

  dev.shutdown();
}

#[test]
fn register_update_unregister_cycle() {
  let mut dev = create_device("mock").unwrap();
  let mut data = vec![0u8; 1024];

  let h = dev.register_buffer(data.as_mut_ptr(), 1024).unwrap();
  assert_ne!(h, 0);

  dev.update_buffer(h, data.as_ptr(), 1024).unwrap();
  dev.unregister_buffer(h);

  // the same host buffer registers again with a fresh usable handle
  let h2 = dev.register_buffer(data.as_mut_ptr(), 1024).unwrap();
  assert_ne!(h2, 0);
  dev.update_buffer(h2, data.as_ptr(), 512).unwrap();

  dev.shutdown();
}

#[test]
fn matmul_with_byte_offsets() {
  let mut dev = create_device("mock").unwrap();

  // one backing buffer holding A at 0 and B at 64 bytes
  let mut buf = vec![0.0f32; 64];
  buf[..4].copy_from_slice(&[1.0, 2.0, 3.0, 4.0]); // A: 2x2
  buf[16..20].copy_from_slice(&[1.0, 0.0, 0.0, 1.0]); // B: 2x2 identity
  let mut c = [0.0f32; 4];

  let h = dev.register_buffer(buf.as_mut_ptr() as *mut u8, buf.len() * 4).unwrap();
  let hc = dev.register_buffer(c.as_mut_ptr() as *mut u8, 16).unwrap();

  let mut params = fp32_params(h, h, hc, 2, 2, 2);
  params.b_offset = 64;
  dev.matmul(&params).unwrap();

  // C = A * I^T = A
  assert_eq!(c, [1.0, 2.0, 3.0, 4.0]);

  dev.shutdown();
}
