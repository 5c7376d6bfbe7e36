pub mod backend;
pub mod config;
pub mod device;
pub mod dma_model;
pub mod memory_model;
pub mod protocol;
pub mod quantize;
pub mod server;
pub mod shm;
pub mod sku;
pub mod trace;

pub use config::EmuConfig;
pub use device::{create_device, create_device_from_env, MatmulParams, NpmDevice};
pub use server::EmuServer;
pub use sku::{ElemType, Sku};
