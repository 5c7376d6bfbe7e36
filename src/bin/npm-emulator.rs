use clap::Parser;
use log::LevelFilter;
use npm_emu::config::load_configs;
use npm_emu::server::EmuServer;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::Ordering;

/// NPM Hardware Emulator
///
/// Standalone process that emulates NPM accelerator behavior. Clients connect
/// over a Unix socket and share tensor data through shared memory.
#[derive(Parser, Debug)]
#[command(name = "npm-emulator")]
#[command(version = "0.1.0")]
#[command(about = "NPM hardware emulator", long_about = None)]
struct Args {
  /// Configuration file path
  #[arg(long, value_name = "PATH")]
  config: Option<PathBuf>,

  /// Unix socket path (default: /tmp/npm-emulator.sock)
  #[arg(long, value_name = "PATH")]
  socket: Option<String>,

  /// Device SKU: NPM4K, NPM8K, NPM16K, NPM32K, NPM64K (default: NPM8K)
  #[arg(long, value_name = "SKU")]
  sku: Option<String>,

  /// L2 cache size in MB (default: SKU default)
  #[arg(long, value_name = "MB")]
  l2_size: Option<u64>,

  /// Enable tiled matmul execution
  #[arg(long)]
  tiling: bool,

  /// Enable timing simulation
  #[arg(long)]
  timing: bool,

  /// Verbose output
  #[arg(short, long)]
  verbose: bool,

  /// Trace IPC commands
  #[arg(long)]
  trace_commands: bool,

  /// Trace DMA transfers
  #[arg(long)]
  trace_dma: bool,

  /// Trace compute operations
  #[arg(long)]
  trace_ops: bool,

  /// Enable all trace categories
  #[arg(long)]
  trace_all: bool,

  /// Trace output file (default: stdout)
  #[arg(long, value_name = "PATH")]
  trace_file: Option<String>,
}

fn main() {
  let args = Args::parse();

  let config = match load_configs(
    args.config.as_deref(),
    args.socket.as_deref(),
    args.sku.as_deref(),
    args.l2_size,
    args.tiling,
    args.timing,
    args.verbose,
    args.trace_commands,
    args.trace_dma,
    args.trace_ops,
    args.trace_all,
    args.trace_file.as_deref(),
  ) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("configuration error: {}", e);
      process::exit(1);
    },
  };

  env_logger::Builder::from_default_env()
    .filter_level(if config.verbose { LevelFilter::Debug } else { LevelFilter::Warn })
    .init();

  if config.verbose {
    if let Ok(dump) = toml::to_string(&config) {
      println!("Configuration:\n{}", dump);
    }
  }

  let mut server = match EmuServer::new(config) {
    Ok(server) => server,
    Err(e) => {
      eprintln!("failed to create server: {}", e);
      process::exit(1);
    },
  };

  // SIGINT/SIGTERM set the shutdown flag; the dummy connect wakes the
  // accept loop so it can observe the flag and exit
  let shutdown = server.shutdown_handle();
  let socket_path = server.socket_path().to_string();
  if let Err(e) = ctrlc::set_handler(move || {
    shutdown.store(true, Ordering::Relaxed);
    let _ = UnixStream::connect(&socket_path);
  }) {
    eprintln!("failed to install signal handler: {}", e);
    process::exit(1);
  }

  if let Err(e) = server.run() {
    eprintln!("server error: {}", e);
    process::exit(1);
  }
}
