//! DMA engine model.
//!
//! Two engine classes move data between memory tiers:
//!   - system DMA: DDR <-> L2
//!   - L1 DMA:     L2 <-> L1 (per engine)
//!
//! Transfers advance a cycle clock derived from configured bandwidth and the
//! system clock; compute adds its own cycles through `advance_cycles`.

use crate::trace::TraceEvent;

/// Transfer direction between tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaKind {
  DdrToL2,
  L2ToDdr,
  L2ToL1,
  L1ToL2,
}

impl DmaKind {
  fn is_system(&self) -> bool {
    matches!(self, DmaKind::DdrToL2 | DmaKind::L2ToDdr)
  }

  pub fn trace_event(&self) -> TraceEvent {
    match self {
      DmaKind::DdrToL2 => TraceEvent::DdrToL2,
      DmaKind::L2ToDdr => TraceEvent::L2ToDdr,
      DmaKind::L2ToL1 => TraceEvent::L2ToL1,
      DmaKind::L1ToL2 => TraceEvent::L1ToL2,
    }
  }
}

#[derive(Debug, Clone)]
pub struct DmaConfig {
  pub system_bw_gbps: f64,
  pub l1_bw_gbps: f64,
  pub clock_freq_mhz: u64,
}

impl Default for DmaConfig {
  fn default() -> Self {
    Self {
      system_bw_gbps: 50.0,
      l1_bw_gbps: 100.0,
      clock_freq_mhz: 1000,
    }
  }
}

#[derive(Debug)]
pub struct DmaModel {
  config: DmaConfig,
  current_cycle: u64,
  total_bytes: u64,
  total_transfer_cycles: u64,
  ddr_l2_bytes: u64,
  l2_l1_bytes: u64,
}

impl DmaModel {
  pub fn new(config: DmaConfig) -> Self {
    Self {
      config,
      current_cycle: 0,
      total_bytes: 0,
      total_transfer_cycles: 0,
      ddr_l2_bytes: 0,
      l2_l1_bytes: 0,
    }
  }

  // bytes/cycle = (bw_gbps * 1e9 / 8) / (clock_mhz * 1e6) = bw_gbps * 125 / clock_mhz
  fn calculate_cycles(&self, kind: DmaKind, bytes: usize) -> u64 {
    let bandwidth_gbps = if kind.is_system() {
      self.config.system_bw_gbps
    } else {
      self.config.l1_bw_gbps
    };
    let bytes_per_cycle = bandwidth_gbps * 125.0 / self.config.clock_freq_mhz as f64;
    let cycles = (bytes as f64 / bytes_per_cycle).ceil() as u64;
    cycles.max(1)
  }

  /// Issue a transfer, advancing the cycle clock. Returns the cycles taken.
  pub fn transfer(&mut self, kind: DmaKind, bytes: usize, _engine_id: usize) -> u64 {
    let cycles = self.calculate_cycles(kind, bytes);
    self.current_cycle += cycles;
    self.total_bytes += bytes as u64;
    self.total_transfer_cycles += cycles;
    if kind.is_system() {
      self.ddr_l2_bytes += bytes as u64;
    } else {
      self.l2_l1_bytes += bytes as u64;
    }
    cycles
  }

  /// Add non-DMA cycles (compute time) to the clock
  pub fn advance_cycles(&mut self, cycles: u64) {
    self.current_cycle += cycles;
  }

  pub fn current_cycle(&self) -> u64 {
    self.current_cycle
  }

  pub fn total_bytes(&self) -> u64 {
    self.total_bytes
  }

  pub fn total_transfer_cycles(&self) -> u64 {
    self.total_transfer_cycles
  }

  pub fn ddr_l2_bytes(&self) -> u64 {
    self.ddr_l2_bytes
  }

  pub fn l2_l1_bytes(&self) -> u64 {
    self.l2_l1_bytes
  }

  pub fn config(&self) -> &DmaConfig {
    &self.config
  }

  pub fn reset_stats(&mut self) {
    self.current_cycle = 0;
    self.total_bytes = 0;
    self.total_transfer_cycles = 0;
    self.ddr_l2_bytes = 0;
    self.l2_l1_bytes = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cycle_formula_matches_bandwidth() {
    // 50 GB/s at 1 GHz -> 6.25 bytes/cycle
    let mut dma = DmaModel::new(DmaConfig::default());
    let cycles = dma.transfer(DmaKind::DdrToL2, 6250, 0);
    assert_eq!(cycles, 1000);

    // L1 DMA runs at double the bandwidth
    let cycles = dma.transfer(DmaKind::L2ToL1, 6250, 0);
    assert_eq!(cycles, 500);
  }

  #[test]
  fn minimum_one_cycle() {
    let mut dma = DmaModel::new(DmaConfig::default());
    assert_eq!(dma.transfer(DmaKind::DdrToL2, 1, 0), 1);
    assert_eq!(dma.transfer(DmaKind::L1ToL2, 0, 0), 1);
  }

  #[test]
  fn totals_split_by_direction() {
    let mut dma = DmaModel::new(DmaConfig::default());
    dma.transfer(DmaKind::DdrToL2, 1000, 0);
    dma.transfer(DmaKind::L2ToDdr, 500, 0);
    dma.transfer(DmaKind::L2ToL1, 250, 0);
    assert_eq!(dma.total_bytes(), 1750);
    assert_eq!(dma.ddr_l2_bytes(), 1500);
    assert_eq!(dma.l2_l1_bytes(), 250);
    assert!(dma.current_cycle() >= dma.total_transfer_cycles());

    dma.advance_cycles(100);
    let with_compute = dma.current_cycle();
    assert_eq!(with_compute, dma.total_transfer_cycles() + 100);

    dma.reset_stats();
    assert_eq!(dma.total_bytes(), 0);
    assert_eq!(dma.current_cycle(), 0);
  }
}
