//! Memory hierarchy model.
//!
//! Three tiers: DDR (the client's shared memory), a shared L2, and one L1
//! scratchpad per engine. Blocks are tracked by `(handle, offset)` identity
//! with LRU eviction; hit/miss counters feed the DMA statistics reported per
//! matmul. L2 is inclusive of L1 at stage-in time: data reaches an L1 only
//! through an existing L2 block.

#[derive(Debug, Clone)]
struct MemBlock {
  handle: u64,
  offset: usize,
  size: usize,
  local_offset: usize,
  last_access: u64,
  dirty: bool,
}

/// One tier's storage and live-block list (used for both L1 and L2)
#[derive(Debug)]
struct TierModel {
  capacity: usize,
  used: usize,
  storage: Vec<u8>,
  blocks: Vec<MemBlock>,
}

impl TierModel {
  fn new(capacity: usize) -> Self {
    Self {
      capacity,
      used: 0,
      storage: vec![0u8; capacity],
      blocks: Vec::new(),
    }
  }

  fn can_fit(&self, size: usize) -> bool {
    self.used + size <= self.capacity
  }

  fn find(&self, handle: u64, offset: usize) -> Option<usize> {
    self
      .blocks
      .iter()
      .position(|b| b.handle == handle && b.offset == offset)
  }

  /// Evict minimum-last_access blocks until `needed` fits.
  /// Dirty victims are dropped; writeback only happens through flush_all.
  fn evict_lru(&mut self, needed: usize) {
    while !self.blocks.is_empty() && !self.can_fit(needed) {
      let lru = self
        .blocks
        .iter()
        .enumerate()
        .min_by_key(|(_, b)| b.last_access)
        .map(|(i, _)| i)
        .expect("blocks is nonempty");
      let victim = self.blocks.swap_remove(lru);
      self.used -= victim.size;
    }
  }

  fn alloc(&mut self, size: usize) -> usize {
    let offset = self.used;
    self.used += size;
    offset
  }

  fn live_bytes(&self) -> usize {
    self.blocks.iter().map(|b| b.size).sum()
  }
}

pub struct MemoryHierarchy {
  num_engines: usize,
  l1_size_per_engine: usize,
  l2_size: usize,
  l1: Vec<TierModel>,
  l2: TierModel,
  access_counter: u64,
  l1_hits: u64,
  l2_hits: u64,
  l1_misses: u64,
  l2_misses: u64,
  total_bytes_moved: u64,
}

impl MemoryHierarchy {
  pub fn new(num_engines: usize, l1_size_per_engine: usize, l2_size: usize) -> Self {
    Self {
      num_engines,
      l1_size_per_engine,
      l2_size,
      l1: (0..num_engines).map(|_| TierModel::new(l1_size_per_engine)).collect(),
      l2: TierModel::new(l2_size),
      access_counter: 0,
      l1_hits: 0,
      l2_hits: 0,
      l1_misses: 0,
      l2_misses: 0,
      total_bytes_moved: 0,
    }
  }

  /// Stage data from DDR into L2. Returns the block's offset within L2
  /// storage, or `None` when `size` cannot fit even after full eviction.
  /// A block already present under `(handle, offset)` is a hit and keeps
  /// its slot.
  pub fn stage_to_l2(&mut self, handle: u64, offset: usize, size: usize, src: &[u8]) -> Option<usize> {
    if let Some(i) = self.l2.find(handle, offset) {
      self.l2_hits += 1;
      self.access_counter += 1;
      self.l2.blocks[i].last_access = self.access_counter;
      return Some(self.l2.blocks[i].local_offset);
    }

    self.l2_misses += 1;

    if !self.l2.can_fit(size) {
      self.l2.evict_lru(size);
      if !self.l2.can_fit(size) {
        return None;
      }
    }

    let local_offset = self.l2.alloc(size);
    let copy = size.min(src.len()).min(self.l2.capacity - local_offset);
    self.l2.storage[local_offset..local_offset + copy].copy_from_slice(&src[..copy]);
    self.total_bytes_moved += size as u64;

    self.access_counter += 1;
    self.l2.blocks.push(MemBlock {
      handle,
      offset,
      size,
      local_offset,
      last_access: self.access_counter,
      dirty: false,
    });
    Some(local_offset)
  }

  /// Stage data from L2 into an engine's L1. The block must already be in L2;
  /// L1 never re-reads DDR. Returns the offset within that L1's storage.
  pub fn stage_to_l1(&mut self, engine_id: usize, handle: u64, offset: usize, size: usize) -> Option<usize> {
    if engine_id >= self.num_engines {
      return None;
    }

    if let Some(i) = self.l1[engine_id].find(handle, offset) {
      self.l1_hits += 1;
      self.access_counter += 1;
      self.l1[engine_id].blocks[i].last_access = self.access_counter;
      return Some(self.l1[engine_id].blocks[i].local_offset);
    }

    self.l1_misses += 1;

    // Absence from L2 is a staging-order bug in the caller
    let l2_local = match self.l2.find(handle, offset) {
      Some(i) => self.l2.blocks[i].local_offset,
      None => return None,
    };

    let l1 = &mut self.l1[engine_id];
    if !l1.can_fit(size) {
      l1.evict_lru(size);
      if !l1.can_fit(size) {
        return None;
      }
    }

    let local_offset = l1.alloc(size);
    let copy = size
      .min(l1.capacity - local_offset)
      .min(self.l2.capacity.saturating_sub(l2_local));
    let (dst, src) = (&mut l1.storage[local_offset..local_offset + copy], &self.l2.storage[l2_local..l2_local + copy]);
    dst.copy_from_slice(src);
    self.total_bytes_moved += size as u64;

    self.access_counter += 1;
    l1.blocks.push(MemBlock {
      handle,
      offset,
      size,
      local_offset,
      last_access: self.access_counter,
      dirty: false,
    });
    Some(local_offset)
  }

  /// Record a modification on an L1 block
  pub fn mark_dirty(&mut self, engine_id: usize, handle: u64, offset: usize) {
    if engine_id >= self.num_engines {
      return;
    }
    if let Some(i) = self.l1[engine_id].find(handle, offset) {
      self.l1[engine_id].blocks[i].dirty = true;
    }
  }

  /// Copy a dirty L1 block into its matching L2 block, clearing the L1 dirty
  /// bit and marking the L2 block dirty
  pub fn writeback_l1_to_l2(&mut self, engine_id: usize, handle: u64, offset: usize) {
    if engine_id >= self.num_engines {
      return;
    }
    let l1_idx = match self.l1[engine_id].find(handle, offset) {
      Some(i) if self.l1[engine_id].blocks[i].dirty => i,
      _ => return,
    };
    let l2_idx = match self.l2.find(handle, offset) {
      Some(i) => i,
      None => return,
    };

    let (l1_local, size) = {
      let b = &self.l1[engine_id].blocks[l1_idx];
      (b.local_offset, b.size)
    };
    let l2_local = self.l2.blocks[l2_idx].local_offset;
    let copy = size
      .min(self.l1[engine_id].capacity.saturating_sub(l1_local))
      .min(self.l2.capacity.saturating_sub(l2_local));
    let src = &self.l1[engine_id].storage[l1_local..l1_local + copy];
    self.l2.storage[l2_local..l2_local + copy].copy_from_slice(src);
    self.total_bytes_moved += size as u64;

    self.l1[engine_id].blocks[l1_idx].dirty = false;
    self.l2.blocks[l2_idx].dirty = true;
  }

  /// Copy a dirty L2 block out to DDR (`ddr` is the block's destination)
  pub fn writeback_l2_to_ddr(&mut self, handle: u64, offset: usize, ddr: &mut [u8]) {
    let i = match self.l2.find(handle, offset) {
      Some(i) if self.l2.blocks[i].dirty => i,
      _ => return,
    };
    let (local, size) = (self.l2.blocks[i].local_offset, self.l2.blocks[i].size);
    let copy = size.min(ddr.len()).min(self.l2.capacity.saturating_sub(local));
    ddr[..copy].copy_from_slice(&self.l2.storage[local..local + copy]);
    self.total_bytes_moved += size as u64;
    self.l2.blocks[i].dirty = false;
  }

  /// Flush every dirty block down the hierarchy: L1 -> L2, then L2 -> DDR.
  /// The DDR destination of each L2 block is `ddr_base + block.offset`.
  pub fn flush_all(&mut self, ddr_base: &mut [u8]) {
    let mut dirty_l1: Vec<(usize, u64, usize)> = Vec::new();
    for (engine, l1) in self.l1.iter().enumerate() {
      for block in &l1.blocks {
        if block.dirty {
          dirty_l1.push((engine, block.handle, block.offset));
        }
      }
    }
    for (engine, handle, offset) in dirty_l1 {
      self.writeback_l1_to_l2(engine, handle, offset);
    }

    for i in 0..self.l2.blocks.len() {
      if !self.l2.blocks[i].dirty {
        continue;
      }
      let (local, size, offset) = {
        let b = &self.l2.blocks[i];
        (b.local_offset, b.size, b.offset)
      };
      if offset >= ddr_base.len() {
        continue;
      }
      let copy = size
        .min(ddr_base.len() - offset)
        .min(self.l2.capacity.saturating_sub(local));
      ddr_base[offset..offset + copy].copy_from_slice(&self.l2.storage[local..local + copy]);
      self.total_bytes_moved += size as u64;
      self.l2.blocks[i].dirty = false;
    }
  }

  /// Drop all blocks and clear watermarks, the access counter and statistics
  pub fn reset(&mut self) {
    for l1 in &mut self.l1 {
      l1.blocks.clear();
      l1.used = 0;
    }
    self.l2.blocks.clear();
    self.l2.used = 0;
    self.access_counter = 0;
    self.l1_hits = 0;
    self.l2_hits = 0;
    self.l1_misses = 0;
    self.l2_misses = 0;
    self.total_bytes_moved = 0;
  }

  pub fn l1_hits(&self) -> u64 {
    self.l1_hits
  }

  pub fn l2_hits(&self) -> u64 {
    self.l2_hits
  }

  pub fn l1_misses(&self) -> u64 {
    self.l1_misses
  }

  pub fn l2_misses(&self) -> u64 {
    self.l2_misses
  }

  pub fn total_bytes_moved(&self) -> u64 {
    self.total_bytes_moved
  }

  pub fn num_engines(&self) -> usize {
    self.num_engines
  }

  pub fn l1_size(&self) -> usize {
    self.l1_size_per_engine
  }

  pub fn l2_size(&self) -> usize {
    self.l2_size
  }

  /// Bytes of live blocks in a tier (for capacity checks)
  pub fn l2_live_bytes(&self) -> usize {
    self.l2.live_bytes()
  }

  pub fn l1_live_bytes(&self, engine_id: usize) -> usize {
    self.l1[engine_id].live_bytes()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn l2_hit_returns_same_slot() {
    let mut mem = MemoryHierarchy::new(1, 1024, 4096);
    let data = vec![7u8; 256];

    let slot = mem.stage_to_l2(1, 0, 256, &data).unwrap();
    assert_eq!(mem.l2_misses(), 1);
    assert_eq!(mem.l2_hits(), 0);

    // identical (handle, offset) hits and keeps its slot until eviction
    for _ in 0..3 {
      assert_eq!(mem.stage_to_l2(1, 0, 256, &data).unwrap(), slot);
    }
    assert_eq!(mem.l2_hits(), 3);
    assert_eq!(mem.l2_misses(), 1);

    // a different offset is a distinct block
    let other = mem.stage_to_l2(1, 256, 256, &data).unwrap();
    assert_ne!(other, slot);
    assert_eq!(mem.l2_misses(), 2);
  }

  #[test]
  fn lru_evicts_least_recently_used() {
    let mut mem = MemoryHierarchy::new(1, 1024, 1024);
    let data = vec![0u8; 512];

    mem.stage_to_l2(1, 0, 512, &data);
    mem.stage_to_l2(1, 512, 512, &data);
    // touch the first block so the second becomes LRU
    mem.stage_to_l2(1, 0, 512, &data);

    // staging a third block evicts (1, 512)
    mem.stage_to_l2(2, 0, 512, &data);
    assert!(mem.l2_live_bytes() <= 1024);

    // the survivor still hits
    let hits_before = mem.l2_hits();
    mem.stage_to_l2(1, 0, 512, &data);
    assert_eq!(mem.l2_hits(), hits_before + 1);

    // (1, 512) was evicted, so re-staging it is a miss
    let misses_before = mem.l2_misses();
    mem.stage_to_l2(1, 512, 512, &data);
    assert_eq!(mem.l2_misses(), misses_before + 1);
  }

  #[test]
  fn live_bytes_never_exceed_capacity() {
    let mut mem = MemoryHierarchy::new(1, 256, 1024);
    let data = vec![0u8; 300];
    for i in 0..20 {
      mem.stage_to_l2(1, i * 300, 300, &data);
      assert!(mem.l2_live_bytes() <= 1024);
    }
  }

  #[test]
  fn l1_requires_l2_block() {
    let mut mem = MemoryHierarchy::new(2, 1024, 4096);
    // not staged to L2 yet: programming error, reported as None
    assert!(mem.stage_to_l1(0, 1, 0, 128).is_none());

    let data = vec![3u8; 128];
    mem.stage_to_l2(1, 0, 128, &data);
    let slot = mem.stage_to_l1(0, 1, 0, 128).unwrap();
    assert_eq!(mem.l1_misses(), 2);
    assert_eq!(mem.stage_to_l1(0, 1, 0, 128).unwrap(), slot);
    assert_eq!(mem.l1_hits(), 1);

    // engines have private L1s
    assert!(mem.stage_to_l1(1, 1, 0, 128).is_some());
    assert_eq!(mem.l1_misses(), 3);
    assert!(mem.stage_to_l1(2, 1, 0, 128).is_none());
  }

  #[test]
  fn writeback_propagates_dirty_data() {
    let mut mem = MemoryHierarchy::new(1, 1024, 4096);
    let data = vec![1u8; 64];
    mem.stage_to_l2(1, 0, 64, &data);
    let l1_slot = mem.stage_to_l1(0, 1, 0, 64).unwrap();

    // model the engine modifying its L1 copy
    mem.l1[0].storage[l1_slot..l1_slot + 64].fill(9);
    mem.mark_dirty(0, 1, 0);
    mem.writeback_l1_to_l2(0, 1, 0);

    let mut ddr = vec![0u8; 64];
    mem.writeback_l2_to_ddr(1, 0, &mut ddr);
    assert_eq!(ddr, vec![9u8; 64]);

    // second writeback is a no-op: the dirty bit was cleared
    ddr.fill(0);
    mem.writeback_l2_to_ddr(1, 0, &mut ddr);
    assert_eq!(ddr, vec![0u8; 64]);
  }

  #[test]
  fn flush_all_walks_both_tiers() {
    let mut mem = MemoryHierarchy::new(1, 1024, 4096);
    let data = vec![5u8; 32];
    mem.stage_to_l2(1, 16, 32, &data);
    let l1_slot = mem.stage_to_l1(0, 1, 16, 32).unwrap();
    mem.l1[0].storage[l1_slot..l1_slot + 32].fill(6);
    mem.mark_dirty(0, 1, 16);

    let mut ddr = vec![0u8; 64];
    mem.flush_all(&mut ddr);
    assert_eq!(&ddr[16..48], &[6u8; 32]);
    assert_eq!(&ddr[..16], &[0u8; 16]);
  }

  #[test]
  fn reset_clears_everything() {
    let mut mem = MemoryHierarchy::new(1, 1024, 4096);
    let data = vec![0u8; 64];
    mem.stage_to_l2(1, 0, 64, &data);
    mem.stage_to_l1(0, 1, 0, 64);
    mem.reset();
    assert_eq!(mem.l2_hits(), 0);
    assert_eq!(mem.l2_misses(), 0);
    assert_eq!(mem.total_bytes_moved(), 0);
    assert_eq!(mem.l2_live_bytes(), 0);
    assert_eq!(mem.l1_live_bytes(0), 0);
    // counter restarts: the next stage is a miss again
    mem.stage_to_l2(1, 0, 64, &data);
    assert_eq!(mem.l2_misses(), 1);
  }
}
