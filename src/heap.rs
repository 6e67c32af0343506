use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

use crate::block::{Allocation, HeapBlock, blocks_for};
use crate::config::MAX_PAGES;
use crate::error::{HeapError, MemoryError};
use crate::memory::LinearMemory;
use crate::{BLOCK_SIZE, PAGE_SIZE};

/// Snapshot of heap bookkeeping, mostly for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
  pub live_allocations: usize,
  pub live_bytes: u64,
  pub total_blocks: usize,
  pub free_blocks: usize,
  pub top: u32,
}

/// Block-based heap living inside a module's linear memory.
///
/// The heap does not own the memory; every operation that may touch bytes
/// or grow the region borrows it. No operation ever suspends, so a call is
/// either fully applied or not applied at all.
#[derive(Debug, Clone)]
pub struct Heap {
  start: u32,
  top: u32,
  blocks: Vec<HeapBlock>,
  free: BTreeSet<u32>,
  allocations: HashMap<u32, Allocation>,
  max_pages: u32,
}

impl Heap {
  /// Creates an empty heap starting at the first block boundary at or after
  /// `heap_base`. Address 0 is reserved for `NULL`, so the heap never
  /// starts below `BLOCK_SIZE`.
  pub fn new(heap_base: u32) -> Self {
    let block = BLOCK_SIZE as u64;
    let start = crate::align_to!(heap_base as u64, block).max(block) as u32;

    Self {
      start,
      top: start,
      blocks: Vec::new(),
      free: BTreeSet::new(),
      allocations: HashMap::new(),
      max_pages: MAX_PAGES,
    }
  }

  /// Caps how far the heap may grow memory, whatever the memory itself
  /// would allow.
  pub fn with_max_pages(
    mut self,
    max_pages: u32,
  ) -> Self {
    self.max_pages = max_pages;
    self
  }

  pub fn start(&self) -> u32 {
    self.start
  }

  /// One past the last byte covered by a block.
  pub fn top(&self) -> u32 {
    self.top
  }

  pub fn block_count(&self) -> usize {
    self.blocks.len()
  }

  pub fn blocks(&self) -> &[HeapBlock] {
    &self.blocks
  }

  /// Free block indices in ascending order.
  pub fn free_blocks(&self) -> impl Iterator<Item = u32> + '_ {
    self.free.iter().copied()
  }

  pub fn allocation(
    &self,
    address: u32,
  ) -> Option<&Allocation> {
    self.allocations.get(&address)
  }

  /// Block indices spanned by the allocation at `address`.
  pub fn span(
    &self,
    address: u32,
  ) -> Option<Range<u32>> {
    self
      .allocations
      .get(&address)
      .map(|alloc| alloc.start_block..alloc.end_block())
  }

  pub fn stats(&self) -> HeapStats {
    HeapStats {
      live_allocations: self.allocations.len(),
      live_bytes: self.allocations.values().map(|a| a.bytes as u64).sum(),
      total_blocks: self.blocks.len(),
      free_blocks: self.free.len(),
      top: self.top,
    }
  }

  fn block_address(
    &self,
    index: u32,
  ) -> u32 {
    self.start + index * BLOCK_SIZE as u32
  }

  /// Allocates `size` bytes, returning 0 for a zero size or on failure.
  pub fn allocate<M: LinearMemory>(
    &mut self,
    memory: &mut M,
    size: u32,
  ) -> u32 {
    match self.try_allocate(memory, size) {
      Ok(address) => address,
      Err(err) => {
        tracing::error!(size, error = %err, "allocation failed");
        0
      }
    }
  }

  pub fn try_allocate<M: LinearMemory>(
    &mut self,
    memory: &mut M,
    size: u32,
  ) -> Result<u32, HeapError> {
    if size == 0 {
      return Ok(0);
    }

    let needed = blocks_for(size);

    let first = match self.find_free_run(needed) {
      Some(first) => first,
      None => self.extend(memory, needed, size)?,
    };

    let address = self.block_address(first);
    self.claim(first..first + needed, address);
    self.allocations.insert(address, Allocation::new(first, size));

    tracing::trace!(address, size, blocks = needed, "allocated");

    Ok(address)
  }

  /// Resizes the allocation at `address`, returning its (possibly new)
  /// address, or 0 when freed or on failure.
  pub fn reallocate<M: LinearMemory>(
    &mut self,
    memory: &mut M,
    address: u32,
    size: u32,
  ) -> u32 {
    match self.try_reallocate(memory, address, size) {
      Ok(address) => address,
      Err(err @ HeapError::InvalidPointer(_)) => {
        tracing::warn!(error = %err, "realloc() received invalid pointer");
        0
      }
      Err(err) => {
        tracing::error!(address, size, error = %err, "reallocation failed");
        0
      }
    }
  }

  pub fn try_reallocate<M: LinearMemory>(
    &mut self,
    memory: &mut M,
    address: u32,
    size: u32,
  ) -> Result<u32, HeapError> {
    if size == 0 {
      self.try_deallocate(address)?;
      return Ok(0);
    }

    let alloc = *self
      .allocations
      .get(&address)
      .ok_or(HeapError::InvalidPointer(address))?;

    // Shrinking, or growing inside the blocks already owned.
    if size <= alloc.capacity() {
      self.set_bytes(address, size);
      return Ok(address);
    }

    if self.grow_in_place(memory, address, alloc, size)? {
      return Ok(address);
    }

    // Relocate: the old span stays intact until the copy is done.
    let moved = self.try_allocate(memory, size)?;
    memory
      .copy_within(address, moved, alloc.bytes)
      .map_err(|err| HeapError::Inconsistent(err.to_string()))?;
    self.try_deallocate(address)?;

    tracing::trace!(from = address, to = moved, size, "relocated");

    Ok(moved)
  }

  /// Frees the allocation at `address`. Unknown addresses are ignored.
  pub fn deallocate(
    &mut self,
    address: u32,
  ) {
    if address == 0 {
      return;
    }

    if let Err(err) = self.try_deallocate(address) {
      tracing::warn!(error = %err, "free() received invalid pointer");
    }
  }

  pub fn try_deallocate(
    &mut self,
    address: u32,
  ) -> Result<(), HeapError> {
    let alloc = self
      .allocations
      .remove(&address)
      .ok_or(HeapError::InvalidPointer(address))?;

    for index in alloc.start_block..alloc.end_block() {
      self.blocks[index as usize].allocation = None;
      self.free.insert(index);
    }

    tracing::trace!(address, blocks = alloc.blocks, "freed");

    Ok(())
  }

  /// Best-fit search over maximal runs of consecutive free blocks.
  ///
  /// Among the runs at least `needed` long the shortest wins; on a tie the
  /// lowest address wins. Returns the first block index of the run.
  fn find_free_run(
    &self,
    needed: u32,
  ) -> Option<u32> {
    if (self.free.len() as u64) < needed as u64 {
      return None;
    }

    let mut best: Option<(u32, u32)> = None;
    let mut consider = |run: Option<(u32, u32, u32)>| {
      if let Some((start, len, _)) = run {
        let better = best.is_none_or(|(_, best_len)| len < best_len);
        if len >= needed && better {
          best = Some((start, len));
        }
      }
    };

    let mut run: Option<(u32, u32, u32)> = None;
    for &index in &self.free {
      run = match run {
        Some((start, len, last)) if index == last + 1 => Some((start, len + 1, index)),
        finished => {
          consider(finished);
          Some((index, 1, index))
        }
      };
    }
    consider(run);

    best.map(|(start, _)| start)
  }

  /// True when every block in `range` exists and is free.
  fn is_range_free(
    &self,
    range: Range<u32>,
  ) -> bool {
    let len = range.end - range.start;
    self.free.range(range).count() as u32 == len
  }

  /// Makes room at the end of the block table for `needed` blocks, reusing
  /// trailing free blocks, and returns the first block index of the room.
  fn extend<M: LinearMemory>(
    &mut self,
    memory: &mut M,
    needed: u32,
    size: u32,
  ) -> Result<u32, HeapError> {
    let len = self.blocks.len() as u32;

    let trailing = self
      .free
      .iter()
      .rev()
      .zip((0..len).rev())
      .take_while(|(free, expected)| *free == expected)
      .count() as u32;
    let reused = trailing.min(needed);

    self.append_blocks(memory, needed - reused, size)?;

    Ok(len - reused)
  }

  /// Appends `count` fresh free blocks, growing memory by whole pages when
  /// the new top passes the end of the region.
  fn append_blocks<M: LinearMemory>(
    &mut self,
    memory: &mut M,
    count: u32,
    size: u32,
  ) -> Result<(), HeapError> {
    if count == 0 {
      return Ok(());
    }

    let new_top = self.top as u64 + count as u64 * BLOCK_SIZE as u64;
    if new_top > u32::MAX as u64 {
      return Err(HeapError::SizeOverflow);
    }

    let pages_needed = crate::units_of!(new_top, PAGE_SIZE as u64) as u32;
    let pages = memory.pages();
    if pages_needed > pages.max(self.max_pages) {
      return Err(HeapError::OutOfMemory {
        requested: size as u64,
        source: MemoryError::GrowthLimit {
          requested: pages_needed - pages,
          current: pages,
          max: self.max_pages,
        },
      });
    }
    if pages_needed > pages {
      memory
        .grow(pages_needed - pages)
        .map_err(|source| HeapError::OutOfMemory {
          requested: size as u64,
          source,
        })?;
    }

    for _ in 0..count {
      let start = self.block_address(self.blocks.len() as u32);
      self.blocks.push(HeapBlock::new(start, None));
    }
    self.top = new_top as u32;

    Ok(())
  }

  /// Extends the allocation over the blocks directly after it. Returns
  /// `false`, with nothing changed, when those blocks are not available.
  fn grow_in_place<M: LinearMemory>(
    &mut self,
    memory: &mut M,
    address: u32,
    alloc: Allocation,
    size: u32,
  ) -> Result<bool, HeapError> {
    let wanted = blocks_for(size);
    let next = alloc.end_block();
    let table_end = self.blocks.len() as u32;

    // Existing blocks in [next, next + wanted - blocks) must all be free;
    // whatever lies past the table end is appended fresh.
    let existing_end = (alloc.start_block + wanted).min(table_end);
    if !self.is_range_free(next..existing_end) {
      return Ok(false);
    }

    let fresh = alloc.start_block + wanted - existing_end;
    if let Err(err) = self.append_blocks(memory, fresh, size) {
      tracing::debug!(address, error = %err, "in-place growth failed, relocating");
      return Ok(false);
    }

    self.claim(next..alloc.start_block + wanted, address);

    if let Some(alloc) = self.allocations.get_mut(&address) {
      alloc.bytes = size;
      alloc.blocks = wanted;
    }

    tracing::trace!(address, size, blocks = wanted, "grown in place");

    Ok(true)
  }

  fn claim(
    &mut self,
    range: Range<u32>,
    owner: u32,
  ) {
    for index in range {
      self.free.remove(&index);
      self.blocks[index as usize].allocation = Some(owner);
    }
  }

  fn set_bytes(
    &mut self,
    address: u32,
    size: u32,
  ) {
    if let Some(alloc) = self.allocations.get_mut(&address) {
      alloc.bytes = size;
    }
  }

  /// Verifies that the free index, the block table and the allocation map
  /// agree with each other.
  pub fn check_consistency(&self) -> Result<(), HeapError> {
    let fail = |detail: String| Err(HeapError::Inconsistent(detail));

    for (index, block) in self.blocks.iter().enumerate() {
      let index = index as u32;

      if block.start != self.block_address(index) {
        return fail(format!("block {index} starts at {:#x}", block.start));
      }

      if block.is_free() != self.free.contains(&index) {
        return fail(format!("block {index} free flag disagrees with free index"));
      }

      if let Some(owner) = block.allocation {
        match self.allocations.get(&owner) {
          Some(alloc) if (alloc.start_block..alloc.end_block()).contains(&index) => {}
          _ => return fail(format!("block {index} points at foreign allocation {owner:#x}")),
        }
      }
    }

    if let Some(&last) = self.free.last() {
      if last as usize >= self.blocks.len() {
        return fail(format!("free index holds unknown block {last}"));
      }
    }

    for (&address, alloc) in &self.allocations {
      if address != self.block_address(alloc.start_block) {
        return fail(format!("allocation {address:#x} keyed at wrong address"));
      }

      if alloc.blocks < blocks_for(alloc.bytes) {
        return fail(format!("allocation {address:#x} too small for {} bytes", alloc.bytes));
      }

      for index in alloc.start_block..alloc.end_block() {
        let owner = self.blocks.get(index as usize).and_then(|b| b.allocation);
        if owner != Some(address) {
          return fail(format!("allocation {address:#x} does not own block {index}"));
        }
      }
    }

    Ok(())
  }
}
