use crate::BLOCK_SIZE;

/// One `BLOCK_SIZE` slice of the heap.
///
/// `allocation` points back at the owning allocation by its start address,
/// or is `None` while the block is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlock {
  pub start: u32,
  pub allocation: Option<u32>,
}

impl HeapBlock {
  pub fn new(
    start: u32,
    allocation: Option<u32>,
  ) -> Self {
    Self { start, allocation }
  }

  pub fn size(&self) -> u32 {
    BLOCK_SIZE as u32
  }

  pub fn is_free(&self) -> bool {
    self.allocation.is_none()
  }
}

/// One live allocation: a contiguous run of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
  pub start_block: u32,
  pub bytes: u32,
  pub blocks: u32,
}

impl Allocation {
  pub fn new(
    start_block: u32,
    bytes: u32,
  ) -> Self {
    Self {
      start_block,
      bytes,
      blocks: blocks_for(bytes),
    }
  }

  /// One past the last block index of the span.
  pub fn end_block(&self) -> u32 {
    self.start_block + self.blocks
  }

  /// Bytes the span can hold without moving.
  pub fn capacity(&self) -> u32 {
    self.blocks * BLOCK_SIZE as u32
  }
}

/// Blocks needed to hold `bytes`.
pub fn blocks_for(bytes: u32) -> u32 {
  crate::units_of!(bytes as u64, BLOCK_SIZE as u64) as u32
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_blocks_for() {
    assert_eq!(blocks_for(1), 1);
    assert_eq!(blocks_for(256), 1);
    assert_eq!(blocks_for(257), 2);
    assert_eq!(blocks_for(300), 2);
    assert_eq!(blocks_for(u32::MAX), 16_777_216);
  }

  #[test]
  fn test_allocation_span() {
    let alloc = Allocation::new(3, 600);

    assert_eq!(alloc.blocks, 3);
    assert_eq!(alloc.end_block(), 6);
    assert_eq!(alloc.capacity(), 768);
  }

  #[test]
  fn test_block_ownership() {
    let mut block = HeapBlock::new(0x1000, None);
    assert!(block.is_free());
    assert_eq!(block.size(), 256);

    block.allocation = Some(0x1000);
    assert!(!block.is_free());
  }
}
