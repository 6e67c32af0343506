//! The linear memory region shared by the heap, the suspension engine and
//! the libc glue.
//!
//! ```text
//!   0          16        24                1024           heap start        top
//!   ┌──────────┬─────────┬─────────────────┬──── ... ─────┬──────┬──────┬───┬─────────┐
//!   │  null    │ control │  unwind data    │ module data  │ blk0 │ blk1 │...│ (spare) │
//!   └──────────┴─────────┴─────────────────┴──── ... ─────┴──────┴──────┴───┴─────────┘
//!                                                                              ▲
//!                                              always a multiple of PAGE_SIZE ─┘
//! ```
//!
//! All multi-byte views are little-endian, as in WebAssembly.

use crate::PAGE_SIZE;
use crate::config::MemoryConfig;
use crate::error::MemoryError;

/// A growable, page-granular byte array.
///
/// Implementors provide raw access and growth; typed views come for free.
/// Growth only ever appends, so existing addresses stay valid.
pub trait LinearMemory {
  fn data(&self) -> &[u8];

  fn data_mut(&mut self) -> &mut [u8];

  /// Appends `additional_pages` zeroed pages and returns the previous page
  /// count.
  fn grow(
    &mut self,
    additional_pages: u32,
  ) -> Result<u32, MemoryError>;

  /// Current size in pages.
  fn pages(&self) -> u32 {
    (self.data().len() / PAGE_SIZE) as u32
  }

  /// Current size in bytes.
  fn size(&self) -> usize {
    self.data().len()
  }

  fn bytes(
    &self,
    addr: u32,
    len: u32,
  ) -> Result<&[u8], MemoryError> {
    let size = self.size();
    let start = addr as usize;
    let end = start + len as usize;

    self
      .data()
      .get(start..end)
      .ok_or(MemoryError::OutOfBounds { addr, len, size })
  }

  fn bytes_mut(
    &mut self,
    addr: u32,
    len: u32,
  ) -> Result<&mut [u8], MemoryError> {
    let size = self.size();
    let start = addr as usize;
    let end = start + len as usize;

    self
      .data_mut()
      .get_mut(start..end)
      .ok_or(MemoryError::OutOfBounds { addr, len, size })
  }

  fn write_bytes(
    &mut self,
    addr: u32,
    src: &[u8],
  ) -> Result<(), MemoryError> {
    self.bytes_mut(addr, src.len() as u32)?.copy_from_slice(src);
    Ok(())
  }

  fn fill(
    &mut self,
    addr: u32,
    len: u32,
    value: u8,
  ) -> Result<(), MemoryError> {
    self.bytes_mut(addr, len)?.fill(value);
    Ok(())
  }

  /// Copies `len` bytes from `src` to `dst`; the ranges may overlap.
  fn copy_within(
    &mut self,
    src: u32,
    dst: u32,
    len: u32,
  ) -> Result<(), MemoryError> {
    self.bytes(src, len)?;
    self.bytes(dst, len)?;

    let start = src as usize;
    self
      .data_mut()
      .copy_within(start..start + len as usize, dst as usize);
    Ok(())
  }

  fn read_u8(
    &self,
    addr: u32,
  ) -> Result<u8, MemoryError> {
    Ok(self.bytes(addr, 1)?[0])
  }

  fn write_u8(
    &mut self,
    addr: u32,
    value: u8,
  ) -> Result<(), MemoryError> {
    self.write_bytes(addr, &[value])
  }

  fn read_u16(
    &self,
    addr: u32,
  ) -> Result<u16, MemoryError> {
    Ok(u16::from_le_bytes(self.array(addr)?))
  }

  fn write_u16(
    &mut self,
    addr: u32,
    value: u16,
  ) -> Result<(), MemoryError> {
    self.write_bytes(addr, &value.to_le_bytes())
  }

  fn read_u32(
    &self,
    addr: u32,
  ) -> Result<u32, MemoryError> {
    Ok(u32::from_le_bytes(self.array(addr)?))
  }

  fn write_u32(
    &mut self,
    addr: u32,
    value: u32,
  ) -> Result<(), MemoryError> {
    self.write_bytes(addr, &value.to_le_bytes())
  }

  fn read_i32(
    &self,
    addr: u32,
  ) -> Result<i32, MemoryError> {
    Ok(i32::from_le_bytes(self.array(addr)?))
  }

  fn read_u64(
    &self,
    addr: u32,
  ) -> Result<u64, MemoryError> {
    Ok(u64::from_le_bytes(self.array(addr)?))
  }

  fn write_u64(
    &mut self,
    addr: u32,
    value: u64,
  ) -> Result<(), MemoryError> {
    self.write_bytes(addr, &value.to_le_bytes())
  }

  fn read_i64(
    &self,
    addr: u32,
  ) -> Result<i64, MemoryError> {
    Ok(i64::from_le_bytes(self.array(addr)?))
  }

  fn read_f32(
    &self,
    addr: u32,
  ) -> Result<f32, MemoryError> {
    Ok(f32::from_le_bytes(self.array(addr)?))
  }

  fn read_f64(
    &self,
    addr: u32,
  ) -> Result<f64, MemoryError> {
    Ok(f64::from_le_bytes(self.array(addr)?))
  }

  fn write_f64(
    &mut self,
    addr: u32,
    value: f64,
  ) -> Result<(), MemoryError> {
    self.write_bytes(addr, &value.to_le_bytes())
  }

  /// Fixed-size read used by the typed views.
  fn array<const N: usize>(
    &self,
    addr: u32,
  ) -> Result<[u8; N], MemoryError> {
    let mut out = [0u8; N];
    out.copy_from_slice(self.bytes(addr, N as u32)?);
    Ok(out)
  }

  /// The bytes of the NUL-terminated string at `addr`, without the NUL.
  fn c_str(
    &self,
    addr: u32,
  ) -> Result<&[u8], MemoryError> {
    let tail = self.data().get(addr as usize..).ok_or(MemoryError::OutOfBounds {
      addr,
      len: 1,
      size: self.size(),
    })?;

    let len = tail
      .iter()
      .position(|&b| b == 0)
      .ok_or(MemoryError::UnterminatedString { addr })?;

    Ok(&tail[..len])
  }

  /// Decodes the C string at `addr`, replacing invalid UTF-8.
  fn read_string(
    &self,
    addr: u32,
  ) -> Result<String, MemoryError> {
    Ok(String::from_utf8_lossy(self.c_str(addr)?).into_owned())
  }

  /// Writes `src` followed by a NUL terminator.
  fn write_c_str(
    &mut self,
    addr: u32,
    src: &[u8],
  ) -> Result<(), MemoryError> {
    self.write_bytes(addr, src)?;
    self.write_u8(addr + src.len() as u32, 0)
  }
}

/// Owned linear memory backed by a `Vec<u8>`.
#[derive(Debug, Clone)]
pub struct VecMemory {
  bytes: Vec<u8>,
  max_pages: u32,
}

impl VecMemory {
  pub fn new(
    initial_pages: u32,
    max_pages: u32,
  ) -> Self {
    Self {
      bytes: vec![0; initial_pages as usize * PAGE_SIZE],
      max_pages,
    }
  }

  /// Memory sized and limited by the runtime's memory section.
  pub fn from_config(config: &MemoryConfig) -> Self {
    Self::new(config.initial_pages, config.max_pages)
  }

  pub fn max_pages(&self) -> u32 {
    self.max_pages
  }
}

impl LinearMemory for VecMemory {
  fn data(&self) -> &[u8] {
    &self.bytes
  }

  fn data_mut(&mut self) -> &mut [u8] {
    &mut self.bytes
  }

  fn grow(
    &mut self,
    additional_pages: u32,
  ) -> Result<u32, MemoryError> {
    let current = self.pages();

    let limit_hit = current
      .checked_add(additional_pages)
      .is_none_or(|total| total > self.max_pages);

    if limit_hit {
      return Err(MemoryError::GrowthLimit {
        requested: additional_pages,
        current,
        max: self.max_pages,
      });
    }

    let new_len = self.bytes.len() + additional_pages as usize * PAGE_SIZE;
    self.bytes.resize(new_len, 0);

    tracing::debug!(from = current, to = current + additional_pages, "memory grown");

    Ok(current)
  }
}
