use std::collections::HashMap;
use std::rc::Rc;

use super::{Backend, BackendHandle, FileMode};

pub const STDIN: u32 = 1;
pub const STDOUT: u32 = 2;
pub const STDERR: u32 = 3;
const FIRST_FILE: u32 = 4;

/// One open `FILE*`.
///
/// ```text
///   read_buf: [ consumed ... | unread ............ ]
///                            ▲ read_pos
///   write_buf: bytes accepted by fwrite, not yet sent to the backend
/// ```
///
/// `ungetc` pushes bytes back in front of `read_pos`.
pub struct Stream {
  pub path: String,
  pub mode: FileMode,
  pub(crate) backend: Rc<dyn Backend>,
  pub(crate) handle: BackendHandle,
  read_buf: Vec<u8>,
  read_pos: usize,
  pub(crate) write_buf: Vec<u8>,
  /// The most recent flush lost its bytes.
  pub(crate) flush_failed: bool,
  pub eof: bool,
  pub error: bool,
}

impl Stream {
  pub fn new(
    path: String,
    mode: FileMode,
    backend: Rc<dyn Backend>,
    handle: BackendHandle,
  ) -> Self {
    Self {
      path,
      mode,
      backend,
      handle,
      read_buf: Vec::new(),
      read_pos: 0,
      write_buf: Vec::new(),
      flush_failed: false,
      eof: false,
      error: false,
    }
  }

  pub fn unread(&self) -> &[u8] {
    &self.read_buf[self.read_pos..]
  }

  /// Bytes up to and including the first newline, capped at `limit`, if
  /// the buffer can already answer an `fgets`.
  pub fn line_len(
    &self,
    limit: usize,
  ) -> Option<usize> {
    let unread = self.unread();
    let window = &unread[..unread.len().min(limit)];

    match window.iter().position(|&b| b == b'\n') {
      Some(newline) => Some(newline + 1),
      None if unread.len() >= limit => Some(limit),
      None if self.eof => Some(unread.len()),
      None => None,
    }
  }

  pub fn take(
    &mut self,
    len: usize,
  ) -> Vec<u8> {
    let len = len.min(self.unread().len());
    let bytes = self.unread()[..len].to_vec();
    self.read_pos += len;

    if self.read_pos == self.read_buf.len() {
      self.read_buf.clear();
      self.read_pos = 0;
    }

    bytes
  }

  /// Appends a chunk from the backend, or marks end of file.
  pub fn fill(
    &mut self,
    chunk: Option<Vec<u8>>,
  ) {
    match chunk {
      Some(bytes) => {
        self.read_buf.drain(..self.read_pos);
        self.read_pos = 0;
        self.read_buf.extend(bytes);
      }
      None => self.eof = true,
    }
  }

  pub fn unget(
    &mut self,
    byte: u8,
  ) {
    if self.read_pos > 0 {
      self.read_pos -= 1;
      self.read_buf[self.read_pos] = byte;
    } else {
      self.read_buf.insert(0, byte);
    }
    self.eof = false;
  }
}

/// The open streams of one runtime, keyed by the `FILE*` value handed to
/// the module.
pub struct StreamTable {
  streams: HashMap<u32, Stream>,
  next: u32,
}

impl StreamTable {
  pub fn new() -> Self {
    Self {
      streams: HashMap::new(),
      next: FIRST_FILE,
    }
  }

  pub fn insert(
    &mut self,
    stream: Stream,
  ) -> u32 {
    let id = self.next;
    self.next += 1;
    self.streams.insert(id, stream);
    id
  }

  pub fn get(
    &self,
    id: u32,
  ) -> Option<&Stream> {
    self.streams.get(&id)
  }

  pub fn get_mut(
    &mut self,
    id: u32,
  ) -> Option<&mut Stream> {
    self.streams.get_mut(&id)
  }

  pub fn remove(
    &mut self,
    id: u32,
  ) -> Option<Stream> {
    self.streams.remove(&id)
  }

  pub fn len(&self) -> usize {
    self.streams.len()
  }

  pub fn is_empty(&self) -> bool {
    self.streams.is_empty()
  }
}

impl Default for StreamTable {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stdio::MemoryBackend;

  fn stream() -> Stream {
    Stream::new(
      "/t".into(),
      FileMode::parse("r").unwrap(),
      Rc::new(MemoryBackend::default()),
      BackendHandle(1),
    )
  }

  #[test]
  fn test_take_and_fill() {
    let mut s = stream();
    s.fill(Some(b"abc".to_vec()));
    assert_eq!(s.take(2), b"ab");

    s.fill(Some(b"def".to_vec()));
    assert_eq!(s.unread(), b"cdef");
    assert_eq!(s.take(10), b"cdef");
    assert!(s.unread().is_empty());

    s.fill(None);
    assert!(s.eof);
  }

  #[test]
  fn test_unget() {
    let mut s = stream();
    s.fill(Some(b"xyz".to_vec()));
    s.take(1);

    s.unget(b'Q');
    assert_eq!(s.unread(), b"Qyz");

    s.take(3);
    s.fill(None);
    s.unget(b'!');
    assert!(!s.eof);
    assert_eq!(s.take(1), b"!");
  }

  #[test]
  fn test_line_len() {
    let mut s = stream();
    s.fill(Some(b"ab".to_vec()));
    assert_eq!(s.line_len(10), None);
    assert_eq!(s.line_len(2), Some(2));

    s.fill(Some(b"\ncd".to_vec()));
    assert_eq!(s.line_len(10), Some(3));

    s.take(3);
    s.fill(None);
    assert_eq!(s.line_len(10), Some(2));
  }

  #[test]
  fn test_handles_start_after_std_streams() {
    let mut table = StreamTable::new();

    assert_eq!(table.insert(stream()), 4);
    assert_eq!(table.insert(stream()), 5);
    assert!(table.remove(4).is_some());
    assert_eq!(table.insert(stream()), 6);
    assert_eq!(table.len(), 2);
  }
}
