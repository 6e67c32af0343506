use std::rc::Rc;

use crate::error::BackendError;
use crate::memory::LinearMemory;
use crate::pending::Completion;
use crate::runtime::Runtime;
use crate::suspend::{StackSwitch, SyncMode};

use super::{EOF, FileMode, STDERR, STDIN, STDOUT, StdStream, Stream};

/// How far a read or flush got.
enum Progress {
  Done,
  Suspended,
  Failed,
}

impl<M: LinearMemory, S: StackSwitch, F> Runtime<M, S, F> {
  fn io_failed<T>(
    &mut self,
    call: &'static str,
    err: BackendError,
    ret: T,
  ) -> T {
    tracing::warn!(call, error = %err, "stdio call failed");
    self.errno = err.errno();
    ret
  }

  fn bad_args<T>(
    &mut self,
    call: &'static str,
    errno: i32,
    ret: T,
  ) -> T {
    tracing::warn!(call, errno, "stdio call with bad arguments");
    self.errno = errno;
    ret
  }

  fn unexpected<T>(
    &mut self,
    call: &'static str,
    completion: Completion,
    ret: T,
  ) -> T {
    tracing::error!(call, ?completion, "backend answered with the wrong completion");
    self.errno = libc::EIO;
    ret
  }

  fn c_string(
    &mut self,
    call: &'static str,
    ptr: u32,
  ) -> Option<String> {
    match self.memory.read_string(ptr) {
      Ok(text) => Some(text),
      Err(err) => {
        tracing::warn!(call, error = %err, "unreadable string argument");
        self.errno = libc::EFAULT;
        None
      }
    }
  }

  /// `fopen(path, mode)`.
  pub fn fopen(
    &mut self,
    path_ptr: u32,
    mode_ptr: u32,
  ) -> u32 {
    let Some(path) = self.c_string("fopen", path_ptr) else {
      return 0;
    };
    let Some(mode) = self.c_string("fopen", mode_ptr) else {
      return 0;
    };
    self.open_path(&path, &mode)
  }

  /// `fopen` with host strings.
  pub fn open_path(
    &mut self,
    path: &str,
    mode: &str,
  ) -> u32 {
    let mode = match FileMode::parse(mode) {
      Ok(mode) => mode,
      Err(err) => {
        tracing::warn!(path, error = %err, "fopen() rejected mode");
        self.errno = libc::EINVAL;
        return 0;
      }
    };

    let resolved = match self.mounts.resolve(path) {
      Ok(resolved) => resolved,
      Err(err) => return self.io_failed("fopen", err, 0),
    };
    if !resolved.access.permits(mode) {
      return self.io_failed("fopen", BackendError::PermissionDenied(path.to_string()), 0);
    }

    let backend = Rc::clone(&resolved.backend);
    let Some(outcome) =
      self.wrap_pending(|_| backend.open(&resolved.path, mode).map(Completion::Opened))
    else {
      return 0;
    };

    match outcome {
      Ok(Completion::Opened(handle)) => {
        let stream = Stream::new(path.to_string(), mode, resolved.backend, handle);
        let fp = self.streams.insert(stream);
        tracing::debug!(path, fp, "opened");
        fp
      }
      Ok(other) => self.unexpected("fopen", other, 0),
      Err(err) => self.io_failed("fopen", err, 0),
    }
  }

  /// Reads chunks into the stream until `ready` holds or the file ends.
  fn fill_until(
    &mut self,
    fp: u32,
    call: &'static str,
    ready: impl Fn(&Stream) -> bool,
  ) -> Progress {
    loop {
      let (backend, handle) = match self.streams.get_mut(fp) {
        None => return self.bad_args(call, libc::EBADF, Progress::Failed),
        Some(stream) if !stream.mode.read => {
          stream.error = true;
          return self.bad_args(call, libc::EBADF, Progress::Failed);
        }
        Some(stream) if stream.eof || ready(stream) => return Progress::Done,
        Some(stream) => (Rc::clone(&stream.backend), stream.handle),
      };

      let Some(outcome) = self.wrap_pending(|_| backend.read(handle).map(Completion::Chunk)) else {
        return Progress::Suspended;
      };

      let failure = match outcome {
        Ok(Completion::Chunk(chunk)) => {
          if let Some(stream) = self.streams.get_mut(fp) {
            stream.fill(chunk);
          }
          continue;
        }
        Ok(other) => Err(other),
        Err(err) => Ok(err),
      };

      if let Some(stream) = self.streams.get_mut(fp) {
        stream.error = true;
      }
      return match failure {
        Ok(err) => self.io_failed(call, err, Progress::Failed),
        Err(other) => self.unexpected(call, other, Progress::Failed),
      };
    }
  }

  /// Sends the stream's write buffer to its backend.
  fn flush_stream(
    &mut self,
    fp: u32,
    call: &'static str,
  ) -> Progress {
    let (backend, handle, batch) = match self.streams.get(fp) {
      None => return self.bad_args(call, libc::EBADF, Progress::Failed),
      Some(stream) if stream.write_buf.is_empty() => return Progress::Done,
      Some(stream) => (Rc::clone(&stream.backend), stream.handle, stream.write_buf.clone()),
    };

    let Some(outcome) = self.wrap_pending(|_| backend.write(handle, batch).map(Completion::Written))
    else {
      return Progress::Suspended;
    };

    // Whatever happened, these bytes are settled.
    if let Some(stream) = self.streams.get_mut(fp) {
      stream.write_buf.clear();
      stream.flush_failed = outcome.is_err();
      stream.error |= outcome.is_err();
    }

    match outcome {
      Ok(Completion::Written(_)) => Progress::Done,
      Ok(other) => self.unexpected(call, other, Progress::Failed),
      Err(err) => self.io_failed(call, err, Progress::Failed),
    }
  }

  /// Buffers `bytes` for `fp`, flushing once the buffer would fill.
  /// Returns whether the bytes were accepted.
  pub(crate) fn write_stream(
    &mut self,
    fp: u32,
    call: &'static str,
    bytes: &[u8],
  ) -> bool {
    match fp {
      STDOUT => {
        self.console.write(StdStream::Stdout, bytes);
        return true;
      }
      STDERR => {
        self.console.write(StdStream::Stderr, bytes);
        return true;
      }
      _ => {}
    }

    let capacity = self.config.stdio.buffer_size;

    let (backend, handle, batch) = match self.streams.get_mut(fp) {
      None => return self.bad_args(call, libc::EBADF, false),
      Some(stream) if !stream.mode.write => {
        stream.error = true;
        return self.bad_args(call, libc::EBADF, false);
      }
      Some(stream) if stream.write_buf.len() + bytes.len() < capacity => {
        stream.write_buf.extend_from_slice(bytes);
        return true;
      }
      Some(stream) => {
        let mut batch = stream.write_buf.clone();
        batch.extend_from_slice(bytes);
        (Rc::clone(&stream.backend), stream.handle, batch)
      }
    };

    let Some(outcome) = self.wrap_pending(|_| backend.write(handle, batch).map(Completion::Written))
    else {
      return false;
    };

    if let Some(stream) = self.streams.get_mut(fp) {
      stream.write_buf.clear();
      stream.error |= outcome.is_err();
    }

    match outcome {
      Ok(Completion::Written(_)) => true,
      Ok(other) => self.unexpected(call, other, false),
      Err(err) => self.io_failed(call, err, false),
    }
  }

  /// `fread(ptr, size, nmemb, stream)`: whole items read.
  pub fn fread(
    &mut self,
    ptr: u32,
    size: u32,
    nmemb: u32,
    fp: u32,
  ) -> u32 {
    let Some(total) = size.checked_mul(nmemb) else {
      return self.bad_args("fread", libc::EINVAL, 0);
    };
    if total == 0 || fp == STDIN {
      return 0;
    }

    let wanted = total as usize;
    match self.fill_until(fp, "fread", |stream| stream.unread().len() >= wanted) {
      Progress::Done => {}
      Progress::Suspended | Progress::Failed => return 0,
    }

    let Some(stream) = self.streams.get_mut(fp) else {
      return 0;
    };
    let bytes = stream.take(wanted);

    if let Err(err) = self.memory.write_bytes(ptr, &bytes) {
      tracing::warn!(error = %err, "fread() into bad buffer");
      self.errno = libc::EFAULT;
      return 0;
    }

    bytes.len() as u32 / size
  }

  /// `fwrite(ptr, size, nmemb, stream)`: whole items written.
  pub fn fwrite(
    &mut self,
    ptr: u32,
    size: u32,
    nmemb: u32,
    fp: u32,
  ) -> u32 {
    let Some(total) = size.checked_mul(nmemb) else {
      return self.bad_args("fwrite", libc::EINVAL, 0);
    };
    if total == 0 {
      return 0;
    }

    let bytes = match self.memory.bytes(ptr, total) {
      Ok(bytes) => bytes.to_vec(),
      Err(_) => return self.bad_args("fwrite", libc::EFAULT, 0),
    };

    if self.write_stream(fp, "fwrite", &bytes) { nmemb } else { 0 }
  }

  /// `fgetc(stream)`.
  pub fn fgetc(
    &mut self,
    fp: u32,
  ) -> i32 {
    if fp == STDIN {
      return EOF;
    }

    match self.fill_until(fp, "fgetc", |stream| !stream.unread().is_empty()) {
      Progress::Done => {}
      Progress::Suspended | Progress::Failed => return EOF,
    }

    match self.streams.get_mut(fp).map(|stream| stream.take(1)) {
      Some(byte) if !byte.is_empty() => byte[0] as i32,
      _ => EOF,
    }
  }

  pub fn getc(
    &mut self,
    fp: u32,
  ) -> i32 {
    self.fgetc(fp)
  }

  /// `getchar()`: stdin has no data source, so this is always `EOF`.
  pub fn getchar(&mut self) -> i32 {
    self.fgetc(STDIN)
  }

  /// `fgets(buf, size, stream)`: `buf`, or 0 at end of file.
  pub fn fgets(
    &mut self,
    buf: u32,
    size: i32,
    fp: u32,
  ) -> u32 {
    if size <= 0 {
      return self.bad_args("fgets", libc::EINVAL, 0);
    }
    if fp == STDIN {
      return 0;
    }

    let limit = size as usize - 1;
    if limit == 0 {
      return match self.memory.write_u8(buf, 0) {
        Ok(()) => buf,
        Err(_) => self.bad_args("fgets", libc::EFAULT, 0),
      };
    }

    match self.fill_until(fp, "fgets", |stream| stream.line_len(limit).is_some()) {
      Progress::Done => {}
      Progress::Suspended | Progress::Failed => return 0,
    }

    let Some(stream) = self.streams.get_mut(fp) else {
      return 0;
    };
    let len = stream.line_len(limit).unwrap_or(0);
    if len == 0 {
      return 0;
    }
    let line = stream.take(len);

    match self.memory.write_c_str(buf, &line) {
      Ok(()) => buf,
      Err(_) => self.bad_args("fgets", libc::EFAULT, 0),
    }
  }

  /// `ungetc(c, stream)`.
  pub fn ungetc(
    &mut self,
    c: i32,
    fp: u32,
  ) -> i32 {
    if c == EOF {
      return EOF;
    }

    match self.streams.get_mut(fp) {
      Some(stream) if stream.mode.read => {
        stream.unget(c as u8);
        c as u8 as i32
      }
      _ => self.bad_args("ungetc", libc::EBADF, EOF),
    }
  }

  /// `fputc(c, stream)`.
  pub fn fputc(
    &mut self,
    c: i32,
    fp: u32,
  ) -> i32 {
    let byte = c as u8;
    if self.write_stream(fp, "fputc", &[byte]) { byte as i32 } else { EOF }
  }

  pub fn putc(
    &mut self,
    c: i32,
    fp: u32,
  ) -> i32 {
    self.fputc(c, fp)
  }

  pub fn putchar(
    &mut self,
    c: i32,
  ) -> i32 {
    self.fputc(c, STDOUT)
  }

  /// `fputs(s, stream)`.
  pub fn fputs(
    &mut self,
    s: u32,
    fp: u32,
  ) -> i32 {
    let bytes = match self.memory.c_str(s) {
      Ok(bytes) => bytes.to_vec(),
      Err(_) => return self.bad_args("fputs", libc::EFAULT, EOF),
    };

    if self.write_stream(fp, "fputs", &bytes) { 0 } else { EOF }
  }

  /// `puts(s)`: `s` and a newline to stdout.
  pub fn puts(
    &mut self,
    s: u32,
  ) -> i32 {
    let mut bytes = match self.memory.c_str(s) {
      Ok(bytes) => bytes.to_vec(),
      Err(_) => return self.bad_args("puts", libc::EFAULT, EOF),
    };
    bytes.push(b'\n');

    if self.write_stream(STDOUT, "puts", &bytes) { 0 } else { EOF }
  }

  /// `fflush(stream)`. `fflush(NULL)` only flushes stdout and stderr.
  pub fn fflush(
    &mut self,
    fp: u32,
  ) -> i32 {
    match fp {
      0 => {
        self.console.flush_all();
        0
      }
      STDOUT => {
        self.console.flush(StdStream::Stdout);
        0
      }
      STDERR => {
        self.console.flush(StdStream::Stderr);
        0
      }
      STDIN => 0,
      _ => match self.flush_stream(fp, "fflush") {
        Progress::Done | Progress::Suspended => 0,
        Progress::Failed => EOF,
      },
    }
  }

  /// `fclose(stream)`: flushes, then closes the backend handle. The
  /// stream is gone afterwards even if either step fails.
  pub fn fclose(
    &mut self,
    fp: u32,
  ) -> i32 {
    if matches!(fp, STDIN | STDOUT | STDERR) {
      return self.fflush(fp);
    }

    // A rewound call finds the buffer already settled, so the flush
    // outcome has to survive on the stream until the close completes.
    if self.suspender.mode() == SyncMode::Normal {
      if let Some(stream) = self.streams.get_mut(fp) {
        stream.flush_failed = false;
      }
    }

    match self.flush_stream(fp, "fclose") {
      Progress::Suspended => return 0,
      Progress::Failed if self.streams.get(fp).is_none() => return EOF,
      Progress::Failed | Progress::Done => {}
    }

    let Some(stream) = self.streams.get(fp) else {
      return self.bad_args("fclose", libc::EBADF, EOF);
    };
    let (backend, handle) = (Rc::clone(&stream.backend), stream.handle);

    let Some(outcome) = self.wrap_pending(|_| backend.close(handle).map(|()| Completion::Closed))
    else {
      return 0;
    };

    let flushed = match self.streams.remove(fp) {
      Some(stream) => {
        tracing::debug!(path = stream.path, fp, flushed = !stream.flush_failed, "closed");
        !stream.flush_failed
      }
      None => true,
    };

    match outcome {
      Ok(Completion::Closed) if flushed => 0,
      Ok(Completion::Closed) => EOF,
      Ok(other) => self.unexpected("fclose", other, EOF),
      Err(err) => self.io_failed("fclose", err, EOF),
    }
  }

  /// `feof(stream)`: set once a read has hit the end and nothing buffered
  /// is left. stdin is always at end of file.
  pub fn feof(
    &self,
    fp: u32,
  ) -> i32 {
    match fp {
      STDIN => 1,
      _ => self
        .streams
        .get(fp)
        .is_some_and(|stream| stream.eof && stream.unread().is_empty()) as i32,
    }
  }

  pub fn ferror(
    &self,
    fp: u32,
  ) -> i32 {
    self.streams.get(fp).is_some_and(|stream| stream.error) as i32
  }

  pub fn clearerr(
    &mut self,
    fp: u32,
  ) {
    if let Some(stream) = self.streams.get_mut(fp) {
      stream.eof = false;
      stream.error = false;
    }
  }

  /// `remove(path)`.
  pub fn remove(
    &mut self,
    path_ptr: u32,
  ) -> i32 {
    match self.c_string("remove", path_ptr) {
      Some(path) => self.remove_path(&path),
      None => -1,
    }
  }

  pub fn remove_path(
    &mut self,
    path: &str,
  ) -> i32 {
    let resolved = match self.mounts.resolve(path) {
      Ok(resolved) => resolved,
      Err(err) => return self.io_failed("remove", err, -1),
    };
    if !resolved.access.write {
      return self.io_failed("remove", BackendError::PermissionDenied(path.to_string()), -1);
    }

    let backend = resolved.backend;
    let Some(outcome) =
      self.wrap_pending(|_| backend.remove(&resolved.path).map(|()| Completion::Removed))
    else {
      return -1;
    };

    match outcome {
      Ok(Completion::Removed) => 0,
      Ok(other) => self.unexpected("remove", other, -1),
      Err(err) => self.io_failed("remove", err, -1),
    }
  }

  /// `access(path, mode)` with `F_OK`, `R_OK` and `W_OK`.
  pub fn access(
    &mut self,
    path_ptr: u32,
    amode: i32,
  ) -> i32 {
    match self.c_string("access", path_ptr) {
      Some(path) => self.access_path(&path, amode),
      None => -1,
    }
  }

  pub fn access_path(
    &mut self,
    path: &str,
    amode: i32,
  ) -> i32 {
    let resolved = match self.mounts.resolve(path) {
      Ok(resolved) => resolved,
      Err(err) => return self.io_failed("access", err, -1),
    };

    let denied = (amode & libc::R_OK != 0 && !resolved.access.read)
      || (amode & libc::W_OK != 0 && !resolved.access.write);
    if denied {
      return self.io_failed("access", BackendError::PermissionDenied(path.to_string()), -1);
    }

    let backend = resolved.backend;
    let Some(outcome) = self.wrap_pending(|_| backend.stat(&resolved.path).map(Completion::Stat))
    else {
      return -1;
    };

    match outcome {
      Ok(Completion::Stat(_)) => 0,
      Ok(other) => self.unexpected("access", other, -1),
      Err(err) => self.io_failed("access", err, -1),
    }
  }
}
