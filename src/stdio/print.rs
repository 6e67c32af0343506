use crate::error::FormatError;
use crate::memory::LinearMemory;
use crate::printf::{self, Arg, Args, VaList};
use crate::runtime::Runtime;
use crate::suspend::StackSwitch;

use super::{STDOUT, StdStream};

// On wasm32 a variadic call passes its arguments as a pointer to an
// argument area, so `printf` and `vprintf` share a signature.
impl<M: LinearMemory, S: StackSwitch, F> Runtime<M, S, F> {
  fn format_va(
    &mut self,
    call: &'static str,
    fmt_ptr: u32,
    va_ptr: u32,
  ) -> Option<Vec<u8>> {
    let result = self
      .memory
      .c_str(fmt_ptr)
      .map_err(FormatError::from)
      .and_then(|fmt| printf::format(fmt, &mut VaList::new(&self.memory, va_ptr)));

    self.formatted(call, result)
  }

  fn formatted(
    &mut self,
    call: &'static str,
    result: Result<Vec<u8>, FormatError>,
  ) -> Option<Vec<u8>> {
    match result {
      Ok(bytes) => Some(bytes),
      Err(err) => {
        tracing::error!(call, error = %err, "format failed");
        self.errno = match err {
          FormatError::Memory(_) => libc::EFAULT,
          FormatError::Overflow(_) => libc::EOVERFLOW,
          _ => libc::EINVAL,
        };
        None
      }
    }
  }

  /// `printf(fmt, ...)`: bytes written to stdout, or -1.
  pub fn printf(
    &mut self,
    fmt_ptr: u32,
    va_ptr: u32,
  ) -> i32 {
    match self.format_va("printf", fmt_ptr, va_ptr) {
      Some(bytes) => {
        self.console.write(StdStream::Stdout, &bytes);
        bytes.len() as i32
      }
      None => -1,
    }
  }

  pub fn vprintf(
    &mut self,
    fmt_ptr: u32,
    va_ptr: u32,
  ) -> i32 {
    self.printf(fmt_ptr, va_ptr)
  }

  /// `fprintf(stream, fmt, ...)`. May suspend when the stream flushes.
  pub fn fprintf(
    &mut self,
    fp: u32,
    fmt_ptr: u32,
    va_ptr: u32,
  ) -> i32 {
    let Some(bytes) = self.format_va("fprintf", fmt_ptr, va_ptr) else {
      return -1;
    };

    if self.write_stream(fp, "fprintf", &bytes) { bytes.len() as i32 } else { -1 }
  }

  pub fn vfprintf(
    &mut self,
    fp: u32,
    fmt_ptr: u32,
    va_ptr: u32,
  ) -> i32 {
    self.fprintf(fp, fmt_ptr, va_ptr)
  }

  /// `sprintf(buf, fmt, ...)`: no bound on `buf`, as in C.
  pub fn sprintf(
    &mut self,
    buf: u32,
    fmt_ptr: u32,
    va_ptr: u32,
  ) -> i32 {
    let Some(bytes) = self.format_va("sprintf", fmt_ptr, va_ptr) else {
      return -1;
    };

    match self.memory.write_c_str(buf, &bytes) {
      Ok(()) => bytes.len() as i32,
      Err(err) => {
        tracing::warn!(error = %err, "sprintf() past the end of memory");
        self.errno = libc::EFAULT;
        -1
      }
    }
  }

  pub fn vsprintf(
    &mut self,
    buf: u32,
    fmt_ptr: u32,
    va_ptr: u32,
  ) -> i32 {
    self.sprintf(buf, fmt_ptr, va_ptr)
  }

  /// `snprintf(buf, size, fmt, ...)`: writes at most `size - 1` bytes and
  /// a NUL, and returns the length the full output would have had.
  pub fn snprintf(
    &mut self,
    buf: u32,
    size: u32,
    fmt_ptr: u32,
    va_ptr: u32,
  ) -> i32 {
    let Some(bytes) = self.format_va("snprintf", fmt_ptr, va_ptr) else {
      return -1;
    };

    if size > 0 {
      let kept = bytes.len().min(size as usize - 1);
      if let Err(err) = self.memory.write_c_str(buf, &bytes[..kept]) {
        tracing::warn!(error = %err, "snprintf() past the end of memory");
        self.errno = libc::EFAULT;
        return -1;
      }
    }

    bytes.len() as i32
  }

  pub fn vsnprintf(
    &mut self,
    buf: u32,
    size: u32,
    fmt_ptr: u32,
    va_ptr: u32,
  ) -> i32 {
    self.snprintf(buf, size, fmt_ptr, va_ptr)
  }

  /// Host-side `printf` with typed arguments, for use by embedders.
  pub fn print(
    &mut self,
    fmt: &str,
    args: &[Arg],
  ) -> i32 {
    let result = printf::format(fmt.as_bytes(), &mut Args::new(args));

    match self.formatted("print", result) {
      Some(bytes) => {
        if self.write_stream(STDOUT, "print", &bytes) { bytes.len() as i32 } else { -1 }
      }
      None => -1,
    }
  }
}
