use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
  Stdout,
  Stderr,
}

/// Where complete lines written to stdout and stderr end up.
pub trait Console {
  fn line(
    &mut self,
    stream: StdStream,
    text: &str,
  );
}

/// Emits each line as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingConsole;

impl Console for TracingConsole {
  fn line(
    &mut self,
    stream: StdStream,
    text: &str,
  ) {
    match stream {
      StdStream::Stdout => tracing::info!(target: "wasm_shim::stdout", "{text}"),
      StdStream::Stderr => tracing::warn!(target: "wasm_shim::stderr", "{text}"),
    }
  }
}

/// Collects lines in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferConsole {
  lines: Rc<RefCell<Vec<(StdStream, String)>>>,
}

impl BufferConsole {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn lines(&self) -> Vec<(StdStream, String)> {
    self.lines.borrow().clone()
  }

  pub fn stdout(&self) -> Vec<String> {
    self.of(StdStream::Stdout)
  }

  pub fn stderr(&self) -> Vec<String> {
    self.of(StdStream::Stderr)
  }

  fn of(
    &self,
    wanted: StdStream,
  ) -> Vec<String> {
    self
      .lines
      .borrow()
      .iter()
      .filter(|(stream, _)| *stream == wanted)
      .map(|(_, text)| text.clone())
      .collect()
  }
}

impl Console for BufferConsole {
  fn line(
    &mut self,
    stream: StdStream,
    text: &str,
  ) {
    self.lines.borrow_mut().push((stream, text.to_string()));
  }
}

/// Line-buffers stdout and stderr in front of a [`Console`].
pub struct ConsoleWriter {
  console: Box<dyn Console>,
  stdout: Vec<u8>,
  stderr: Vec<u8>,
}

impl ConsoleWriter {
  pub fn new(console: Box<dyn Console>) -> Self {
    Self {
      console,
      stdout: Vec::new(),
      stderr: Vec::new(),
    }
  }

  pub fn write(
    &mut self,
    stream: StdStream,
    bytes: &[u8],
  ) {
    let buffer = match stream {
      StdStream::Stdout => &mut self.stdout,
      StdStream::Stderr => &mut self.stderr,
    };
    buffer.extend_from_slice(bytes);

    while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
      let line: Vec<u8> = buffer.drain(..=newline).collect();
      self
        .console
        .line(stream, &String::from_utf8_lossy(&line[..newline]));
    }
  }

  /// Emits a partial line, if any.
  pub fn flush(
    &mut self,
    stream: StdStream,
  ) {
    let buffer = match stream {
      StdStream::Stdout => &mut self.stdout,
      StdStream::Stderr => &mut self.stderr,
    };

    if !buffer.is_empty() {
      let text = String::from_utf8_lossy(buffer).into_owned();
      buffer.clear();
      self.console.line(stream, &text);
    }
  }

  pub fn flush_all(&mut self) {
    self.flush(StdStream::Stdout);
    self.flush(StdStream::Stderr);
  }
}

impl Default for ConsoleWriter {
  fn default() -> Self {
    Self::new(Box::new(TracingConsole))
  }
}
