//! End-to-end runs of a scripted module against the runtime.
//!
//! `Script` stands in for an asyncify-instrumented module: it calls host
//! functions in order, and when one of them starts an unwind it returns
//! at once. On the rewind it replays from the call that suspended, the
//! way instrumented code skips straight back down its saved stack.

use std::cell::RefCell;
use std::rc::Rc;

use futures::channel::oneshot;
use wasm_shim::stdio::{
  Access, Backend, BackendHandle, BufferConsole, EOF, FileMode, MemoryBackend, Metadata, STDOUT,
};
use wasm_shim::{
  Arg, BackendError, LinearMemory, Op, Runtime, RuntimeConfig, RuntimeError, StackSwitch, Status,
  SuspendError, SyncMode, VecMemory,
};

#[derive(Debug, Default)]
struct CountingSwitch {
  unwinds: usize,
  rewinds: usize,
}

impl StackSwitch for CountingSwitch {
  fn start_unwind(
    &mut self,
    _control: u32,
  ) {
    self.unwinds += 1;
  }

  fn stop_unwind(&mut self) {}

  fn start_rewind(
    &mut self,
    _control: u32,
  ) {
    self.rewinds += 1;
  }

  fn stop_rewind(&mut self) {}
}

type Rt = Runtime<VecMemory, CountingSwitch>;
type Call = Box<dyn Fn(&mut Rt, &[i64]) -> i64>;

/// Replays host calls across suspensions. Results land in `results`.
struct Script {
  calls: Vec<Call>,
  pc: usize,
  results: Rc<RefCell<Vec<i64>>>,
}

impl Script {
  fn new() -> Self {
    Self {
      calls: Vec::new(),
      pc: 0,
      results: Rc::new(RefCell::new(Vec::new())),
    }
  }

  fn call(
    mut self,
    f: impl Fn(&mut Rt, &[i64]) -> i64 + 'static,
  ) -> Self {
    self.calls.push(Box::new(f));
    self
  }

  /// Installs the script as the entry point and hands back its results.
  fn install(
    mut self,
    rt: &mut Rt,
  ) -> Rc<RefCell<Vec<i64>>> {
    let results = Rc::clone(&self.results);

    rt.post_instantiate(HEAP_BASE, move |rt: &mut Rt| {
      if rt.async_state() != SyncMode::Rewinding.code() {
        self.pc = 0;
        self.results.borrow_mut().clear();
      }

      while self.pc < self.calls.len() {
        let seen = self.results.borrow().clone();
        let value = (self.calls[self.pc])(rt, &seen);
        if rt.async_state() == SyncMode::Unwinding.code() {
          return;
        }
        self.results.borrow_mut().push(value);
        self.pc += 1;
      }
    });

    results
  }
}

const PATH: u32 = 2048;
const MODE_R: u32 = 2112;
const MODE_W: u32 = 2116;
const TEXT: u32 = 2176;
const FMT: u32 = 2304;
const VA: u32 = 2432;
const BUF: u32 = 4096;
const HEAP_BASE: u32 = 8192;

fn setup(config: RuntimeConfig) -> (Rt, MemoryBackend, BufferConsole) {
  let console = BufferConsole::new();
  let mut rt = Runtime::new(config, VecMemory::new(1, 16), CountingSwitch::default())
    .unwrap()
    .with_console(console.clone());

  let backend = MemoryBackend::new(4);
  rt.mount("/", Rc::new(backend.clone()), Access::READ_WRITE);

  let memory = rt.memory_mut();
  memory.write_c_str(PATH, b"/notes.txt").unwrap();
  memory.write_c_str(MODE_R, b"r").unwrap();
  memory.write_c_str(MODE_W, b"w").unwrap();
  memory.write_c_str(TEXT, b"hello\nworld\n").unwrap();

  (rt, backend, console)
}

#[test]
fn write_then_read_back_through_suspensions() {
  let (mut rt, backend, _) = setup(RuntimeConfig::default());

  let results = Script::new()
    .call(|rt, _| rt.fopen(PATH, MODE_W) as i64)
    .call(|rt, r| rt.fputs(TEXT, r[0] as u32) as i64)
    .call(|rt, r| rt.fclose(r[0] as u32) as i64)
    .call(|rt, _| rt.fopen(PATH, MODE_R) as i64)
    .call(|rt, r| rt.fgets(BUF, 64, r[3] as u32) as i64)
    .call(|rt, r| rt.fgetc(r[3] as u32) as i64)
    .call(|rt, r| rt.feof(r[3] as u32) as i64)
    .call(|rt, r| rt.fread(BUF + 64, 1, 64, r[3] as u32) as i64)
    .call(|rt, r| rt.feof(r[3] as u32) as i64)
    .call(|rt, r| rt.fclose(r[3] as u32) as i64)
    .install(&mut rt);

  rt.run().unwrap();

  let results = results.borrow();
  assert_eq!(results.len(), 10);
  assert_eq!(results[0], 4);
  assert_eq!(results[1], 0);
  assert_eq!(results[2], 0);
  assert_eq!(results[3], 5);
  assert_eq!(results[4], BUF as i64);
  assert_eq!(results[5], 'w' as i64);
  assert_eq!(results[6], 0);
  assert_eq!(results[7], 5);
  assert_eq!(results[8], 1);
  assert_eq!(results[9], 0);

  assert_eq!(rt.memory().c_str(BUF).unwrap(), b"hello\n");
  assert_eq!(rt.memory().bytes(BUF + 64, 5).unwrap(), b"orld\n");
  assert_eq!(backend.contents("/notes.txt").unwrap(), b"hello\nworld\n");
  assert_eq!(backend.open_files(), 0);

  // open, flush, close, open, two refills for fgets, two for fread, close
  assert_eq!(rt.switch().unwinds, 9);
  assert_eq!(rt.switch().rewinds, 9);
}

#[test]
fn large_write_goes_out_in_one_batch() {
  let config = RuntimeConfig::builder().buffer_size(8).build().unwrap();
  let (mut rt, backend, _) = setup(config);
  rt.memory_mut().fill(BUF, 20, b'x').unwrap();

  let results = Script::new()
    .call(|rt, _| rt.fopen(PATH, MODE_W) as i64)
    .call(|rt, r| rt.fwrite(BUF, 1, 3, r[0] as u32) as i64)
    .call(|rt, r| rt.fwrite(BUF, 4, 5, r[0] as u32) as i64)
    .call(|rt, _| rt.events().in_flight() as i64)
    .call(|rt, r| rt.fclose(r[0] as u32) as i64)
    .install(&mut rt);

  rt.run().unwrap();

  assert_eq!(*results.borrow(), vec![4, 3, 5, 0, 0]);
  assert_eq!(backend.contents("/notes.txt").unwrap(), vec![b'x'; 23]);
}

#[test]
fn missing_file_is_answered_without_waiting() {
  let (mut rt, _, _) = setup(RuntimeConfig::default());

  let results = Script::new()
    .call(|rt, _| rt.fopen(PATH, MODE_R) as i64)
    .call(|rt, _| rt.errno() as i64)
    .install(&mut rt);

  assert_eq!(rt.start().unwrap(), Status::Finished);
  assert_eq!(*results.borrow(), vec![0, libc::ENOENT as i64]);
  assert_eq!(rt.switch().rewinds, 0);
}

#[test]
fn read_only_mount_refuses_writers() {
  let (mut rt, backend, _) = setup(RuntimeConfig::default());
  backend.insert("/notes.txt", "kept");
  rt.mount("/", Rc::new(backend.clone()), Access::READ_ONLY);

  let results = Script::new()
    .call(|rt, _| rt.fopen(PATH, MODE_W) as i64)
    .call(|rt, _| rt.errno() as i64)
    .call(|rt, _| rt.remove(PATH) as i64)
    .call(|rt, _| rt.access(PATH, libc::R_OK) as i64)
    .install(&mut rt);

  rt.run().unwrap();

  assert_eq!(*results.borrow(), vec![0, libc::EACCES as i64, -1, 0]);
  assert_eq!(backend.contents("/notes.txt").unwrap(), b"kept");
}

#[test]
fn remove_deletes_through_a_suspension() {
  let (mut rt, backend, _) = setup(RuntimeConfig::default());
  backend.insert("/notes.txt", "bye");

  let results = Script::new()
    .call(|rt, _| rt.remove(PATH) as i64)
    .call(|rt, _| rt.access(PATH, libc::F_OK) as i64)
    .install(&mut rt);

  rt.run().unwrap();

  assert_eq!(*results.borrow(), vec![0, -1]);
  assert!(backend.contents("/notes.txt").is_none());
}

#[test]
fn printf_from_the_module() {
  let (mut rt, _, console) = setup(RuntimeConfig::default());
  {
    let memory = rt.memory_mut();
    memory.write_c_str(FMT, b"%s: %5.1f%% of %lld (%c) %p\n").unwrap();
    memory.write_u32(VA, PATH).unwrap();
    memory.write_f64(VA + 8, 99.44).unwrap();
    memory.write_u64(VA + 16, 1 << 40).unwrap();
    memory.write_u32(VA + 24, 'z' as u32).unwrap();
    memory.write_u32(VA + 28, 0xbeef).unwrap();
  }

  let results = Script::new()
    .call(|rt, _| rt.printf(FMT, VA) as i64)
    .call(|rt, _| rt.putchar('!' as i32) as i64)
    .install(&mut rt);

  rt.run().unwrap();

  let line = "/notes.txt:  99.4% of 1099511627776 (z) 0xbeef";
  assert_eq!(*results.borrow(), vec![line.len() as i64 + 1, '!' as i64]);
  assert_eq!(console.stdout(), vec![line.to_string(), "!".to_string()]);
}

#[test]
fn fprintf_to_a_file() {
  let (mut rt, backend, _) = setup(RuntimeConfig::default());
  {
    let memory = rt.memory_mut();
    memory.write_c_str(FMT, b"%d-%x\n").unwrap();
    memory.write_u32(VA, -7i32 as u32).unwrap();
    memory.write_u32(VA + 4, 255).unwrap();
  }

  let results = Script::new()
    .call(|rt, _| rt.fopen(PATH, MODE_W) as i64)
    .call(|rt, r| rt.fprintf(r[0] as u32, FMT, VA) as i64)
    .call(|rt, r| rt.fflush(r[0] as u32) as i64)
    .call(|rt, r| rt.fclose(r[0] as u32) as i64)
    .install(&mut rt);

  rt.run().unwrap();

  assert_eq!(*results.borrow(), vec![4, 6, 0, 0]);
  assert_eq!(backend.contents("/notes.txt").unwrap(), b"-7-ff\n");
}

#[test]
fn ungetc_and_clearerr() {
  let (mut rt, backend, _) = setup(RuntimeConfig::default());
  backend.insert("/notes.txt", "ab");

  let results = Script::new()
    .call(|rt, _| rt.fopen(PATH, MODE_R) as i64)
    .call(|rt, r| rt.fgetc(r[0] as u32) as i64)
    .call(|rt, r| rt.ungetc('q' as i32, r[0] as u32) as i64)
    .call(|rt, r| rt.getc(r[0] as u32) as i64)
    .call(|rt, r| rt.fgetc(r[0] as u32) as i64)
    .call(|rt, r| rt.fgetc(r[0] as u32) as i64)
    .call(|rt, r| rt.feof(r[0] as u32) as i64)
    .call(|rt, r| rt.fputc('c' as i32, r[0] as u32) as i64)
    .call(|rt, r| rt.ferror(r[0] as u32) as i64)
    .call(|rt, r| {
      rt.clearerr(r[0] as u32);
      (rt.feof(r[0] as u32) + rt.ferror(r[0] as u32)) as i64
    })
    .call(|rt, r| rt.fclose(r[0] as u32) as i64)
    .install(&mut rt);

  rt.run().unwrap();

  assert_eq!(
    *results.borrow(),
    vec![
      4,
      'a' as i64,
      'q' as i64,
      'q' as i64,
      'b' as i64,
      EOF as i64,
      1,
      EOF as i64,
      1,
      0,
      0
    ]
  );
}

#[test]
fn heap_calls_from_the_module() {
  let (mut rt, _, _) = setup(RuntimeConfig::default());

  let results = Script::new()
    .call(|rt, _| rt.malloc(300) as i64)
    .call(|rt, _| rt.calloc(4, 8) as i64)
    .call(|rt, r| rt.realloc(r[0] as u32, 2000) as i64)
    .call(|rt, r| {
      rt.free(r[2] as u32);
      rt.free(r[1] as u32);
      rt.heap().unwrap().stats().live_allocations as i64
    })
    .install(&mut rt);

  assert_eq!(rt.start().unwrap(), Status::Finished);

  let results = results.borrow();
  assert_eq!(results[0], HEAP_BASE as i64);
  assert_eq!(results[1], HEAP_BASE as i64 + 512);
  assert_eq!(results[3], 0);
  assert!(rt.heap().unwrap().check_consistency().is_ok());
}

/// Opens through a channel the test controls.
struct GateBackend {
  gate: RefCell<Option<oneshot::Receiver<u32>>>,
}

impl Backend for GateBackend {
  fn open(
    &self,
    _path: &str,
    _mode: FileMode,
  ) -> Op<BackendHandle> {
    match self.gate.borrow_mut().take() {
      Some(rx) => Op::pending(async move {
        rx.await
          .map(BackendHandle)
          .map_err(|_| BackendError::Io("gate dropped".into()))
      }),
      None => Op::ready(Err(BackendError::Io("gate used".into()))),
    }
  }

  fn read(
    &self,
    _handle: BackendHandle,
  ) -> Op<Option<Vec<u8>>> {
    Op::ready(Ok(None))
  }

  fn write(
    &self,
    _handle: BackendHandle,
    bytes: Vec<u8>,
  ) -> Op<usize> {
    Op::ready(Ok(bytes.len()))
  }

  fn close(
    &self,
    _handle: BackendHandle,
  ) -> Op<()> {
    Op::ready(Ok(()))
  }

  fn stat(
    &self,
    path: &str,
  ) -> Op<Metadata> {
    Op::ready(Err(BackendError::NotFound(path.into())))
  }

  fn list(
    &self,
    _path: &str,
  ) -> Op<Vec<String>> {
    Op::ready(Ok(Vec::new()))
  }

  fn remove(
    &self,
    path: &str,
  ) -> Op<()> {
    Op::ready(Err(BackendError::NotFound(path.into())))
  }
}

#[test]
fn poll_waits_for_the_host() {
  let (mut rt, _, console) = setup(RuntimeConfig::default());
  let (tx, rx) = oneshot::channel();
  rt.mount(
    "/gate",
    Rc::new(GateBackend {
      gate: RefCell::new(Some(rx)),
    }),
    Access::READ_WRITE,
  );
  rt.memory_mut().write_c_str(PATH, b"/gate/x").unwrap();

  let results = Script::new()
    .call(|rt, _| rt.fopen(PATH, MODE_R) as i64)
    .call(|rt, _| rt.print("opened %d\n", &[Arg::Int(4)]) as i64)
    .install(&mut rt);

  assert_eq!(rt.start().unwrap(), Status::Pending);
  assert_eq!(rt.poll().unwrap(), Status::Pending);
  assert_eq!(rt.poll().unwrap(), Status::Pending);
  assert!(results.borrow().is_empty());

  tx.send(77).unwrap();
  assert_eq!(rt.poll().unwrap(), Status::Finished);
  assert_eq!(*results.borrow(), vec![4, 9]);
  assert_eq!(console.stdout(), vec!["opened 4"]);
}

#[test]
fn dropped_operation_surfaces_as_io_error() {
  let (mut rt, _, _) = setup(RuntimeConfig::default());
  let (tx, rx) = oneshot::channel::<u32>();
  rt.mount(
    "/gate",
    Rc::new(GateBackend {
      gate: RefCell::new(Some(rx)),
    }),
    Access::READ_WRITE,
  );
  rt.memory_mut().write_c_str(PATH, b"/gate/x").unwrap();

  let results = Script::new()
    .call(|rt, _| rt.fopen(PATH, MODE_R) as i64)
    .call(|rt, _| rt.errno() as i64)
    .install(&mut rt);

  assert_eq!(rt.start().unwrap(), Status::Pending);
  drop(tx);
  assert_eq!(rt.poll().unwrap(), Status::Finished);

  assert_eq!(*results.borrow(), vec![0, libc::EIO as i64]);
}

/// Every operation waits a turn; writes always fail.
struct FailingWriteBackend;

impl Backend for FailingWriteBackend {
  fn open(
    &self,
    _path: &str,
    _mode: FileMode,
  ) -> Op<BackendHandle> {
    Op::pending(async { Ok(BackendHandle(9)) })
  }

  fn read(
    &self,
    _handle: BackendHandle,
  ) -> Op<Option<Vec<u8>>> {
    Op::pending(async { Ok(None) })
  }

  fn write(
    &self,
    _handle: BackendHandle,
    _bytes: Vec<u8>,
  ) -> Op<usize> {
    Op::pending(async { Err(BackendError::Io("disk full".into())) })
  }

  fn close(
    &self,
    _handle: BackendHandle,
  ) -> Op<()> {
    Op::pending(async { Ok(()) })
  }

  fn stat(
    &self,
    path: &str,
  ) -> Op<Metadata> {
    Op::ready(Err(BackendError::NotFound(path.into())))
  }

  fn list(
    &self,
    _path: &str,
  ) -> Op<Vec<String>> {
    Op::ready(Ok(Vec::new()))
  }

  fn remove(
    &self,
    path: &str,
  ) -> Op<()> {
    Op::ready(Err(BackendError::NotFound(path.into())))
  }
}

#[test]
fn fclose_reports_a_failed_flush_after_a_waiting_close() {
  let (mut rt, _, _) = setup(RuntimeConfig::default());
  rt.mount("/flaky", Rc::new(FailingWriteBackend), Access::READ_WRITE);
  rt.memory_mut().write_c_str(PATH, b"/flaky/out").unwrap();

  let results = Script::new()
    .call(|rt, _| rt.fopen(PATH, MODE_W) as i64)
    .call(|rt, r| rt.fputs(TEXT, r[0] as u32) as i64)
    .call(|rt, r| rt.fclose(r[0] as u32) as i64)
    .call(|rt, _| rt.errno() as i64)
    .install(&mut rt);

  rt.run().unwrap();

  assert_eq!(*results.borrow(), vec![4, 0, EOF as i64, libc::EIO as i64]);
  // open, flush, close
  assert_eq!(rt.switch().unwinds, 3);
}

#[test]
fn fclose_after_an_earlier_failed_flush_with_nothing_buffered() {
  let (mut rt, _, _) = setup(RuntimeConfig::default());
  rt.mount("/flaky", Rc::new(FailingWriteBackend), Access::READ_WRITE);
  rt.memory_mut().write_c_str(PATH, b"/flaky/out").unwrap();

  let results = Script::new()
    .call(|rt, _| rt.fopen(PATH, MODE_W) as i64)
    .call(|rt, r| rt.fputs(TEXT, r[0] as u32) as i64)
    .call(|rt, r| rt.fflush(r[0] as u32) as i64)
    .call(|rt, r| rt.ferror(r[0] as u32) as i64)
    .call(|rt, r| rt.fclose(r[0] as u32) as i64)
    .install(&mut rt);

  rt.run().unwrap();

  assert_eq!(*results.borrow(), vec![4, 0, EOF as i64, 1, 0]);
}

#[test]
fn starting_twice_while_suspended_is_refused() {
  let (mut rt, _, _) = setup(RuntimeConfig::default());

  Script::new()
    .call(|rt, _| rt.fopen(PATH, MODE_W) as i64)
    .install(&mut rt);

  assert_eq!(rt.start().unwrap(), Status::Pending);
  assert!(matches!(
    rt.start(),
    Err(RuntimeError::Suspend(SuspendError::InvalidState { .. }))
  ));
  assert_eq!(rt.poll().unwrap(), Status::Finished);
  assert_eq!(rt.fputc('a' as i32, STDOUT), 'a' as i32);
}
