use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use crate::error::BackendError;
use crate::pending::Op;

use super::FileMode;

/// A backend's own identifier for an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
  pub size: u64,
  pub is_dir: bool,
}

/// Storage behind a mount point.
///
/// Paths arrive relative to the mount, always starting with `/`. Every
/// method may answer right away with [`Op::Ready`] or later with
/// [`Op::Pending`]; a ready answer spares the module a suspension.
pub trait Backend {
  fn open(
    &self,
    path: &str,
    mode: FileMode,
  ) -> Op<BackendHandle>;

  /// The next chunk from the file cursor, `None` at end of file.
  fn read(
    &self,
    handle: BackendHandle,
  ) -> Op<Option<Vec<u8>>>;

  fn write(
    &self,
    handle: BackendHandle,
    bytes: Vec<u8>,
  ) -> Op<usize>;

  fn close(
    &self,
    handle: BackendHandle,
  ) -> Op<()>;

  fn stat(
    &self,
    path: &str,
  ) -> Op<Metadata>;

  fn list(
    &self,
    path: &str,
  ) -> Op<Vec<String>>;

  fn remove(
    &self,
    path: &str,
  ) -> Op<()>;
}

#[derive(Debug)]
struct OpenFile {
  path: String,
  cursor: usize,
  append: bool,
}

#[derive(Debug)]
struct Store {
  files: BTreeMap<String, Vec<u8>>,
  open: HashMap<u32, OpenFile>,
  next_handle: u32,
  chunk: usize,
}

/// Files kept in host memory, the default `/` mount.
///
/// Clones share the same store, so a host can keep one to seed and
/// inspect files while the runtime owns another.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
  store: Rc<RefCell<Store>>,
}

impl MemoryBackend {
  pub fn new(chunk: usize) -> Self {
    Self {
      store: Rc::new(RefCell::new(Store {
        files: BTreeMap::new(),
        open: HashMap::new(),
        next_handle: 1,
        chunk: chunk.max(1),
      })),
    }
  }

  pub fn insert(
    &self,
    path: &str,
    contents: impl Into<Vec<u8>>,
  ) {
    self
      .store
      .borrow_mut()
      .files
      .insert(path.to_string(), contents.into());
  }

  pub fn contents(
    &self,
    path: &str,
  ) -> Option<Vec<u8>> {
    self.store.borrow().files.get(path).cloned()
  }

  pub fn open_files(&self) -> usize {
    self.store.borrow().open.len()
  }

  fn is_dir(
    files: &BTreeMap<String, Vec<u8>>,
    path: &str,
  ) -> bool {
    let prefix = dir_prefix(path);
    path == "/" || files.keys().any(|name| name.starts_with(&prefix))
  }
}

impl Default for MemoryBackend {
  fn default() -> Self {
    Self::new(4096)
  }
}

fn dir_prefix(path: &str) -> String {
  if path.ends_with('/') {
    path.to_string()
  } else {
    format!("{path}/")
  }
}

impl Backend for MemoryBackend {
  fn open(
    &self,
    path: &str,
    mode: FileMode,
  ) -> Op<BackendHandle> {
    let mut store = self.store.borrow_mut();

    if !store.files.contains_key(path) {
      if !mode.create {
        return Op::ready(Err(BackendError::NotFound(path.to_string())));
      }
      if Self::is_dir(&store.files, path) {
        return Op::ready(Err(BackendError::PermissionDenied(path.to_string())));
      }
      store.files.insert(path.to_string(), Vec::new());
    } else if mode.truncate {
      store.files.insert(path.to_string(), Vec::new());
    }

    let handle = store.next_handle;
    store.next_handle += 1;
    store.open.insert(
      handle,
      OpenFile {
        path: path.to_string(),
        cursor: 0,
        append: mode.append,
      },
    );

    Op::pending(async move { Ok(BackendHandle(handle)) })
  }

  fn read(
    &self,
    handle: BackendHandle,
  ) -> Op<Option<Vec<u8>>> {
    let mut store = self.store.borrow_mut();
    let chunk = store.chunk;
    let Store { files, open, .. } = &mut *store;

    let Some(file) = open.get_mut(&handle.0) else {
      return Op::ready(Err(BackendError::BadHandle(handle.0)));
    };
    let data = files.get(&file.path).map(Vec::as_slice).unwrap_or_default();

    let result = if file.cursor >= data.len() {
      None
    } else {
      let end = (file.cursor + chunk).min(data.len());
      let bytes = data[file.cursor..end].to_vec();
      file.cursor = end;
      Some(bytes)
    };

    Op::pending(async move { Ok(result) })
  }

  fn write(
    &self,
    handle: BackendHandle,
    bytes: Vec<u8>,
  ) -> Op<usize> {
    let mut store = self.store.borrow_mut();
    let Store { files, open, .. } = &mut *store;

    let Some(file) = open.get_mut(&handle.0) else {
      return Op::ready(Err(BackendError::BadHandle(handle.0)));
    };
    let data = files.entry(file.path.clone()).or_default();

    if file.append {
      file.cursor = data.len();
    }

    let end = file.cursor + bytes.len();
    if data.len() < end {
      data.resize(end, 0);
    }
    data[file.cursor..end].copy_from_slice(&bytes);
    file.cursor = end;

    let written = bytes.len();
    Op::pending(async move { Ok(written) })
  }

  fn close(
    &self,
    handle: BackendHandle,
  ) -> Op<()> {
    match self.store.borrow_mut().open.remove(&handle.0) {
      Some(_) => Op::pending(async { Ok(()) }),
      None => Op::ready(Err(BackendError::BadHandle(handle.0))),
    }
  }

  fn stat(
    &self,
    path: &str,
  ) -> Op<Metadata> {
    let store = self.store.borrow();

    let result = match store.files.get(path) {
      Some(data) => Ok(Metadata {
        size: data.len() as u64,
        is_dir: false,
      }),
      None if Self::is_dir(&store.files, path) => Ok(Metadata {
        size: 0,
        is_dir: true,
      }),
      None => return Op::ready(Err(BackendError::NotFound(path.to_string()))),
    };

    Op::pending(async move { result })
  }

  fn list(
    &self,
    path: &str,
  ) -> Op<Vec<String>> {
    let store = self.store.borrow();

    if !Self::is_dir(&store.files, path) {
      return Op::ready(Err(BackendError::NotFound(path.to_string())));
    }

    let prefix = dir_prefix(path);
    let names: BTreeSet<String> = store
      .files
      .keys()
      .filter_map(|name| name.strip_prefix(&prefix))
      .filter_map(|rest| rest.split('/').next())
      .filter(|entry| !entry.is_empty())
      .map(str::to_string)
      .collect();

    let names: Vec<String> = names.into_iter().collect();
    Op::pending(async move { Ok(names) })
  }

  fn remove(
    &self,
    path: &str,
  ) -> Op<()> {
    match self.store.borrow_mut().files.remove(path) {
      Some(_) => Op::pending(async { Ok(()) }),
      None => Op::ready(Err(BackendError::NotFound(path.to_string()))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::executor::block_on;

  fn finish<T: 'static>(op: Op<T>) -> Result<T, BackendError> {
    match op {
      Op::Ready(result) => result,
      Op::Pending(future) => block_on(future),
    }
  }

  fn mode(text: &str) -> FileMode {
    FileMode::parse(text).unwrap()
  }

  #[test]
  fn test_missing_file_is_ready_error() {
    let backend = MemoryBackend::default();

    let op = backend.open("/nope", mode("r"));

    assert!(op.is_ready());
    assert_eq!(finish(op), Err(BackendError::NotFound("/nope".into())));
  }

  #[test]
  fn test_chunked_reads() {
    let backend = MemoryBackend::new(4);
    backend.insert("/data.bin", b"0123456789".to_vec());

    let handle = finish(backend.open("/data.bin", mode("rb"))).unwrap();

    assert_eq!(finish(backend.read(handle)).unwrap(), Some(b"0123".to_vec()));
    assert_eq!(finish(backend.read(handle)).unwrap(), Some(b"4567".to_vec()));
    assert_eq!(finish(backend.read(handle)).unwrap(), Some(b"89".to_vec()));
    assert_eq!(finish(backend.read(handle)).unwrap(), None);
  }

  #[test]
  fn test_write_truncate_and_append() {
    let backend = MemoryBackend::default();
    backend.insert("/log.txt", b"old contents".to_vec());

    let handle = finish(backend.open("/log.txt", mode("w"))).unwrap();
    assert_eq!(finish(backend.write(handle, b"one\n".to_vec())).unwrap(), 4);
    finish(backend.close(handle)).unwrap();
    assert_eq!(backend.contents("/log.txt").unwrap(), b"one\n");

    let handle = finish(backend.open("/log.txt", mode("a"))).unwrap();
    finish(backend.write(handle, b"two\n".to_vec())).unwrap();
    finish(backend.close(handle)).unwrap();
    assert_eq!(backend.contents("/log.txt").unwrap(), b"one\ntwo\n");
    assert_eq!(backend.open_files(), 0);
  }

  #[test]
  fn test_update_mode_overwrites_in_place() {
    let backend = MemoryBackend::default();
    backend.insert("/f", b"abcdef".to_vec());

    let handle = finish(backend.open("/f", mode("r+"))).unwrap();
    finish(backend.write(handle, b"XY".to_vec())).unwrap();

    assert_eq!(backend.contents("/f").unwrap(), b"XYcdef");
  }

  #[test]
  fn test_stat_list_remove() {
    let backend = MemoryBackend::default();
    backend.insert("/saves/a.sav", vec![1, 2, 3]);
    backend.insert("/saves/b.sav", vec![]);
    backend.insert("/saves/old/c.sav", vec![]);

    assert_eq!(
      finish(backend.stat("/saves/a.sav")).unwrap(),
      Metadata { size: 3, is_dir: false }
    );
    assert!(finish(backend.stat("/saves")).unwrap().is_dir);
    assert_eq!(
      finish(backend.list("/saves")).unwrap(),
      vec!["a.sav".to_string(), "b.sav".into(), "old".into()]
    );

    finish(backend.remove("/saves/a.sav")).unwrap();
    assert!(backend.contents("/saves/a.sav").is_none());
    assert!(backend.remove("/saves/a.sav").is_ready());
    assert!(finish(backend.stat("/missing")).is_err());
  }

  #[test]
  fn test_stale_handle() {
    let backend = MemoryBackend::default();

    assert_eq!(finish(backend.read(BackendHandle(99))), Err(BackendError::BadHandle(99)));
    assert_eq!(finish(backend.close(BackendHandle(99))), Err(BackendError::BadHandle(99)));
  }
}
