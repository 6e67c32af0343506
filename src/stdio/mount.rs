use std::rc::Rc;

use crate::error::BackendError;

use super::{Backend, FileMode};

/// What a mount allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
  pub read: bool,
  pub write: bool,
}

impl Access {
  pub const READ_WRITE: Access = Access { read: true, write: true };
  pub const READ_ONLY: Access = Access { read: true, write: false };

  /// Parses `"r"`, `"w"` or `"rw"`.
  pub fn parse(flags: &str) -> Option<Self> {
    match flags {
      "r" => Some(Access::READ_ONLY),
      "w" => Some(Access { read: false, write: true }),
      "rw" | "wr" => Some(Access::READ_WRITE),
      _ => None,
    }
  }

  pub fn permits(
    &self,
    mode: FileMode,
  ) -> bool {
    (!mode.read || self.read) && (!mode.write || self.write)
  }
}

struct Mount {
  prefix: String,
  backend: Rc<dyn Backend>,
  access: Access,
}

/// A mount matched against a path.
pub struct Resolved {
  pub backend: Rc<dyn Backend>,
  /// The path below the mount point, starting with `/`.
  pub path: String,
  pub access: Access,
}

/// Path prefixes bound to backends. The longest matching prefix wins.
#[derive(Default)]
pub struct Mounts {
  mounts: Vec<Mount>,
}

impl Mounts {
  pub fn new() -> Self {
    Self::default()
  }

  /// Binds `prefix` to `backend`, replacing an earlier mount at the same
  /// prefix.
  pub fn mount(
    &mut self,
    prefix: &str,
    backend: Rc<dyn Backend>,
    access: Access,
  ) {
    let prefix = normalize(prefix);
    self.mounts.retain(|mount| mount.prefix != prefix);

    tracing::debug!(prefix, ?access, "mounted backend");

    self.mounts.push(Mount { prefix, backend, access });
    self
      .mounts
      .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
  }

  pub fn len(&self) -> usize {
    self.mounts.len()
  }

  pub fn is_empty(&self) -> bool {
    self.mounts.is_empty()
  }

  pub fn resolve(
    &self,
    path: &str,
  ) -> Result<Resolved, BackendError> {
    let path = normalize(path);

    self
      .mounts
      .iter()
      .find_map(|mount| {
        let rest = below(&mount.prefix, &path)?;
        Some(Resolved {
          backend: Rc::clone(&mount.backend),
          path: rest,
          access: mount.access,
        })
      })
      .ok_or(BackendError::NoMount(path))
  }
}

/// Leading slash, no trailing slash except for the root.
fn normalize(path: &str) -> String {
  let trimmed = path.trim_end_matches('/');
  if trimmed.starts_with('/') {
    trimmed.to_string()
  } else {
    format!("/{trimmed}")
  }
}

fn below(
  prefix: &str,
  path: &str,
) -> Option<String> {
  if prefix == "/" {
    return Some(path.to_string());
  }

  match path.strip_prefix(prefix)? {
    "" => Some("/".to_string()),
    rest if rest.starts_with('/') => Some(rest.to_string()),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::stdio::MemoryBackend;

  fn backend() -> Rc<dyn Backend> {
    Rc::new(MemoryBackend::default())
  }

  #[test]
  fn test_longest_prefix_wins() {
    let mut mounts = Mounts::new();
    mounts.mount("/", backend(), Access::READ_WRITE);
    mounts.mount("/assets", backend(), Access::READ_ONLY);

    let resolved = mounts.resolve("/assets/level1.map").unwrap();
    assert_eq!(resolved.path, "/level1.map");
    assert_eq!(resolved.access, Access::READ_ONLY);

    let resolved = mounts.resolve("/assets2/x").unwrap();
    assert_eq!(resolved.path, "/assets2/x");
    assert_eq!(resolved.access, Access::READ_WRITE);

    assert_eq!(mounts.resolve("/assets").unwrap().path, "/");
  }

  #[test]
  fn test_relative_paths_are_rooted() {
    let mut mounts = Mounts::new();
    mounts.mount("/", backend(), Access::READ_WRITE);

    assert_eq!(mounts.resolve("save.dat").unwrap().path, "/save.dat");
  }

  #[test]
  fn test_no_mount() {
    let mut mounts = Mounts::new();
    mounts.mount("/data/", backend(), Access::READ_WRITE);

    assert!(matches!(mounts.resolve("/other"), Err(BackendError::NoMount(_))));
    assert_eq!(mounts.len(), 1);
  }

  #[test]
  fn test_access_flags() {
    let read = FileMode::parse("r").unwrap();
    let update = FileMode::parse("r+").unwrap();

    assert!(Access::READ_ONLY.permits(read));
    assert!(!Access::READ_ONLY.permits(update));
    assert!(Access::READ_WRITE.permits(update));
    assert_eq!(Access::parse("rw"), Some(Access::READ_WRITE));
    assert_eq!(Access::parse("x"), None);
  }
}
