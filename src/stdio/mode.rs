use crate::error::ModeError;

/// A parsed `fopen` mode string.
///
/// ```text
///   mode  read  write  create  truncate  append
///   r      x
///   r+     x     x
///   w            x      x        x
///   w+     x     x      x        x
///   a            x      x                  x
///   a+     x     x      x                  x
/// ```
///
/// `b` may appear anywhere after the first character and only sets
/// `binary`; there is no text translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileMode {
  pub read: bool,
  pub write: bool,
  pub create: bool,
  pub truncate: bool,
  pub append: bool,
  pub binary: bool,
}

impl FileMode {
  pub fn parse(mode: &str) -> Result<Self, ModeError> {
    let invalid = || ModeError(mode.to_string());

    let mut chars = mode.chars();
    let mut parsed = match chars.next() {
      Some('r') => FileMode {
        read: true,
        ..FileMode::default()
      },
      Some('w') => FileMode {
        write: true,
        create: true,
        truncate: true,
        ..FileMode::default()
      },
      Some('a') => FileMode {
        write: true,
        create: true,
        append: true,
        ..FileMode::default()
      },
      _ => return Err(invalid()),
    };

    let mut update = false;
    for c in chars {
      match c {
        '+' if !update => update = true,
        'b' if !parsed.binary => parsed.binary = true,
        _ => return Err(invalid()),
      }
    }

    if update {
      parsed.read = true;
      parsed.write = true;
    }

    Ok(parsed)
  }
}
