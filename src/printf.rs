//! printf-style formatting.
//!
//! Formatting pulls its arguments from an [`ArgSource`]: either a typed
//! list built on the host ([`Args`]) or a wasm32 `va_list` in linear
//! memory ([`VaList`]). The output is raw bytes; `%s` copies whatever the
//! string holds.
//!
//! ```text
//!   %[flags][width][.precision][length]conversion
//!
//!   flags       -  0  +  space  #
//!   width       digits or *
//!   precision   digits or *
//!   length      hh h l ll j z t L   (wasm32: long is 32 bits)
//!   conversion  d i u o x X c s p f F e E g G %
//! ```

use crate::error::{FormatError, MemoryError};
use crate::memory::LinearMemory;

/// Widths and precisions must fit a C `int`.
const INT_MAX: usize = i32::MAX as usize;

/// An `f64` has no nonzero decimal digits past this many fractional places.
const EXACT_DIGITS: usize = 1100;

/// A host-side printf argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
  Int(i64),
  Float(f64),
  Str(Vec<u8>),
  Ptr(u32),
}

impl From<i32> for Arg {
  fn from(value: i32) -> Self {
    Arg::Int(value as i64)
  }
}

impl From<i64> for Arg {
  fn from(value: i64) -> Self {
    Arg::Int(value)
  }
}

impl From<u32> for Arg {
  fn from(value: u32) -> Self {
    Arg::Int(value as i64)
  }
}

impl From<f64> for Arg {
  fn from(value: f64) -> Self {
    Arg::Float(value)
  }
}

impl From<&str> for Arg {
  fn from(value: &str) -> Self {
    Arg::Str(value.as_bytes().to_vec())
  }
}

/// The width of an integer argument as read from the argument source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntWidth {
  W8,
  W16,
  W32,
  W64,
}

impl IntWidth {
  fn bits(self) -> u32 {
    match self {
      IntWidth::W8 => 8,
      IntWidth::W16 => 16,
      IntWidth::W32 => 32,
      IntWidth::W64 => 64,
    }
  }

  /// Sign-extends the low bits of `raw`.
  fn signed(
    self,
    raw: i64,
  ) -> i64 {
    let shift = 64 - self.bits();
    (raw << shift) >> shift
  }

  /// Zero-extends the low bits of `raw`.
  fn unsigned(
    self,
    raw: i64,
  ) -> u64 {
    let shift = 64 - self.bits();
    ((raw as u64) << shift) >> shift
  }
}

/// Supplies arguments in conversion order.
///
/// `conv` is the conversion character, used for error reporting.
pub trait ArgSource {
  /// The raw integer; the caller narrows it to the conversion's width.
  fn next_int(
    &mut self,
    width: IntWidth,
    conv: char,
  ) -> Result<i64, FormatError>;

  fn next_float(
    &mut self,
    conv: char,
  ) -> Result<f64, FormatError>;

  fn next_ptr(
    &mut self,
    conv: char,
  ) -> Result<u32, FormatError>;

  /// The bytes of a `%s` argument, `None` for a null pointer.
  fn next_str(
    &mut self,
    conv: char,
  ) -> Result<Option<Vec<u8>>, FormatError>;
}

/// A typed argument list.
pub struct Args<'a> {
  args: std::slice::Iter<'a, Arg>,
}

impl<'a> Args<'a> {
  pub fn new(args: &'a [Arg]) -> Self {
    Self { args: args.iter() }
  }

  fn next(
    &mut self,
    conv: char,
  ) -> Result<&'a Arg, FormatError> {
    self.args.next().ok_or(FormatError::MissingArgument(conv))
  }
}

impl ArgSource for Args<'_> {
  fn next_int(
    &mut self,
    _width: IntWidth,
    conv: char,
  ) -> Result<i64, FormatError> {
    match self.next(conv)? {
      Arg::Int(value) => Ok(*value),
      Arg::Ptr(value) => Ok(*value as i64),
      _ => Err(FormatError::ArgumentType(conv)),
    }
  }

  fn next_float(
    &mut self,
    conv: char,
  ) -> Result<f64, FormatError> {
    match self.next(conv)? {
      Arg::Float(value) => Ok(*value),
      Arg::Int(value) => Ok(*value as f64),
      _ => Err(FormatError::ArgumentType(conv)),
    }
  }

  fn next_ptr(
    &mut self,
    conv: char,
  ) -> Result<u32, FormatError> {
    match self.next(conv)? {
      Arg::Ptr(value) => Ok(*value),
      Arg::Int(value) => Ok(*value as u32),
      _ => Err(FormatError::ArgumentType(conv)),
    }
  }

  fn next_str(
    &mut self,
    conv: char,
  ) -> Result<Option<Vec<u8>>, FormatError> {
    match self.next(conv)? {
      Arg::Str(bytes) => Ok(Some(bytes.clone())),
      Arg::Ptr(0) => Ok(None),
      _ => Err(FormatError::ArgumentType(conv)),
    }
  }
}

/// A wasm32 `va_list`: a pointer walking an argument area in memory.
///
/// Integers narrower than 64 bits and pointers take 4 bytes; `long long`
/// and `double` take 8 bytes at an 8-byte boundary.
pub struct VaList<'a, M: LinearMemory> {
  memory: &'a M,
  cursor: u32,
}

impl<'a, M: LinearMemory> VaList<'a, M> {
  pub fn new(
    memory: &'a M,
    cursor: u32,
  ) -> Self {
    Self { memory, cursor }
  }

  pub fn cursor(&self) -> u32 {
    self.cursor
  }

  fn take(
    &mut self,
    size: u32,
  ) -> Result<u32, FormatError> {
    let out_of_bounds = || MemoryError::OutOfBounds {
      addr: self.cursor,
      len: size,
      size: self.memory.size(),
    };

    let addr = self.cursor.checked_next_multiple_of(size).ok_or_else(out_of_bounds)?;
    let end = addr.checked_add(size).ok_or_else(out_of_bounds)?;
    self.cursor = end;
    Ok(addr)
  }
}

impl<M: LinearMemory> ArgSource for VaList<'_, M> {
  fn next_int(
    &mut self,
    width: IntWidth,
    _conv: char,
  ) -> Result<i64, FormatError> {
    if width == IntWidth::W64 {
      let addr = self.take(8)?;
      return Ok(self.memory.read_i64(addr)?);
    }

    let addr = self.take(4)?;
    Ok(self.memory.read_i32(addr)? as i64)
  }

  fn next_float(
    &mut self,
    _conv: char,
  ) -> Result<f64, FormatError> {
    let addr = self.take(8)?;
    Ok(self.memory.read_f64(addr)?)
  }

  fn next_ptr(
    &mut self,
    _conv: char,
  ) -> Result<u32, FormatError> {
    let addr = self.take(4)?;
    Ok(self.memory.read_u32(addr)?)
  }

  fn next_str(
    &mut self,
    conv: char,
  ) -> Result<Option<Vec<u8>>, FormatError> {
    match self.next_ptr(conv)? {
      0 => Ok(None),
      ptr => Ok(Some(self.memory.c_str(ptr)?.to_vec())),
    }
  }
}

#[derive(Debug, Clone, Copy, Default)]
struct Spec {
  left: bool,
  zero: bool,
  plus: bool,
  space: bool,
  alt: bool,
  width: usize,
  precision: Option<usize>,
}

/// Expands `format` with arguments from `args`.
pub fn format<A: ArgSource>(
  format: &[u8],
  args: &mut A,
) -> Result<Vec<u8>, FormatError> {
  let mut out = Vec::with_capacity(format.len());
  let mut i = 0;

  while i < format.len() {
    let byte = format[i];
    i += 1;

    if byte != b'%' {
      out.push(byte);
      continue;
    }

    let start = i - 1;
    let mut spec = Spec::default();

    while let Some(&flag) = format.get(i) {
      match flag {
        b'-' => spec.left = true,
        b'0' => spec.zero = true,
        b'+' => spec.plus = true,
        b' ' => spec.space = true,
        b'#' => spec.alt = true,
        _ => break,
      }
      i += 1;
    }

    if format.get(i) == Some(&b'*') {
      i += 1;
      let width = args.next_int(IntWidth::W32, '*')? as i32;
      if width < 0 {
        spec.left = true;
      }
      spec.width = width.unsigned_abs() as usize;
    } else {
      spec.width = digits(format, &mut i);
    }

    if format.get(i) == Some(&b'.') {
      i += 1;
      if format.get(i) == Some(&b'*') {
        i += 1;
        let precision = args.next_int(IntWidth::W32, '*')? as i32;
        spec.precision = usize::try_from(precision).ok();
      } else {
        spec.precision = Some(digits(format, &mut i));
      }
    }

    let width = length(format, &mut i);

    let Some(&conv) = format.get(i) else {
      out.extend_from_slice(&format[start..]);
      break;
    };
    i += 1;

    if spec.width > INT_MAX || spec.precision.is_some_and(|p| p > INT_MAX) {
      return Err(FormatError::Overflow(conv as char));
    }

    let body = match conv {
      b'%' => {
        out.push(b'%');
        continue;
      }
      b'd' | b'i' => {
        let value = width.signed(args.next_int(width, conv as char)?);
        signed(&spec, value)
      }
      b'u' | b'o' | b'x' | b'X' => {
        let value = width.unsigned(args.next_int(width, conv as char)?);
        unsigned(&spec, conv, value)
      }
      b'c' => {
        let value = args.next_int(IntWidth::W32, 'c')?;
        Field::plain(vec![value as u8])
      }
      b's' => {
        let mut text = args.next_str('s')?.unwrap_or_else(|| b"(null)".to_vec());
        if let Some(precision) = spec.precision {
          text.truncate(precision);
        }
        Field::plain(text)
      }
      b'p' => {
        let value = args.next_ptr('p')?;
        Field {
          sign: "",
          prefix: "0x",
          digits: format!("{value:x}").into_bytes(),
          numeric: false,
        }
      }
      b'f' | b'F' | b'e' | b'E' | b'g' | b'G' => {
        let value = args.next_float(conv as char)?;
        float(&spec, conv, value)
      }
      _ => {
        out.extend_from_slice(&format[start..i]);
        continue;
      }
    };

    body.pad_into(&spec, &mut out);
  }

  Ok(out)
}

fn digits(
  format: &[u8],
  i: &mut usize,
) -> usize {
  let mut value = 0usize;
  while let Some(&d) = format.get(*i).filter(|d| d.is_ascii_digit()) {
    value = value.saturating_mul(10).saturating_add((d - b'0') as usize);
    *i += 1;
  }
  value
}

fn length(
  format: &[u8],
  i: &mut usize,
) -> IntWidth {
  let rest = &format[*i..];

  let (width, consumed) = if rest.starts_with(b"hh") {
    (IntWidth::W8, 2)
  } else if rest.starts_with(b"ll") {
    (IntWidth::W64, 2)
  } else {
    match rest.first() {
      Some(b'h') => (IntWidth::W16, 1),
      Some(b'j') => (IntWidth::W64, 1),
      Some(b'l' | b'z' | b't' | b'L') => (IntWidth::W32, 1),
      _ => (IntWidth::W32, 0),
    }
  };

  *i += consumed;
  width
}

/// A converted value before padding: sign, radix prefix, then digits.
struct Field {
  sign: &'static str,
  prefix: &'static str,
  digits: Vec<u8>,
  /// Zero padding goes between the prefix and the digits.
  numeric: bool,
}

impl Field {
  fn plain(digits: Vec<u8>) -> Self {
    Self {
      sign: "",
      prefix: "",
      digits,
      numeric: false,
    }
  }

  fn pad_into(
    self,
    spec: &Spec,
    out: &mut Vec<u8>,
  ) {
    let len = self.sign.len() + self.prefix.len() + self.digits.len();
    let pad = spec.width.saturating_sub(len);

    if spec.left {
      out.extend_from_slice(self.sign.as_bytes());
      out.extend_from_slice(self.prefix.as_bytes());
      out.extend_from_slice(&self.digits);
      out.resize(out.len() + pad, b' ');
    } else if spec.zero && self.numeric {
      out.extend_from_slice(self.sign.as_bytes());
      out.extend_from_slice(self.prefix.as_bytes());
      out.resize(out.len() + pad, b'0');
      out.extend_from_slice(&self.digits);
    } else {
      out.resize(out.len() + pad, b' ');
      out.extend_from_slice(self.sign.as_bytes());
      out.extend_from_slice(self.prefix.as_bytes());
      out.extend_from_slice(&self.digits);
    }
  }
}

fn sign_of(
  spec: &Spec,
  negative: bool,
) -> &'static str {
  if negative {
    "-"
  } else if spec.plus {
    "+"
  } else if spec.space {
    " "
  } else {
    ""
  }
}

/// Applies an integer precision: minimum digit count, and `.0` of zero
/// prints nothing.
fn with_precision(
  spec: &Spec,
  digits: String,
  is_zero: bool,
) -> Vec<u8> {
  match spec.precision {
    Some(0) if is_zero => Vec::new(),
    Some(precision) if digits.len() < precision => {
      let mut padded = vec![b'0'; precision - digits.len()];
      padded.extend_from_slice(digits.as_bytes());
      padded
    }
    _ => digits.into_bytes(),
  }
}

fn signed(
  spec: &Spec,
  value: i64,
) -> Field {
  Field {
    sign: sign_of(spec, value < 0),
    prefix: "",
    digits: with_precision(spec, value.unsigned_abs().to_string(), value == 0),
    numeric: spec.precision.is_none(),
  }
}

fn unsigned(
  spec: &Spec,
  conv: u8,
  value: u64,
) -> Field {
  let text = match conv {
    b'o' => format!("{value:o}"),
    b'x' => format!("{value:x}"),
    b'X' => format!("{value:X}"),
    _ => value.to_string(),
  };
  let mut digits = with_precision(spec, text, value == 0);

  let prefix = match conv {
    b'x' if spec.alt && value != 0 => "0x",
    b'X' if spec.alt && value != 0 => "0X",
    _ => "",
  };
  if conv == b'o' && spec.alt && digits.first() != Some(&b'0') {
    digits.insert(0, b'0');
  }

  Field {
    sign: "",
    prefix,
    digits,
    numeric: spec.precision.is_none(),
  }
}

fn float(
  spec: &Spec,
  conv: u8,
  value: f64,
) -> Field {
  let upper = conv.is_ascii_uppercase();
  let sign = sign_of(spec, value.is_sign_negative() && !value.is_nan());

  if !value.is_finite() {
    let text = match (value.is_nan(), upper) {
      (true, false) => "nan",
      (true, true) => "NAN",
      (false, false) => "inf",
      (false, true) => "INF",
    };
    return Field {
      sign,
      prefix: "",
      digits: text.as_bytes().to_vec(),
      numeric: false,
    };
  }

  let abs = value.abs();
  let precision = spec.precision.unwrap_or(6);

  let text = match conv.to_ascii_lowercase() {
    b'f' => fixed(abs, precision, spec.alt),
    b'e' => exponent(abs, precision, spec.alt),
    _ => general(abs, precision, spec.alt),
  };

  let text = if upper { text.to_ascii_uppercase() } else { text };

  Field {
    sign,
    prefix: "",
    digits: text.into_bytes(),
    numeric: true,
  }
}

fn fixed(
  abs: f64,
  precision: usize,
  alt: bool,
) -> String {
  let exact = precision.min(EXACT_DIGITS);
  let mut text = format!("{abs:.exact$}");
  text.extend(std::iter::repeat_n('0', precision - exact));
  if alt && precision == 0 {
    text.push('.');
  }
  text
}

/// Splits Rust's `1.5e3` into mantissa and exponent.
fn rust_exponent(
  abs: f64,
  precision: usize,
) -> (String, i32) {
  let exact = precision.min(EXACT_DIGITS);
  let text = format!("{abs:.exact$e}");
  let (mut mantissa, exp) = match text.split_once('e') {
    Some((mantissa, exp)) => (mantissa.to_string(), exp.parse().unwrap_or(0)),
    None => (text, 0),
  };
  mantissa.extend(std::iter::repeat_n('0', precision - exact));
  (mantissa, exp)
}

fn exponent(
  abs: f64,
  precision: usize,
  alt: bool,
) -> String {
  let (mut mantissa, exp) = rust_exponent(abs, precision);
  if alt && precision == 0 {
    mantissa.push('.');
  }
  let sign = if exp < 0 { '-' } else { '+' };
  format!("{mantissa}e{sign}{:02}", exp.unsigned_abs())
}

fn general(
  abs: f64,
  precision: usize,
  alt: bool,
) -> String {
  let significant = precision.max(1);
  let (_, exp) = rust_exponent(abs, significant - 1);

  let text = if exp < -4 || exp >= significant as i32 {
    exponent(abs, significant - 1, alt)
  } else {
    fixed(abs, (significant as i32 - 1 - exp) as usize, alt)
  };

  if alt { text } else { strip_zeros(text) }
}

/// Drops trailing fractional zeros (and a bare point) before any exponent.
fn strip_zeros(text: String) -> String {
  let (number, exp) = match text.find('e') {
    Some(at) => text.split_at(at),
    None => (text.as_str(), ""),
  };

  if !number.contains('.') {
    return text;
  }

  let trimmed = number.trim_end_matches('0').trim_end_matches('.');
  format!("{trimmed}{exp}")
}
