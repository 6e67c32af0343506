/// Number of `granule`-sized units needed to cover `value`.
///
/// # Examples
///
/// ```rust
/// use wasm_shim::units_of;
///
/// assert_eq!(units_of!(0u64, 256), 0);
/// assert_eq!(units_of!(1u64, 256), 1);
/// assert_eq!(units_of!(300u64, 256), 2);
/// ```
#[macro_export]
macro_rules! units_of {
  ($value:expr, $granule:expr) => {
    ($value + $granule - 1) / $granule
  };
}

/// Rounds `value` up to the next multiple of `granule`.
///
/// # Examples
///
/// ```rust
/// use wasm_shim::align_to;
///
/// assert_eq!(align_to!(1000u64, 256), 1024);
/// assert_eq!(align_to!(65536u64, 65536), 65536);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $granule:expr) => {
    $crate::units_of!($value, $granule) * $granule
  };
}
