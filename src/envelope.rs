//! The wire unit exchanged through one ring slot.
//!
//! An envelope is a fixed header followed immediately by the payload bytes,
//! contiguous in native endianness:
//!
//! ```text
//! [ type tag | elsize | nd | total_size ]  4 x i64
//! [ dims[0] .. dims[nd-1]              ]  nd x i64
//! [ strides[0] .. strides[nd-1]        ]  nd x i64, in elements (not bytes)
//! [ payload                            ]  total_size * elsize bytes
//! ```
//!
//! The receive path copies the payload into a freshly allocated owned buffer;
//! ownership of that buffer transfers to the caller with the envelope.

use crate::error::EnvelopeError;

/// Maximum number of array dimensions an envelope can describe.
pub const MAX_DIMS: usize = 8;

const HEADER_FIELDS: usize = 4;
const WORD: usize = std::mem::size_of::<i64>();

/// Upper bound on the encoded header size, used to derive slot capacity from
/// a payload budget.
pub const fn header_bound() -> usize {
  (HEADER_FIELDS + 2 * MAX_DIMS) * WORD
}

const fn header_len(nd: usize) -> usize {
  (HEADER_FIELDS + 2 * nd) * WORD
}

/// Element type of an envelope's payload.
///
/// The tag travels as an opaque i64; the values for the named variants follow
/// the NumPy type numbers so an array-marshalling adapter can pass its dtype
/// straight through. Unrecognized tags round-trip via [`DType::Raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
  Bool,
  I8,
  U8,
  I16,
  U16,
  I32,
  U32,
  I64,
  U64,
  F32,
  F64,
  /// Any tag the core does not interpret; preserved byte-exact.
  Raw(i64),
}

impl DType {
  /// The i64 wire tag for this element type.
  pub fn code(self) -> i64 {
    match self {
      DType::Bool => 0,
      DType::I8 => 1,
      DType::U8 => 2,
      DType::I16 => 3,
      DType::U16 => 4,
      DType::I32 => 5,
      DType::U32 => 6,
      DType::I64 => 7,
      DType::U64 => 8,
      DType::F32 => 11,
      DType::F64 => 12,
      DType::Raw(code) => code,
    }
  }

  /// Maps a wire tag back to a known element type, or [`DType::Raw`].
  pub fn from_code(code: i64) -> Self {
    match code {
      0 => DType::Bool,
      1 => DType::I8,
      2 => DType::U8,
      3 => DType::I16,
      4 => DType::U16,
      5 => DType::I32,
      6 => DType::U32,
      7 => DType::I64,
      8 => DType::U64,
      11 => DType::F32,
      12 => DType::F64,
      other => DType::Raw(other),
    }
  }
}

/// One fully materialized message: shape/stride metadata plus an owned,
/// contiguous payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
  dtype: DType,
  elsize: usize,
  dims: Vec<i64>,
  strides: Vec<i64>,
  payload: Box<[u8]>,
}

impl Envelope {
  /// Builds an envelope, validating its structural invariants.
  ///
  /// `nd = 0` describes a scalar (`total_size = 1`). Strides are expressed in
  /// elements, not bytes.
  ///
  /// # Errors
  ///
  /// - [`EnvelopeError::TooManyDims`] if `dims.len() > MAX_DIMS`.
  /// - [`EnvelopeError::RankMismatch`] if `dims` and `strides` differ in rank.
  /// - [`EnvelopeError::ZeroElsize`] if `elsize == 0`.
  /// - [`EnvelopeError::PayloadSizeMismatch`] if the payload length is not
  ///   `product(dims) * elsize`.
  pub fn new(
    dtype: DType,
    elsize: usize,
    dims: Vec<i64>,
    strides: Vec<i64>,
    payload: Vec<u8>,
  ) -> Result<Self, EnvelopeError> {
    if dims.len() > MAX_DIMS {
      return Err(EnvelopeError::TooManyDims { nd: dims.len() });
    }
    if dims.len() != strides.len() {
      return Err(EnvelopeError::RankMismatch {
        dims: dims.len(),
        strides: strides.len(),
      });
    }
    if elsize == 0 {
      return Err(EnvelopeError::ZeroElsize);
    }
    let total: i64 = dims.iter().product();
    let expected = total as usize * elsize;
    if expected != payload.len() {
      return Err(EnvelopeError::PayloadSizeMismatch {
        expected,
        actual: payload.len(),
      });
    }
    Ok(Self {
      dtype,
      elsize,
      dims,
      strides,
      payload: payload.into_boxed_slice(),
    })
  }

  pub fn dtype(&self) -> DType {
    self.dtype
  }

  pub fn elsize(&self) -> usize {
    self.elsize
  }

  /// Dimension count.
  pub fn nd(&self) -> usize {
    self.dims.len()
  }

  pub fn dims(&self) -> &[i64] {
    &self.dims
  }

  pub fn strides(&self) -> &[i64] {
    &self.strides
  }

  /// Total element count, `product(dims)` (1 for a scalar).
  pub fn total_size(&self) -> u64 {
    self.dims.iter().product::<i64>() as u64
  }

  pub fn payload(&self) -> &[u8] {
    &self.payload
  }

  /// Consumes the envelope, yielding sole ownership of the payload buffer.
  pub fn into_payload(self) -> Box<[u8]> {
    self.payload
  }

  /// Encoded size of this envelope: header plus payload.
  pub fn wire_size(&self) -> usize {
    header_len(self.dims.len()) + self.payload.len()
  }

  /// Lays the envelope down at the start of `buf` following the wire layout.
  ///
  /// `buf` is one ring slot; the caller has already checked that
  /// [`Self::wire_size`] fits.
  pub(crate) fn write_to(&self, buf: &mut [u8]) {
    let mut off = 0;
    for value in [
      self.dtype.code(),
      self.elsize as i64,
      self.dims.len() as i64,
      self.total_size() as i64,
    ] {
      put_i64(buf, &mut off, value);
    }
    for &dim in &self.dims {
      put_i64(buf, &mut off, dim);
    }
    for &stride in &self.strides {
      put_i64(buf, &mut off, stride);
    }
    buf[off..off + self.payload.len()].copy_from_slice(&self.payload);
  }

  /// Decodes one envelope from the start of `buf`, copying the payload into
  /// a fresh allocation sized exactly from the header.
  ///
  /// The slot was written by the peer's `write_to`, so the header is trusted;
  /// a corrupt header surfaces as a panic, not silent misreads.
  pub(crate) fn read_from(buf: &[u8]) -> Envelope {
    let mut off = 0;
    let code = get_i64(buf, &mut off);
    let elsize = get_i64(buf, &mut off) as usize;
    let nd = get_i64(buf, &mut off) as usize;
    let total_size = get_i64(buf, &mut off) as usize;

    let mut dims = Vec::with_capacity(nd);
    for _ in 0..nd {
      dims.push(get_i64(buf, &mut off));
    }
    let mut strides = Vec::with_capacity(nd);
    for _ in 0..nd {
      strides.push(get_i64(buf, &mut off));
    }

    let payload_len = total_size * elsize;
    let payload = buf[off..off + payload_len].to_vec().into_boxed_slice();

    Envelope {
      dtype: DType::from_code(code),
      elsize,
      dims,
      strides,
      payload,
    }
  }
}

#[inline]
fn put_i64(buf: &mut [u8], off: &mut usize, value: i64) {
  buf[*off..*off + WORD].copy_from_slice(&value.to_ne_bytes());
  *off += WORD;
}

#[inline]
fn get_i64(buf: &[u8], off: &mut usize) -> i64 {
  let mut bytes = [0u8; WORD];
  bytes.copy_from_slice(&buf[*off..*off + WORD]);
  *off += WORD;
  i64::from_ne_bytes(bytes)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn matrix_2x3() -> Envelope {
    let payload: Vec<u8> = (0u8..24).collect();
    Envelope::new(DType::I32, 4, vec![2, 3], vec![3, 1], payload).unwrap()
  }

  #[test]
  fn wire_round_trip() {
    let env = matrix_2x3();
    let mut slot = vec![0u8; 256];
    env.write_to(&mut slot);

    let decoded = Envelope::read_from(&slot);
    assert_eq!(decoded.dtype(), DType::I32);
    assert_eq!(decoded.elsize(), 4);
    assert_eq!(decoded.nd(), 2);
    assert_eq!(decoded.dims(), &[2, 3]);
    assert_eq!(decoded.strides(), &[3, 1]);
    assert_eq!(decoded.total_size(), 6);
    assert_eq!(decoded.payload(), env.payload());
    assert_eq!(decoded, env);
  }

  #[test]
  fn scalar_round_trip() {
    let env = Envelope::new(DType::F64, 8, vec![], vec![], vec![0u8; 8]).unwrap();
    assert_eq!(env.nd(), 0);
    assert_eq!(env.total_size(), 1);

    let mut slot = vec![0u8; 64];
    env.write_to(&mut slot);
    let decoded = Envelope::read_from(&slot);
    assert_eq!(decoded, env);
  }

  #[test]
  fn wire_size_matches_layout() {
    let env = matrix_2x3();
    // 4 header words + 2 dims + 2 strides = 8 words, then 24 payload bytes.
    assert_eq!(env.wire_size(), 8 * 8 + 24);
    assert!(env.wire_size() <= header_bound() + 24);
  }

  #[test]
  fn raw_dtype_round_trips() {
    assert_eq!(DType::from_code(12), DType::F64);
    assert_eq!(DType::from_code(99), DType::Raw(99));
    assert_eq!(DType::Raw(99).code(), 99);
  }

  #[test]
  fn rejects_rank_mismatch() {
    let err = Envelope::new(DType::U8, 1, vec![4], vec![], vec![0u8; 4]).unwrap_err();
    assert_eq!(err, EnvelopeError::RankMismatch { dims: 1, strides: 0 });
  }

  #[test]
  fn rejects_too_many_dims() {
    let dims = vec![1i64; MAX_DIMS + 1];
    let strides = vec![1i64; MAX_DIMS + 1];
    let err = Envelope::new(DType::U8, 1, dims, strides, vec![0u8; 1]).unwrap_err();
    assert_eq!(err, EnvelopeError::TooManyDims { nd: MAX_DIMS + 1 });
  }

  #[test]
  fn rejects_payload_size_mismatch() {
    let err = Envelope::new(DType::I16, 2, vec![3], vec![1], vec![0u8; 5]).unwrap_err();
    assert_eq!(
      err,
      EnvelopeError::PayloadSizeMismatch {
        expected: 6,
        actual: 5
      }
    );
  }

  #[test]
  fn rejects_zero_elsize() {
    let err = Envelope::new(DType::U8, 0, vec![], vec![], vec![]).unwrap_err();
    assert_eq!(err, EnvelopeError::ZeroElsize);
  }

  #[test]
  fn into_payload_transfers_ownership() {
    let env = matrix_2x3();
    let expected: Vec<u8> = (0u8..24).collect();
    assert_eq!(&*env.into_payload(), expected.as_slice());
  }
}
