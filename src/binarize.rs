//! Sign binarization of pooled vectors.
//!
//! Each component becomes one bit (`> 0.0` → 1, otherwise 0), packed eight
//! per byte with the first component in the most significant bit. The final
//! byte is zero-padded. Bytes are stored as lowercase hex so a 128-dim vector
//! becomes a 32-character string (16 bytes, 32× smaller than `f32`).
//!
//! ```rust
//! use rank_pool::binarize::BitVector;
//!
//! let bits = BitVector::from_floats(&[0.3, -0.1, 0.0, 2.0, -5.0, 0.1, 0.2, -0.2]).unwrap();
//! // 1001_0110
//! assert_eq!(bits.to_hex(), "96");
//! ```

use crate::{Error, Result};

/// A packed sign pattern of a float vector.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BitVector {
    dim: usize,
    bytes: Vec<u8>,
}

/// Bytes needed to hold `dim` bits.
#[inline]
#[must_use]
pub const fn packed_len(dim: usize) -> usize {
    dim.div_ceil(8)
}

impl BitVector {
    /// Threshold each component at zero and pack.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Data`] if any component is NaN or infinite.
    pub fn from_floats(v: &[f32]) -> Result<Self> {
        let mut bytes = vec![0u8; packed_len(v.len())];
        for (i, &x) in v.iter().enumerate() {
            if !x.is_finite() {
                return Err(Error::Data(format!(
                    "component {i} is not finite ({x})"
                )));
            }
            if x > 0.0 {
                bytes[i / 8] |= 0x80 >> (i % 8);
            }
        }
        Ok(Self {
            dim: v.len(),
            bytes,
        })
    }

    /// Decode a hex string produced by [`BitVector::to_hex`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Data`] if the string is not hex or its length does not
    /// match `dim`.
    pub fn from_hex(dim: usize, s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Data(format!("bad hex '{s}': {e}")))?;
        if bytes.len() != packed_len(dim) {
            return Err(Error::Data(format!(
                "hex '{s}' holds {} bytes, {dim} dims need {}",
                bytes.len(),
                packed_len(dim)
            )));
        }
        Ok(Self { dim, bytes })
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }

    /// Bit `i` (component `i > 0.0` in the source vector).
    #[inline]
    #[must_use]
    pub fn bit(&self, i: usize) -> bool {
        i < self.dim && self.bytes[i / 8] & (0x80 >> (i % 8)) != 0
    }

    /// The sign pattern as booleans, one per component.
    #[must_use]
    pub fn sign_pattern(&self) -> Vec<bool> {
        (0..self.dim).map(|i| self.bit(i)).collect()
    }

    /// Unpack to 0.0 / 1.0 floats, the representation the index scores against.
    #[must_use]
    pub fn unpack(&self) -> Vec<f32> {
        (0..self.dim)
            .map(|i| if self.bit(i) { 1.0 } else { 0.0 })
            .collect()
    }
}

/// Binarize every vector, preserving order.
///
/// # Errors
///
/// Returns [`Error::Data`] naming the offending vector on non-finite input.
pub fn binarize_all(vectors: &[Vec<f32>]) -> Result<Vec<String>> {
    vectors
        .iter()
        .enumerate()
        .map(|(i, v)| {
            BitVector::from_floats(v)
                .map(|b| b.to_hex())
                .map_err(|e| Error::Data(format!("vector {i}: {e}")))
        })
        .collect()
}
