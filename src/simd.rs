//! Vector kernels used by pooling and MaxSim scoring.
//!
//! `squared_l2` is the inner loop of Ward pooling (O(n²) calls per page) and
//! dispatches at runtime:
//! - AVX2+FMA on `x86_64`
//! - NEON on `aarch64`
//! - portable fallback otherwise
//!
//! The bit kernels score a float query against packed sign bits without
//! unpacking them into a temporary vector. Bit `i` of a packed vector is the
//! MSB-first bit `7 - i % 8` of byte `i / 8`, matching [`crate::binarize`].

/// Dot product of two vectors.
///
/// If vectors have different lengths, uses the shorter length.
/// Returns 0.0 for empty vectors.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Squared Euclidean distance. Uses the shorter length on mismatch.
#[inline]
#[must_use]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            // SAFETY: AVX2 and FMA verified at runtime; the kernel clamps to the shorter length.
            return unsafe { squared_l2_avx2(a, b) };
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: NEON is always available on aarch64; the kernel clamps to the shorter length.
        return unsafe { squared_l2_neon(a, b) };
    }
    #[allow(unreachable_code)]
    squared_l2_portable(a, b)
}

/// `MaxSim`: sum over query tokens of max dot product with any doc token.
///
/// Returns 0.0 if either side is empty.
#[inline]
#[must_use]
pub fn maxsim(query_tokens: &[&[f32]], doc_tokens: &[&[f32]]) -> f32 {
    if query_tokens.is_empty() || doc_tokens.is_empty() {
        return 0.0;
    }
    query_tokens
        .iter()
        .map(|q| {
            doc_tokens
                .iter()
                .map(|d| dot(q, d))
                .fold(f32::NEG_INFINITY, f32::max)
        })
        .sum()
}

/// `MaxSim` for owned token vectors.
#[inline]
#[must_use]
pub fn maxsim_vecs(query_tokens: &[Vec<f32>], doc_tokens: &[Vec<f32>]) -> f32 {
    let q = crate::as_slices(query_tokens);
    let d = crate::as_slices(doc_tokens);
    maxsim(&q, &d)
}

// ─────────────────────────────────────────────────────────────────────────────
// Packed sign bits
// ─────────────────────────────────────────────────────────────────────────────

/// Dot product of a float vector with packed 0/1 bits.
///
/// Equivalent to `dot(query, unpack(bits))`: sums the query components whose
/// bit is set. Components past either end are ignored.
#[inline]
#[must_use]
pub fn dot_bits(query: &[f32], bits: &[u8]) -> f32 {
    let mut sum = 0.0;
    for (byte_idx, &byte) in bits.iter().enumerate() {
        if byte == 0 {
            continue;
        }
        let base = byte_idx * 8;
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                match query.get(base + bit) {
                    Some(&q) => sum += q,
                    None => return sum,
                }
            }
        }
    }
    sum
}

/// `MaxSim` of float query tokens against packed bit vectors.
///
/// This is the late-interaction relevance the index computes:
/// `Σ_q max_p dot(q, unpack_bits(doc[p]))`. Returns 0.0 if either side is empty.
#[inline]
#[must_use]
pub fn maxsim_bits(query_tokens: &[&[f32]], doc_bits: &[&[u8]]) -> f32 {
    if query_tokens.is_empty() || doc_bits.is_empty() {
        return 0.0;
    }
    query_tokens
        .iter()
        .map(|q| {
            doc_bits
                .iter()
                .map(|d| dot_bits(q, d))
                .fold(f32::NEG_INFINITY, f32::max)
        })
        .sum()
}

// ─────────────────────────────────────────────────────────────────────────────
// Portable fallback
// ─────────────────────────────────────────────────────────────────────────────

/// Reference for the SIMD distance kernels.
#[inline]
#[must_use]
pub(crate) fn squared_l2_portable(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

// ─────────────────────────────────────────────────────────────────────────────
// AVX2 + FMA (x86_64)
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn squared_l2_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::{
        __m256, _mm256_castps256_ps128, _mm256_extractf128_ps, _mm256_fmadd_ps, _mm256_loadu_ps,
        _mm256_setzero_ps, _mm256_sub_ps, _mm_add_ps, _mm_add_ss, _mm_cvtss_f32, _mm_movehl_ps,
        _mm_shuffle_ps,
    };

    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }

    let lanes = n / 8;
    let mut acc: __m256 = _mm256_setzero_ps();

    // SAFETY: lanes * 8 <= n <= min(a.len(), b.len()).
    for i in 0..lanes {
        let offset = i * 8;
        let d = _mm256_sub_ps(
            _mm256_loadu_ps(a.as_ptr().add(offset)),
            _mm256_loadu_ps(b.as_ptr().add(offset)),
        );
        acc = _mm256_fmadd_ps(d, d, acc);
    }

    let half = _mm_add_ps(_mm256_castps256_ps128(acc), _mm256_extractf128_ps(acc, 1));
    let quarter = _mm_add_ps(half, _mm_movehl_ps(half, half));
    let total = _mm_cvtss_f32(_mm_add_ss(quarter, _mm_shuffle_ps(quarter, quarter, 1)));

    total + squared_l2_portable(&a[lanes * 8..n], &b[lanes * 8..n])
}

// ─────────────────────────────────────────────────────────────────────────────
// NEON (aarch64)
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(target_arch = "aarch64")]
#[target_feature(enable = "neon")]
unsafe fn squared_l2_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::{float32x4_t, vaddvq_f32, vdupq_n_f32, vfmaq_f32, vld1q_f32, vsubq_f32};

    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }

    let lanes = n / 4;
    let mut acc: float32x4_t = vdupq_n_f32(0.0);

    // SAFETY: lanes * 4 <= n <= min(a.len(), b.len()).
    for i in 0..lanes {
        let offset = i * 4;
        let d = vsubq_f32(vld1q_f32(a.as_ptr().add(offset)), vld1q_f32(b.as_ptr().add(offset)));
        acc = vfmaq_f32(acc, d, d);
    }

    vaddvq_f32(acc) + squared_l2_portable(&a[lanes * 4..n], &b[lanes * 4..n])
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_basic() {
        assert!((dot(&[1.0, 2.0], &[3.0, 4.0]) - 11.0).abs() < 1e-5);
    }

    #[test]
    fn test_dot_empty() {
        assert_eq!(dot(&[], &[]), 0.0);
        assert_eq!(dot(&[1.0], &[]), 0.0);
    }

    #[test]
    fn test_squared_l2_simd_vs_portable() {
        for len in [0, 1, 3, 4, 5, 7, 8, 9, 15, 16, 17, 31, 32, 33, 128, 1024] {
            let a: Vec<f32> = (0..len).map(|i| (i as f32) * 0.1).collect();
            let b: Vec<f32> = (0..len).map(|i| (i as f32) * 0.2 + 1.0).collect();

            let portable = squared_l2_portable(&a, &b);
            let simd = squared_l2(&a, &b);

            let tolerance = (portable.abs() * 1e-5).max(1e-5);
            assert!(
                (portable - simd).abs() < tolerance,
                "Mismatch at len={}: portable={}, simd={}",
                len,
                portable,
                simd
            );
        }
    }

    #[test]
    fn test_squared_l2() {
        assert!((squared_l2(&[0.0, 0.0], &[3.0, 4.0]) - 25.0).abs() < 1e-6);
        assert_eq!(squared_l2(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn test_maxsim_sum_of_maxes() {
        let q1 = [1.0, 0.0];
        let q2 = [0.0, 1.0];
        let d1 = [0.5, 0.0];
        let d2 = [0.0, 0.8];

        let query: Vec<&[f32]> = vec![&q1, &q2];
        let doc: Vec<&[f32]> = vec![&d1, &d2];

        assert!((maxsim(&query, &doc) - 1.3).abs() < 1e-5);
    }

    #[test]
    fn test_maxsim_empty() {
        let q1 = [1.0, 0.0];
        let query: Vec<&[f32]> = vec![&q1];
        assert_eq!(maxsim(&query, &[]), 0.0);
        assert_eq!(maxsim(&[], &query), 0.0);
    }

    #[test]
    fn test_dot_bits_msb_first() {
        // 0b1010_0000: components 0 and 2 set
        let q = [1.0, 10.0, 100.0, 1000.0];
        assert!((dot_bits(&q, &[0xa0]) - 101.0).abs() < 1e-5);
        assert!((dot_bits(&q, &[0x50]) - 1010.0).abs() < 1e-5);
        assert_eq!(dot_bits(&q, &[0x00]), 0.0);
    }

    #[test]
    fn test_dot_bits_ignores_padding() {
        // bits past the query length are padding
        let q = [2.0, 3.0];
        assert!((dot_bits(&q, &[0xff]) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_dot_bits_multi_byte() {
        let q: Vec<f32> = (0..16).map(|i| i as f32).collect();
        // byte 0: bit 7 (component 7); byte 1: bit 0 (component 8)
        assert!((dot_bits(&q, &[0x01, 0x80]) - 15.0).abs() < 1e-5);
    }

    #[test]
    fn test_maxsim_bits_picks_best_patch() {
        let q = [0.5, -0.25, 0.75, -1.0];
        let query: Vec<&[f32]> = vec![&q];
        let exact: &[u8] = &[0xa0]; // sign pattern of q
        let other: &[u8] = &[0x50];
        let doc: Vec<&[u8]> = vec![other, exact];

        assert!((maxsim_bits(&query, &doc) - 1.25).abs() < 1e-6);
        assert_eq!(maxsim_bits(&query, &[]), 0.0);
    }
}
