//! # FEC Codec — Cauchy Erasure Coding
//!
//! Systematic block erasure code over GF(2^8). A block group carries `k` data
//! shards followed by `m` parity shards, all of the same size. Parity shard `i`
//! is the GF(2^8) dot product of Cauchy row `i` with the data shards, computed
//! independently for every byte offset.
//!
//! ## Coding matrix
//!
//! Element `[i][j]` of the `m × k` matrix is `1 / (i ⊕ (m + j))`. Every square
//! submatrix of a Cauchy matrix is invertible, so any `k` surviving shards are
//! enough to rebuild the lost data shards.
//!
//! ## GF(2^8) Arithmetic
//!
//! Field operations use the primitive polynomial x^8 + x^4 + x^3 + x^2 + 1
//! (0x11D) with generator 2, the field the console's encoder uses.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Byte alignment every shard size must honour.
pub const FEC_WORD_SIZE: usize = 8;

/// Largest block group the 8-bit field supports (`k + m`).
pub const FEC_MAX_SHARDS: usize = 256;

// ─── Errors ─────────────────────────────────────────────────────────────────

/// Reasons a block group cannot be encoded or decoded.
///
/// `Unrecoverable` is an expected outcome under heavy loss and is reported
/// upstream as a lossy frame, never as a session fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FecError {
    #[error("unrecoverable block group: {missing} shards missing, {parity} parity shards")]
    Unrecoverable { missing: usize, parity: usize },
    #[error("erasure index {index} outside block group of {total} shards")]
    ErasureOutOfRange { index: usize, total: usize },
    #[error("invalid FEC parameters k={k} m={m}")]
    InvalidParameters { k: usize, m: usize },
    #[error("shard size {shard_size} is not a multiple of 8")]
    UnalignedShardSize { shard_size: usize },
    #[error("shard buffer is {actual} bytes, expected {expected}")]
    BufferLength { expected: usize, actual: usize },
}

// ─── GF(2^8) Arithmetic ────────────────────────────────────────────────────

/// Multiplication and inverse tables for GF(2^8) with polynomial 0x11D.
struct Gf256Tables {
    mul: [[u8; 256]; 256],
    inv: [u8; 256],
}

impl Gf256Tables {
    const fn generate() -> Self {
        let mut mul = [[0u8; 256]; 256];
        let mut inv = [0u8; 256];

        // 2 (= x) is primitive for 0x11D, so doubling walks the whole group.
        let mut exp = [0u8; 256];
        let mut log = [0u8; 256];
        let mut val: u16 = 1;
        let mut i: usize = 0;
        while i < 255 {
            exp[i] = val as u8;
            log[val as usize] = i as u8;
            val <<= 1;
            if val & 0x100 != 0 {
                val ^= 0x11D;
            }
            i += 1;
        }
        exp[255] = exp[0];

        let mut a = 1usize;
        while a < 256 {
            let mut b = 1usize;
            while b < 256 {
                let log_sum = (log[a] as u16 + log[b] as u16) % 255;
                mul[a][b] = exp[log_sum as usize];
                b += 1;
            }
            a += 1;
        }

        inv[1] = 1;
        i = 2;
        while i < 256 {
            let l = log[i] as u16;
            inv[i] = exp[(255 - l) as usize];
            i += 1;
        }

        Gf256Tables { mul, inv }
    }
}

static GF: Gf256Tables = Gf256Tables::generate();

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    GF.mul[a as usize][b as usize]
}

#[inline]
fn gf_inv(a: u8) -> u8 {
    GF.inv[a as usize]
}

/// `dst[n] ^= c · src[n]` over the whole region.
#[inline]
fn gf_mul_add_region(dst: &mut [u8], src: &[u8], c: u8) {
    match c {
        0 => {}
        1 => {
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= *s;
            }
        }
        _ => {
            let row = &GF.mul[c as usize];
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= row[*s as usize];
            }
        }
    }
}

// ─── Cauchy Matrix ──────────────────────────────────────────────────────────

/// The `m × k` Cauchy coding matrix for one `(k, m)` pair, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CauchyMatrix {
    k: usize,
    m: usize,
    elements: Vec<u8>,
}

impl CauchyMatrix {
    pub fn new(k: usize, m: usize) -> Result<Self, FecError> {
        validate_params(k, m)?;
        let mut elements = Vec::with_capacity(k * m);
        for i in 0..m {
            for j in 0..k {
                // i < m <= m + j, so the XOR is never zero.
                elements.push(gf_inv((i ^ (m + j)) as u8));
            }
        }
        Ok(CauchyMatrix { k, m, elements })
    }

    pub fn data_shards(&self) -> usize {
        self.k
    }

    pub fn parity_shards(&self) -> usize {
        self.m
    }

    /// Coefficient of data shard `col` in parity shard `row`.
    #[inline]
    pub fn element(&self, row: usize, col: usize) -> u8 {
        self.elements[row * self.k + col]
    }

    fn row(&self, row: usize) -> &[u8] {
        &self.elements[row * self.k..(row + 1) * self.k]
    }
}

fn validate_params(k: usize, m: usize) -> Result<(), FecError> {
    if k == 0 || m == 0 || k + m > FEC_MAX_SHARDS {
        return Err(FecError::InvalidParameters { k, m });
    }
    Ok(())
}

fn validate_shard_size(shard_size: usize) -> Result<(), FecError> {
    if shard_size == 0 || shard_size % FEC_WORD_SIZE != 0 {
        return Err(FecError::UnalignedShardSize { shard_size });
    }
    Ok(())
}

/// Round `len` up to the shard alignment.
pub fn aligned_shard_size(len: usize) -> usize {
    len.max(1).div_ceil(FEC_WORD_SIZE) * FEC_WORD_SIZE
}

/// Invert a square matrix in place with Gauss-Jordan elimination.
/// Returns `None` when the matrix is singular.
fn invert(matrix: &mut [u8], n: usize) -> Option<Vec<u8>> {
    let mut inverse = vec![0u8; n * n];
    for i in 0..n {
        inverse[i * n + i] = 1;
    }

    for col in 0..n {
        let pivot = (col..n).find(|&r| matrix[r * n + col] != 0)?;
        if pivot != col {
            for c in 0..n {
                matrix.swap(pivot * n + c, col * n + c);
                inverse.swap(pivot * n + c, col * n + c);
            }
        }

        let scale = gf_inv(matrix[col * n + col]);
        if scale != 1 {
            for c in 0..n {
                matrix[col * n + c] = gf_mul(matrix[col * n + c], scale);
                inverse[col * n + c] = gf_mul(inverse[col * n + c], scale);
            }
        }

        for r in 0..n {
            if r == col {
                continue;
            }
            let factor = matrix[r * n + col];
            if factor == 0 {
                continue;
            }
            for c in 0..n {
                matrix[r * n + c] ^= gf_mul(factor, matrix[col * n + c]);
                inverse[r * n + c] ^= gf_mul(factor, inverse[col * n + c]);
            }
        }
    }

    Some(inverse)
}

// ─── FEC Encoder ─────────────────────────────────────────────────────────

/// Computes parity shards for a block group. Used by test peers and benches
/// to produce what the console sends.
#[derive(Debug, Default)]
pub struct FecEncoder {
    matrices: HashMap<(usize, usize), CauchyMatrix>,
}

impl FecEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `k` contiguous data shards of `shard_size` bytes into `m`
    /// contiguous parity shards.
    pub fn encode(
        &mut self,
        k: usize,
        m: usize,
        shard_size: usize,
        data: &[u8],
    ) -> Result<Bytes, FecError> {
        validate_shard_size(shard_size)?;
        let matrix = cached_matrix(&mut self.matrices, k, m)?;
        if data.len() != k * shard_size {
            return Err(FecError::BufferLength {
                expected: k * shard_size,
                actual: data.len(),
            });
        }

        let mut parity = BytesMut::zeroed(m * shard_size);
        for (i, out) in parity.chunks_exact_mut(shard_size).enumerate() {
            for (j, shard) in data.chunks_exact(shard_size).enumerate() {
                gf_mul_add_region(out, shard, matrix.element(i, j));
            }
        }
        Ok(parity.freeze())
    }
}

// ─── FEC Decoder ─────────────────────────────────────────────────────────

/// Rebuilds erased data shards of a block group.
///
/// Holds a cache of Cauchy matrices keyed by `(k, m)`. The decoder is owned
/// by a single worker, so one block group's solve never interleaves with
/// another's.
#[derive(Debug, Default)]
pub struct FecDecoder {
    matrices: HashMap<(usize, usize), CauchyMatrix>,
}

impl FecDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached coding matrices.
    pub fn cached_matrices(&self) -> usize {
        self.matrices.len()
    }

    /// Decode one block group.
    ///
    /// - `shards`: all `k + m` shards laid out contiguously, `shard_size` bytes
    ///   each. The content of erased slots is ignored.
    /// - `erasures`: indices of missing shards, in `[0, k + m)`.
    ///
    /// Returns the `k` data shards concatenated in index order.
    pub fn decode(
        &mut self,
        k: usize,
        m: usize,
        shard_size: usize,
        shards: &[u8],
        erasures: &[usize],
    ) -> Result<Bytes, FecError> {
        validate_shard_size(shard_size)?;
        validate_params(k, m)?;
        let total = k + m;
        if shards.len() != total * shard_size {
            return Err(FecError::BufferLength {
                expected: total * shard_size,
                actual: shards.len(),
            });
        }

        let mut erased = vec![false; total];
        for &index in erasures {
            if index >= total {
                return Err(FecError::ErasureOutOfRange { index, total });
            }
            erased[index] = true;
        }
        let missing = erased.iter().filter(|&&e| e).count();

        let data_len = k * shard_size;
        if !erased[..k].iter().any(|&e| e) {
            return Ok(Bytes::copy_from_slice(&shards[..data_len]));
        }
        if missing > m {
            return Err(FecError::Unrecoverable { missing, parity: m });
        }

        let matrix = cached_matrix(&mut self.matrices, k, m)?;
        let survivors: Vec<usize> = (0..total).filter(|&i| !erased[i]).take(k).collect();

        // Row r expresses surviving shard survivors[r] in terms of the data.
        let mut system = vec![0u8; k * k];
        for (r, &index) in survivors.iter().enumerate() {
            let row = &mut system[r * k..(r + 1) * k];
            if index < k {
                row[index] = 1;
            } else {
                row.copy_from_slice(matrix.row(index - k));
            }
        }
        let inverse = invert(&mut system, k).ok_or(FecError::Unrecoverable { missing, parity: m })?;

        let mut out = BytesMut::from(&shards[..data_len]);
        for lost in (0..k).filter(|&i| erased[i]) {
            let target = &mut out[lost * shard_size..(lost + 1) * shard_size];
            target.fill(0);
            for (r, &index) in survivors.iter().enumerate() {
                let src = &shards[index * shard_size..(index + 1) * shard_size];
                gf_mul_add_region(target, src, inverse[lost * k + r]);
            }
            trace!(k, m, shard = lost, "rebuilt data shard");
        }

        Ok(out.freeze())
    }
}

fn cached_matrix(
    cache: &mut HashMap<(usize, usize), CauchyMatrix>,
    k: usize,
    m: usize,
) -> Result<&CauchyMatrix, FecError> {
    validate_params(k, m)?;
    if !cache.contains_key(&(k, m)) {
        debug!(k, m, "building cauchy matrix");
        cache.insert((k, m), CauchyMatrix::new(k, m)?);
    }
    cache
        .get(&(k, m))
        .ok_or(FecError::InvalidParameters { k, m })
}
