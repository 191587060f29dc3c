//! Tensor views over raw model bytes, plus the float kernels the forward
//! pass is built from.
//!
//! A [`Tensor`] is a logical sequence of f32 values. The backing storage is
//! either a plain float buffer (owned, writable) or a block-quantized byte
//! region borrowed from the memory-mapped model file (read-only). Quantized
//! values are dequantized on access; the `dot` kernels walk whole blocks so
//! the per-element decode cost disappears from the hot loop.

use crate::gguf::{GgmlType, TensorEntry};
use anyhow::Result;
use half::f16;
use rayon::prelude::*;
use std::borrow::Cow;

/// Elements per quantization block, shared by Q8_0 and Q4_0.
pub const BLOCK_SIZE: usize = 32;

/// f16 scale + 32 signed byte quants.
const Q8_0_BLOCK_BYTES: usize = 2 + 32;
/// f16 scale + 16 bytes of packed nibbles.
const Q4_0_BLOCK_BYTES: usize = 2 + 16;

/// Block-quantized storage: contiguous blocks of `BLOCK_SIZE` elements.
#[derive(Debug, Clone)]
pub struct QuantBlocks {
    data: Cow<'static, [u8]>,
    len: usize,
}

#[derive(Debug, Clone)]
pub enum Tensor {
    F32(Cow<'static, [f32]>),
    Q8_0(QuantBlocks),
    Q4_0(QuantBlocks),
}

impl Tensor {
    /// Wraps a parsed GGUF tensor entry. Only the three supported encodings
    /// can back a view; anything else is a format error.
    pub fn from_entry(name: &str, entry: &TensorEntry) -> Result<Self> {
        let elements = entry.elements();
        match entry.ggml_type {
            GgmlType::F32 => Ok(Self::F32(Cow::Borrowed(f32_view(entry.bytes, elements)?))),
            GgmlType::Q8_0 => {
                Ok(Self::Q8_0(QuantBlocks { data: Cow::Borrowed(entry.bytes), len: elements }))
            }
            GgmlType::Q4_0 => {
                Ok(Self::Q4_0(QuantBlocks { data: Cow::Borrowed(entry.bytes), len: elements }))
            }
            other => anyhow::bail!(
                "Tensor '{name}' uses unsupported encoding {other:?} (expected F32, Q8_0 or Q4_0)"
            ),
        }
    }

    pub fn from_f32(values: Vec<f32>) -> Self {
        Self::F32(Cow::Owned(values))
    }

    pub fn q8_0_from_bytes(data: Vec<u8>, elements: usize) -> Self {
        debug_assert_eq!(data.len(), elements / BLOCK_SIZE * Q8_0_BLOCK_BYTES);
        Self::Q8_0(QuantBlocks { data: Cow::Owned(data), len: elements })
    }

    pub fn q4_0_from_bytes(data: Vec<u8>, elements: usize) -> Self {
        debug_assert_eq!(data.len(), elements / BLOCK_SIZE * Q4_0_BLOCK_BYTES);
        Self::Q4_0(QuantBlocks { data: Cow::Owned(data), len: elements })
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F32(values) => values.len(),
            Self::Q8_0(blocks) | Self::Q4_0(blocks) => blocks.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ggml_type(&self) -> GgmlType {
        match self {
            Self::F32(_) => GgmlType::F32,
            Self::Q8_0(_) => GgmlType::Q8_0,
            Self::Q4_0(_) => GgmlType::Q4_0,
        }
    }

    pub fn get(&self, index: usize) -> f32 {
        debug_assert!(index < self.len());
        match self {
            Self::F32(values) => values[index],
            Self::Q8_0(blocks) => q8_0_get(&blocks.data, index),
            Self::Q4_0(blocks) => q4_0_get(&blocks.data, index),
        }
    }

    /// Writes are only defined for float storage; a write to a quantized
    /// view is an internal invariant violation.
    pub fn set(&mut self, index: usize, value: f32) {
        match self {
            Self::F32(values) => values.to_mut()[index] = value,
            _ => panic!("set() on a read-only quantized tensor"),
        }
    }

    /// Sum of products of `n` elements starting at `offset` here and
    /// `x_offset` in `x`. Offsets need not be block-aligned.
    pub fn dot(&self, offset: usize, x: &[f32], x_offset: usize, n: usize) -> f32 {
        match self {
            Self::F32(values) => values[offset..offset + n]
                .iter()
                .zip(&x[x_offset..x_offset + n])
                .map(|(&a, &b)| a * b)
                .sum(),
            Self::Q8_0(blocks) => dot_q8_0(blocks, offset, x, x_offset, n),
            Self::Q4_0(blocks) => dot_q4_0(blocks, offset, x, x_offset, n),
        }
    }

    /// Copies `dst.len()` elements starting at `offset` into `dst`,
    /// dequantizing as needed.
    pub fn copy_to(&self, offset: usize, dst: &mut [f32]) {
        match self {
            Self::F32(values) => dst.copy_from_slice(&values[offset..offset + dst.len()]),
            _ => {
                for (i, slot) in dst.iter_mut().enumerate() {
                    *slot = self.get(offset + i);
                }
            }
        }
    }

    pub fn to_vec(&self) -> Vec<f32> {
        match self {
            Self::F32(values) => values.to_vec(),
            _ => (0..self.len()).map(|i| self.get(i)).collect(),
        }
    }
}

/// Reinterprets little-endian tensor bytes as an f32 slice without copying.
fn f32_view(bytes: &'static [u8], elements: usize) -> Result<&'static [f32]> {
    if bytes.len() != elements * std::mem::size_of::<f32>() {
        anyhow::bail!(
            "F32 tensor byte length {} does not match {elements} elements",
            bytes.len()
        );
    }
    if bytes.as_ptr() as usize % std::mem::align_of::<f32>() != 0 {
        anyhow::bail!("F32 tensor data is not 4-byte aligned");
    }
    // SAFETY: length and alignment verified above; the mapping outlives the
    // view (the model owns the GGUF file).
    Ok(unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, elements) })
}

#[inline]
fn block_scale(data: &[u8], block_offset: usize) -> f32 {
    f16::from_le_bytes([data[block_offset], data[block_offset + 1]]).to_f32()
}

#[inline]
fn q8_0_get(data: &[u8], index: usize) -> f32 {
    let block_offset = index / BLOCK_SIZE * Q8_0_BLOCK_BYTES;
    let quant = data[block_offset + 2 + index % BLOCK_SIZE] as i8;
    quant as f32 * block_scale(data, block_offset)
}

#[inline]
fn q4_0_get(data: &[u8], index: usize) -> f32 {
    let block_offset = index / BLOCK_SIZE * Q4_0_BLOCK_BYTES;
    let within = index % BLOCK_SIZE;
    // Low nibbles hold elements 0..16 of the block, high nibbles 16..32.
    let byte = data[block_offset + 2 + within % (BLOCK_SIZE / 2)];
    let nibble = if within < BLOCK_SIZE / 2 { byte & 0x0F } else { byte >> 4 };
    (nibble as i32 - 8) as f32 * block_scale(data, block_offset)
}

fn dot_q8_0(w: &QuantBlocks, offset: usize, x: &[f32], x_offset: usize, n: usize) -> f32 {
    let data = w.data.as_ref();
    let mut acc = 0.0f32;
    let mut j = 0usize;

    // Scalar head until the weight index reaches a block boundary.
    let head = n.min(offset.wrapping_neg() & (BLOCK_SIZE - 1));
    for i in 0..head {
        acc += q8_0_get(data, offset + i) * x[x_offset + i];
    }
    j += head;

    let mut block_offset = (offset + j) / BLOCK_SIZE * Q8_0_BLOCK_BYTES;
    for _ in 0..(n - j) / BLOCK_SIZE {
        let scale = block_scale(data, block_offset);
        let quants = &data[block_offset + 2..block_offset + 2 + BLOCK_SIZE];
        let xs = &x[x_offset + j..x_offset + j + BLOCK_SIZE];
        let (mut s0, mut s1, mut s2, mut s3) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
        for i in 0..8 {
            s0 += xs[i] * (quants[i] as i8) as f32;
            s1 += xs[i + 8] * (quants[i + 8] as i8) as f32;
            s2 += xs[i + 16] * (quants[i + 16] as i8) as f32;
            s3 += xs[i + 24] * (quants[i + 24] as i8) as f32;
        }
        acc = (s0 + s1 + s2 + s3).mul_add(scale, acc);
        j += BLOCK_SIZE;
        block_offset += Q8_0_BLOCK_BYTES;
    }

    for i in j..n {
        acc += q8_0_get(data, offset + i) * x[x_offset + i];
    }
    acc
}

fn dot_q4_0(w: &QuantBlocks, offset: usize, x: &[f32], x_offset: usize, n: usize) -> f32 {
    let data = w.data.as_ref();
    let mut acc = 0.0f32;
    let mut j = 0usize;

    let head = n.min(offset.wrapping_neg() & (BLOCK_SIZE - 1));
    for i in 0..head {
        acc += q4_0_get(data, offset + i) * x[x_offset + i];
    }
    j += head;

    let mut block_offset = (offset + j) / BLOCK_SIZE * Q4_0_BLOCK_BYTES;
    for _ in 0..(n - j) / BLOCK_SIZE {
        let scale = block_scale(data, block_offset);
        let packed = &data[block_offset + 2..block_offset + 2 + BLOCK_SIZE / 2];
        let xs = &x[x_offset + j..x_offset + j + BLOCK_SIZE];
        let (mut s0, mut s1, mut s2, mut s3) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
        for i in 0..8 {
            s0 += xs[i] * ((packed[i] & 0x0F) as i32 - 8) as f32;
            s1 += xs[i + 8] * ((packed[i + 8] & 0x0F) as i32 - 8) as f32;
            s2 += xs[i + 16] * ((packed[i] >> 4) as i32 - 8) as f32;
            s3 += xs[i + 24] * ((packed[i + 8] >> 4) as i32 - 8) as f32;
        }
        acc = (s0 + s1 + s2 + s3).mul_add(scale, acc);
        j += BLOCK_SIZE;
        block_offset += Q4_0_BLOCK_BYTES;
    }

    for i in j..n {
        acc += q4_0_get(data, offset + i) * x[x_offset + i];
    }
    acc
}

/// Row-parallel matrix-vector product: `out[row] = w[row, ..] · x` for each
/// of the `rows` rows of length `cols`. Joins before returning.
pub fn matmul(out: &mut [f32], w: &Tensor, x: &[f32], rows: usize, cols: usize) {
    debug_assert!(out.len() >= rows, "output too small: {} < {rows}", out.len());
    debug_assert!(w.len() >= rows * cols);
    out.par_iter_mut()
        .take(rows)
        .enumerate()
        .for_each(|(row, out_val)| {
            *out_val = w.dot(row * cols, x, 0, cols);
        });
}

/// Serial reference for the row-parallel product.
pub fn matmul_serial(out: &mut [f32], w: &Tensor, x: &[f32], rows: usize, cols: usize) {
    for (row, out_val) in out.iter_mut().take(rows).enumerate() {
        *out_val = w.dot(row * cols, x, 0, cols);
    }
}

/// In-place softmax: subtract the max, exponentiate, normalize.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|val| *val *= inv_sum);
}

/// Root-mean-square normalization with a learned scale and no bias.
pub fn rmsnorm(out: &mut [f32], x: &[f32], weight: &[f32], eps: f32) {
    debug_assert_eq!(out.len(), x.len());
    debug_assert_eq!(x.len(), weight.len());
    let mean_square = x.iter().map(|&v| v * v).sum::<f32>() / x.len() as f32;
    let scale = (mean_square + eps).sqrt().recip();
    out.iter_mut()
        .zip(x.iter())
        .zip(weight.iter())
        .for_each(|((out_val, &v), &w)| *out_val = w * (scale * v));
}

pub fn rmsnorm_in_place(x: &mut [f32], weight: &[f32], eps: f32) {
    debug_assert_eq!(x.len(), weight.len());
    let mean_square = x.iter().map(|&v| v * v).sum::<f32>() / x.len() as f32;
    let scale = (mean_square + eps).sqrt().recip();
    x.iter_mut()
        .zip(weight.iter())
        .for_each(|(val, &w)| *val = w * (scale * *val));
}

pub fn add_in_place(x: &mut [f32], y: &[f32]) {
    debug_assert_eq!(x.len(), y.len());
    x.iter_mut().zip(y.iter()).for_each(|(a, &b)| *a += b);
}

pub fn mul_in_place(x: &mut [f32], y: &[f32]) {
    debug_assert_eq!(x.len(), y.len());
    x.iter_mut().zip(y.iter()).for_each(|(a, &b)| *a *= b);
}

pub fn div_in_place(x: &mut [f32], divisor: f32) {
    x.iter_mut().for_each(|a| *a /= divisor);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Straight-line dequantizers the block kernels are checked against.
    fn reference_q8_0(data: &[u8], elements: usize) -> Vec<f32> {
        (0..elements)
            .map(|i| {
                let bo = i / 32 * Q8_0_BLOCK_BYTES;
                let scale = f16::from_le_bytes([data[bo], data[bo + 1]]).to_f32();
                (data[bo + 2 + i % 32] as i8) as f32 * scale
            })
            .collect()
    }

    fn reference_q4_0(data: &[u8], elements: usize) -> Vec<f32> {
        (0..elements)
            .map(|i| {
                let bo = i / 32 * Q4_0_BLOCK_BYTES;
                let scale = f16::from_le_bytes([data[bo], data[bo + 1]]).to_f32();
                let within = i % 32;
                let byte = data[bo + 2 + within % 16];
                let nibble = if within < 16 { byte & 0x0F } else { byte >> 4 };
                (nibble as i32 - 8) as f32 * scale
            })
            .collect()
    }

    fn build_q8_0(blocks: usize, seed: u8) -> Vec<u8> {
        let mut data = Vec::new();
        for b in 0..blocks {
            let scale = f16::from_f32(0.5 + b as f32 * 0.25);
            data.extend_from_slice(&scale.to_le_bytes());
            for i in 0..32u8 {
                data.push(seed.wrapping_mul(31).wrapping_add(i.wrapping_mul(7)).wrapping_add(b as u8));
            }
        }
        data
    }

    fn build_q4_0(blocks: usize, seed: u8) -> Vec<u8> {
        let mut data = Vec::new();
        for b in 0..blocks {
            let scale = f16::from_f32(0.125 * (b + 1) as f32);
            data.extend_from_slice(&scale.to_le_bytes());
            for i in 0..16u8 {
                data.push(seed.wrapping_add(i.wrapping_mul(13)).wrapping_add(b as u8));
            }
        }
        data
    }

    #[test]
    fn q8_0_get_matches_reference() {
        let data = build_q8_0(3, 42);
        let tensor = Tensor::q8_0_from_bytes(data.clone(), 96);
        let reference = reference_q8_0(&data, 96);
        for (i, &expected) in reference.iter().enumerate() {
            assert_eq!(tensor.get(i), expected, "element {i}");
        }
    }

    #[test]
    fn q4_0_get_matches_reference() {
        let data = build_q4_0(3, 9);
        let tensor = Tensor::q4_0_from_bytes(data.clone(), 96);
        let reference = reference_q4_0(&data, 96);
        for (i, &expected) in reference.iter().enumerate() {
            assert_eq!(tensor.get(i), expected, "element {i}");
        }
    }

    #[test]
    fn f32_set_then_get_is_bit_identical() {
        let mut tensor = Tensor::from_f32(vec![0.0; 8]);
        let values = [1.5f32, -0.0, f32::MIN_POSITIVE, 3.141_592_7, -7.25, 1e-30, 42.0, -1.0];
        for (i, &v) in values.iter().enumerate() {
            tensor.set(i, v);
        }
        for (i, &v) in values.iter().enumerate() {
            assert_eq!(tensor.get(i).to_bits(), v.to_bits());
        }
    }

    fn x_ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 * 0.37).sin()).collect()
    }

    #[test]
    fn q8_0_dot_matches_scalar() {
        let data = build_q8_0(4, 17);
        let tensor = Tensor::q8_0_from_bytes(data, 128);
        let x = x_ramp(128);
        // Full run, block-aligned offset, and a ragged head and tail.
        for (offset, n) in [(0usize, 128usize), (32, 64), (5, 96), (37, 70)] {
            let expected: f32 = (0..n).map(|i| tensor.get(offset + i) * x[i]).sum();
            let got = tensor.dot(offset, &x, 0, n);
            assert!((got - expected).abs() < 1e-3, "offset {offset} n {n}: {got} vs {expected}");
        }
    }

    #[test]
    fn q4_0_dot_matches_scalar() {
        let data = build_q4_0(4, 3);
        let tensor = Tensor::q4_0_from_bytes(data, 128);
        let x = x_ramp(128);
        for (offset, n) in [(0usize, 128usize), (32, 64), (11, 90), (64, 33)] {
            let expected: f32 = (0..n).map(|i| tensor.get(offset + i) * x[i]).sum();
            let got = tensor.dot(offset, &x, 0, n);
            assert!((got - expected).abs() < 1e-3, "offset {offset} n {n}: {got} vs {expected}");
        }
    }

    #[test]
    fn parallel_matmul_matches_serial() {
        let rows = 13;
        let cols = 64;
        let weight =
            Tensor::from_f32((0..rows * cols).map(|i| ((i * 31 % 97) as f32 - 48.0) / 50.0).collect());
        let x = x_ramp(cols);
        let mut parallel = vec![0.0; rows];
        let mut serial = vec![0.0; rows];
        matmul(&mut parallel, &weight, &x, rows, cols);
        matmul_serial(&mut serial, &weight, &x, rows, cols);
        for (p, s) in parallel.iter().zip(serial.iter()) {
            assert!((p - s).abs() < 1e-4);
        }
    }

    #[test]
    fn softmax_matches_known_values() {
        let mut x = [1.0f32, 2.0, 3.0, 4.0];
        softmax(&mut x);
        let expected = [0.0321, 0.0871, 0.2369, 0.6439];
        for (got, want) in x.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-4, "{got} vs {want}");
        }
        assert!((x.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn softmax_is_shift_invariant() {
        let mut a = [0.5f32, -1.0, 2.5, 0.0, 1.25];
        let mut b = a.map(|v| v + 10.0);
        softmax(&mut a);
        softmax(&mut b);
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn elementwise_helpers() {
        let mut x = [1.0f32, 2.0, 3.0];
        add_in_place(&mut x, &[0.5, -1.0, 2.0]);
        assert_eq!(x, [1.5, 1.0, 5.0]);
        mul_in_place(&mut x, &[2.0, 0.0, -1.0]);
        assert_eq!(x, [3.0, 0.0, -5.0]);
        div_in_place(&mut x, 2.0);
        assert_eq!(x, [1.5, 0.0, -2.5]);
    }

    #[test]
    fn rmsnorm_with_unit_weight_normalizes_mean_square() {
        let x: Vec<f32> = (0..64).map(|i| (i as f32 * 0.11).cos() * 3.0).collect();
        let weight = vec![1.0f32; 64];
        let mut out = vec![0.0; 64];
        let eps = 1e-5;
        rmsnorm(&mut out, &x, &weight, eps);
        let mean_square = out.iter().map(|&v| v * v).sum::<f32>() / 64.0;
        assert!(mean_square <= 1.0 + eps);
        assert!(mean_square > 0.99);
    }
}
