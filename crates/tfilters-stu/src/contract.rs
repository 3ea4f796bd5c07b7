//! Filter-space contractions for the exact STU path.
//!
//! The exact convolution leaves a `(B, L, K, d_in)` response; these
//! collapse the filter and input axes into `d_out` with either a dense
//! `(K, d_out, d_in)` tensor or a per-filter low-rank pair
//! `M_i (K, d_out, r)`, `M_j (K, r, d_in)`.

use tfilters_core::{CoreError, Result, Tensor};

fn response_dims(u: &Tensor) -> Result<(usize, usize, usize, usize)> {
    u.shape().expect_rank(4)?;
    let d = u.dims();
    Ok((d[0], d[1], d[2], d[3]))
}

/// `out[b, t, o] = sum_{k, i} U[b, t, k, i] * M[k, o, i]`.
pub fn dense_filter_contraction(u: &Tensor, m: &Tensor) -> Result<Tensor> {
    let (b, l, k, d_in) = response_dims(u)?;
    m.shape().expect_rank(3)?;
    let d_out = m.dims()[1];
    m.shape().expect_dims(&[k, d_out, d_in])?;

    let u = u.to_f32_vec();
    let m = m.to_f32_vec();
    let mut out = vec![0.0f32; b * l * d_out];
    for (row, out_row) in out.chunks_exact_mut(d_out).enumerate() {
        let u_row = &u[row * k * d_in..(row + 1) * k * d_in];
        for ki in 0..k {
            let u_k = &u_row[ki * d_in..(ki + 1) * d_in];
            for (o, acc) in out_row.iter_mut().enumerate() {
                let m_ko = &m[(ki * d_out + o) * d_in..(ki * d_out + o + 1) * d_in];
                *acc += u_k.iter().zip(m_ko).map(|(a, w)| a * w).sum::<f32>();
            }
        }
    }
    Tensor::from_vec(out, &[b, l, d_out])
}

/// Two-stage low-rank contraction. Never materialises `(K, d_out, d_in)`:
///
/// 1. `w[bl, k, r] = sum_i M_j[k, r, i] * U[bl, k, i]`
/// 2. `out[bl, o] = sum_{k, r} M_i[k, o, r] * w[bl, k, r]`
pub fn factorized_filter_contraction(u: &Tensor, m_i: &Tensor, m_j: &Tensor) -> Result<Tensor> {
    let (b, l, k, d_in) = response_dims(u)?;
    m_i.shape().expect_rank(3)?;
    m_j.shape().expect_rank(3)?;
    let (d_out, r) = (m_i.dims()[1], m_i.dims()[2]);
    m_i.shape().expect_dims(&[k, d_out, r])?;
    m_j.shape().expect_dims(&[k, r, d_in])?;

    let u = u.to_f32_vec();
    let m_i = m_i.to_f32_vec();
    let m_j = m_j.to_f32_vec();
    let rows = b * l;

    let mut w = vec![0.0f32; rows * k * r];
    for row in 0..rows {
        for ki in 0..k {
            let u_k = &u[(row * k + ki) * d_in..(row * k + ki + 1) * d_in];
            for ri in 0..r {
                let mj = &m_j[(ki * r + ri) * d_in..(ki * r + ri + 1) * d_in];
                w[(row * k + ki) * r + ri] = u_k.iter().zip(mj).map(|(a, b)| a * b).sum();
            }
        }
    }

    let mut out = vec![0.0f32; rows * d_out];
    for row in 0..rows {
        for ki in 0..k {
            let w_k = &w[(row * k + ki) * r..(row * k + ki + 1) * r];
            for o in 0..d_out {
                let mi = &m_i[(ki * d_out + o) * r..(ki * d_out + o + 1) * r];
                out[row * d_out + o] += w_k.iter().zip(mi).map(|(a, b)| a * b).sum::<f32>();
            }
        }
    }
    Tensor::from_vec(out, &[b, l, d_out])
}

/// Dense `(K, d_out, d_in)` equivalent of a factor pair.
pub fn densify(m_i: &Tensor, m_j: &Tensor) -> Result<Tensor> {
    m_i.shape().expect_rank(3)?;
    m_j.shape().expect_rank(3)?;
    let (k, d_out, r) = (m_i.dims()[0], m_i.dims()[1], m_i.dims()[2]);
    let d_in = m_j.dims()[2];
    if m_j.dims()[..2] != [k, r] {
        return Err(CoreError::ShapeMismatch {
            expected: vec![k, r, d_in],
            got: m_j.dims().to_vec(),
        });
    }

    let a = m_i.to_f32_vec();
    let b = m_j.to_f32_vec();
    let mut out = vec![0.0f32; k * d_out * d_in];
    for ki in 0..k {
        for o in 0..d_out {
            for ri in 0..r {
                let coef = a[(ki * d_out + o) * r + ri];
                let b_row = &b[(ki * r + ri) * d_in..(ki * r + ri + 1) * d_in];
                let out_row = &mut out[(ki * d_out + o) * d_in..(ki * d_out + o + 1) * d_in];
                for (dst, &v) in out_row.iter_mut().zip(b_row) {
                    *dst += coef * v;
                }
            }
        }
    }
    Tensor::from_vec(out, &[k, d_out, d_in])
}
