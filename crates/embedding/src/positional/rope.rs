//! Rotary positional embeddings (half-split layout).
//!
//! The head dimension is split into two halves `x1 | x2` and rotated with
//! `x1 * cos - x2 * sin | x1 * sin + x2 * cos`. Angles for position `p` and
//! pair `i` are `p * theta^(-2i / head_dim)`. Tables are kept in f32 and grown
//! on demand when a longer sequence is seen.

use std::sync::Mutex;

use candle_core::{bail, DType, Device, Error, Result, Tensor, D};

#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    pub head_dim: usize,
    /// Base of the frequency spectrum.
    pub theta: f32,
}

impl RopeConfig {
    pub fn new(head_dim: usize) -> Self {
        Self {
            head_dim,
            theta: 10_000.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.head_dim < 2 || self.head_dim % 2 != 0 {
            bail!("rotary head_dim must be even and >= 2, got {}", self.head_dim);
        }
        if !(self.theta.is_finite() && self.theta > 0.0) {
            bail!("rotary theta must be positive, got {}", self.theta);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SinCos {
    len: usize,
    sin: Tensor,
    cos: Tensor,
}

/// Precomputed `(positions, head_dim / 2)` sin/cos tables.
#[derive(Debug)]
pub struct Rope {
    config: RopeConfig,
    device: Device,
    tables: Mutex<SinCos>,
}

impl Rope {
    pub fn new(config: RopeConfig, initial_len: usize, device: &Device) -> Result<Self> {
        config.validate()?;
        let tables = build_tables(&config, initial_len.max(1), device)?;
        Ok(Self {
            config,
            device: device.clone(),
            tables: Mutex::new(tables),
        })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    /// Number of positions currently covered by the cached tables.
    pub fn cached_len(&self) -> Result<usize> {
        Ok(self.lock()?.len)
    }

    /// Returns `(sin, cos)` rows for `offset..offset + len`, growing the tables if needed.
    pub fn sin_cos(&self, offset: usize, len: usize) -> Result<(Tensor, Tensor)> {
        let needed = offset + len;
        let mut tables = self.lock()?;
        if tables.len < needed {
            let grown = needed.max(tables.len * 2);
            log::debug!("extending rotary tables from {} to {grown} positions", tables.len);
            *tables = build_tables(&self.config, grown, &self.device)?;
        }
        Ok((
            tables.sin.narrow(0, offset, len)?,
            tables.cos.narrow(0, offset, len)?,
        ))
    }

    /// Rotates a single `[batch, heads, seq, head_dim]` tensor.
    pub fn rotate(&self, x: &Tensor, offset: usize) -> Result<Tensor> {
        let (_, _, seq, head_dim) = x.dims4()?;
        if head_dim != self.config.head_dim {
            bail!(
                "rotary expects head_dim {}, got {head_dim}",
                self.config.head_dim
            );
        }
        let (sin, cos) = self.sin_cos(offset, seq)?;
        let dtype = x.dtype();
        let compute = x.to_dtype(DType::F32)?;
        let half = head_dim / 2;
        let x1 = compute.narrow(D::Minus1, 0, half)?;
        let x2 = compute.narrow(D::Minus1, half, half)?;
        let sin = sin.reshape((1, 1, seq, half))?;
        let cos = cos.reshape((1, 1, seq, half))?;

        let rotated_1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let rotated_2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;
        Tensor::cat(&[rotated_1, rotated_2], D::Minus1)?.to_dtype(dtype)
    }

    /// Applies the rotation to queries and keys starting at position `offset`.
    pub fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        Ok((self.rotate(q, offset)?, self.rotate(k, offset)?))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SinCos>> {
        self.tables
            .lock()
            .map_err(|_| Error::Msg("rotary table lock poisoned".into()))
    }
}

fn build_tables(config: &RopeConfig, len: usize, device: &Device) -> Result<SinCos> {
    let half = config.head_dim / 2;
    let theta = f64::from(config.theta);
    let inv_freqs: Vec<f64> = (0..half)
        .map(|i| theta.powf(-((2 * i) as f64) / config.head_dim as f64))
        .collect();

    let mut sin = Vec::with_capacity(len * half);
    let mut cos = Vec::with_capacity(len * half);
    for pos in 0..len {
        for inv_freq in &inv_freqs {
            let angle = pos as f64 * inv_freq;
            sin.push(angle.sin() as f32);
            cos.push(angle.cos() as f32);
        }
    }
    Ok(SinCos {
        len,
        sin: Tensor::from_vec(sin, (len, half), device)?,
        cos: Tensor::from_vec(cos, (len, half), device)?,
    })
}
