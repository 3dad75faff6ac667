//! Shape and dtype assertions shared by layer constructors and forward paths.
//!
//! All helpers take a `label` naming the tensor so error messages point at
//! the offending parameter or activation.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {:?}, got {:?}",
            expected,
            tensor.dims()
        )))
    }
}

pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got {:?}",
            tensor.dims()
        )))
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(label: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [batch, seq, actual] if *actual == hidden && *batch > 0 && *seq > 0 => Ok(()),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, seq, {hidden}) layout, got {dims:?}"
        ))),
    }
}

pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Floating dtypes accepted for parameters.
pub const PARAMETER_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];

pub fn expect_parameter_dtype(label: &str, tensor: &Tensor) -> Result<()> {
    expect_dtype_in(label, tensor, PARAMETER_DTYPES)
}
