//! Precision policy shared by every layer.
//!
//! Parameters may be stored in `f16`/`bf16` while matmuls and activations run
//! in `f32`. Reductions (norm statistics, softmax) always use `f32`.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute, DType::F32)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Indicates whether the policy performs mixed precision work.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    /// Comparison tolerance matching the storage dtype.
    pub fn storage_epsilon(&self) -> f32 {
        match self.storage {
            DType::BF16 => 2e-2,
            DType::F16 => 5e-3,
            DType::F32 => 1e-5,
            DType::F64 => 1e-7,
            _ => 0.0,
        }
    }

    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn reduced_precision_promotes_compute() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        assert_eq!(policy.storage(), DType::BF16);
        assert_eq!(policy.compute(), DType::F32);
        assert_eq!(policy.reduction(), DType::F32);
        assert!(policy.is_mixed_precision());

        let full = PrecisionPolicy::from_parameter_dtype(DType::F32);
        assert!(!full.is_mixed_precision());
    }

    #[test]
    fn storage_cast_stays_within_tolerance() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let base = Tensor::from_vec(vec![0.125f32, -0.75, 3.5], (3,), &device)?;
        let stored = policy.cast_to_storage(&base)?;
        assert_eq!(stored.dtype(), DType::F16);

        let restored = policy.cast_for_matmul(&stored)?.to_vec1::<f32>()?;
        for (orig, rest) in base.to_vec1::<f32>()?.iter().zip(restored.iter()) {
            assert!((orig - rest).abs() <= policy.storage_epsilon());
        }
        Ok(())
    }
}
