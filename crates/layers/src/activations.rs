//! Non-linearities used between feed-forward projections.
//!
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **SiLU** computes `x * sigmoid(x)`; gated MLPs use it for the gate branch.
//!
//! Evaluation happens in the compute dtype; results are cast back to storage.

use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Identity,
    Gelu,
    Silu,
    Relu,
}

pub trait Activation: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> ActivationKind;

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

#[derive(Debug)]
struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self.kind {
            ActivationKind::Identity => compute,
            ActivationKind::Gelu => compute.gelu_erf()?,
            ActivationKind::Silu => compute.silu()?,
            ActivationKind::Relu => compute.relu()?,
        };
        policy.cast_to_storage(&activated)
    }
}

/// Returns a shared built-in activation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn gelu_follows_erf_formula() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = builtin(ActivationKind::Gelu).forward(&input, &policy)?;

        let erf_term = (input.affine(1.0 / SQRT_2, 0.0)?.erf()? + 1.0)?;
        let reference = input.affine(0.5, 0.0)?.mul(&erf_term)?;
        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn silu_and_relu_behave_on_negatives() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-3.0f32, 0.0, 2.0], (3,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let relu = builtin(ActivationKind::Relu).forward(&input, &policy)?.to_vec1::<f32>()?;
        assert_eq!(relu, vec![0.0, 0.0, 2.0]);

        let silu = builtin(ActivationKind::Silu).forward(&input, &policy)?.to_vec1::<f32>()?;
        let expected = 2.0 / (1.0 + (-2.0f32).exp());
        assert!((silu[2] - expected).abs() < 1e-5);
        assert!(silu[0] < 0.0);
        Ok(())
    }
}
