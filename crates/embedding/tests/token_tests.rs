use candle_core::{DType, Device, Result, Tensor};
use embedding::token::{TokenEmbedding, TokenEmbeddingConfig};

fn make_ids(data: &[i64], shape: (usize, usize)) -> Result<Tensor> {
    Tensor::from_slice(data, shape, &Device::Cpu)
}

fn config(vocab: usize, hidden: usize, dtype: DType) -> TokenEmbeddingConfig {
    TokenEmbeddingConfig::new(vocab, hidden, dtype, Device::Cpu)
}

#[test]
fn forward_shape_and_dtype_match_config() -> Result<()> {
    let embedding = TokenEmbedding::new(config(8, 4, DType::F16))?;
    let output = embedding.forward(&make_ids(&[0, 1, 2, 3], (2, 2))?)?;
    assert_eq!(output.dims(), &[2, 2, 4]);
    assert_eq!(output.dtype(), DType::F16);
    Ok(())
}

#[test]
fn forward_rejects_out_of_range_ids() -> Result<()> {
    let embedding = TokenEmbedding::new(config(4, 3, DType::F32))?;

    let err = embedding.forward(&make_ids(&[0, 4], (1, 2))?).unwrap_err();
    assert!(err.to_string().contains("token id 4 exceeds vocab size"));

    let err = embedding.forward(&make_ids(&[-1, 2], (1, 2))?).unwrap_err();
    assert!(err.to_string().contains("negative token id"));
    Ok(())
}

#[test]
fn forward_rejects_bad_layouts() -> Result<()> {
    let embedding = TokenEmbedding::new(config(4, 3, DType::F32))?;
    let floats = Tensor::zeros((1, 2), DType::F32, &Device::Cpu)?;
    assert!(embedding.forward(&floats).is_err());

    let flat = Tensor::from_slice(&[0i64, 1], 2, &Device::Cpu)?;
    assert!(embedding.forward(&flat).is_err());

    let empty = Tensor::zeros((1, 0), DType::I64, &Device::Cpu)?;
    assert!(embedding.forward(&empty).is_err());
    Ok(())
}

#[test]
fn tied_linear_head_produces_finite_logits() -> Result<()> {
    for dtype in [DType::F32, DType::F16, DType::BF16] {
        let embedding = TokenEmbedding::new(config(6, 5, dtype))?;
        let hidden = embedding.forward(&make_ids(&[0, 1, 2, 3], (2, 2))?)?;
        let logits = embedding.linear_out(&hidden)?;

        assert_eq!(logits.dims(), &[2, 2, 6]);
        assert_eq!(logits.dtype(), dtype);
        let values = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));
    }
    Ok(())
}

#[test]
fn parameters_are_scoped() -> Result<()> {
    let embedding = TokenEmbedding::new(config(4, 2, DType::F32))?;
    let params = embedding.named_parameters("token_embedding");
    assert_eq!(params.len(), 1);
    assert_eq!(params[0].0, "token_embedding.weight");
    assert_eq!(params[0].1.dims(), &[4, 2]);
    Ok(())
}
