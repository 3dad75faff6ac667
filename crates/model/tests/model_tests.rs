use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Tensor};
use model::{AlrConfig, AlrTransformer, NormKind, PositionalEncoding, SamplingConfig};
use rand::{rngs::StdRng, SeedableRng};

fn small_config() -> AlrConfig {
    AlrConfig::new(16, 2, 32).dim_head(4).heads(2).ff_mult(2.0)
}

fn eval_model(config: AlrConfig) -> Result<AlrTransformer> {
    let model = AlrTransformer::new(config)?;
    model.set_training(false);
    Ok(model)
}

#[test]
fn forward_produces_logits_over_vocabulary() -> Result<()> {
    let model = eval_model(small_config())?;
    let token_ids = Tensor::from_slice(&[0i64, 1, 2, 3, 4, 5], (2, 3), &Device::Cpu)?;

    let logits = model.forward(&token_ids)?;

    assert_eq!(logits.dims(), &[2, 3, 32]);
    assert_eq!(logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn long_random_sequence_keeps_batch_and_length() -> Result<()> {
    let model = eval_model(small_config())?;
    let token_ids = Tensor::rand(0f32, 32.0, (1, 256), &Device::Cpu)?
        .floor()?
        .to_dtype(DType::U32)?;

    let logits = model.forward(&token_ids)?;

    assert_eq!(logits.dims(), &[1, 256, 32]);
    Ok(())
}

#[test]
fn later_tokens_do_not_change_earlier_logits() -> Result<()> {
    for positional in [PositionalEncoding::Rotary, PositionalEncoding::None] {
        let model = eval_model(small_config().positional(positional))?;
        let device = Device::Cpu;
        let a = Tensor::new(&[[3u32, 7, 1, 9, 4]], &device)?;
        let b = Tensor::new(&[[3u32, 7, 1, 9, 30]], &device)?;

        let la = model.forward(&a)?.i((.., 0..4, ..))?;
        let lb = model.forward(&b)?.i((.., 0..4, ..))?;
        let diff = la.sub(&lb)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-4, "{positional:?} leaked future tokens: {diff}");

        let last_a = model.forward(&a)?.i((.., 4, ..))?;
        let last_b = model.forward(&b)?.i((.., 4, ..))?;
        let diff = last_a.sub(&last_b)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff > 0.0);
    }
    Ok(())
}

#[test]
fn zero_residual_scale_silences_every_sublayer() -> Result<()> {
    let model = eval_model(small_config().residual_scale(0.0))?;
    let token_ids = Tensor::new(&[[5u32, 11, 5, 2]], &Device::Cpu)?;

    let logits = model.forward(&token_ids)?;
    let first = logits.i((0, 0))?;
    let repeated = logits.i((0, 2))?;
    let diff = first.sub(&repeated)?.abs()?.max_all()?.to_vec0::<f32>()?;
    assert!(diff < 1e-6, "context leaked through a zero-scaled residual: {diff}");

    let other = logits.i((0, 1))?;
    let diff = first.sub(&other)?.abs()?.max_all()?.to_vec0::<f32>()?;
    assert!(diff > 0.0);
    Ok(())
}

#[test]
fn rejects_invalid_token_ids_and_lengths() -> Result<()> {
    let model = eval_model(small_config().max_seq_len(4))?;
    let device = Device::Cpu;

    let out_of_range = Tensor::new(&[[1u32, 32]], &device)?;
    assert!(model.forward(&out_of_range).is_err());

    let too_long = Tensor::new(&[[1u32, 2, 3, 4, 5]], &device)?;
    let err = model.forward(&too_long).unwrap_err();
    assert!(err.to_string().contains("max_seq_len"));

    let flat = Tensor::new(&[1u32, 2], &device)?;
    assert!(model.forward(&flat).is_err());
    Ok(())
}

#[test]
fn invalid_configs_fail_construction() {
    assert!(AlrTransformer::new(small_config().dim_head(3)).is_err());
    assert!(AlrTransformer::new(AlrConfig::new(16, 0, 32)).is_err());
    assert!(AlrTransformer::new(small_config().dropout(1.5)).is_err());
}

#[test]
fn rms_norm_gated_and_half_precision_variants_run() -> Result<()> {
    let config = small_config()
        .norm_kind(NormKind::RmsNorm)
        .gated_ff(true)
        .activation(model::ActivationKind::Silu)
        .dtype(DType::BF16);
    let model = eval_model(config)?;
    let logits = model.forward(&Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?)?;
    assert_eq!(logits.dims(), &[1, 3, 32]);
    assert_eq!(logits.dtype(), DType::BF16);
    Ok(())
}

#[test]
fn parameter_names_are_unique_and_counted() -> Result<()> {
    let model = AlrTransformer::new(small_config())?;
    let params = model.parameters();
    let mut names: Vec<_> = params.iter().map(|(name, _)| name.clone()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), params.len());
    assert!(names.contains(&"layers.1.alr.ff.up.weight".to_string()));
    assert!(names.contains(&"layers.0.decoder.qkv_proj.weight".to_string()));

    let total: usize = params.iter().map(|(_, var)| var.elem_count()).sum();
    assert_eq!(total, model.num_parameters());
    Ok(())
}

#[test]
fn gradients_reach_every_parameter() -> Result<()> {
    let model = AlrTransformer::new(small_config())?;
    model.set_training(false);
    let ids = Tensor::new(&[[1u32, 5, 9, 2]], &Device::Cpu)?;
    let loss = model.forward(&ids)?.sqr()?.mean_all()?;
    let grads = loss.backward()?;
    for (name, var) in model.parameters() {
        assert!(grads.get(var.as_tensor()).is_some(), "missing gradient for {name}");
    }
    Ok(())
}

#[test]
fn generation_extends_prompt_and_respects_window() -> Result<()> {
    let model = AlrTransformer::new(small_config().max_seq_len(4))?;
    let mut rng = StdRng::seed_from_u64(3);

    let tokens = model.generate(&[1, 2, 3], 6, &SamplingConfig::default(), &mut rng)?;
    assert_eq!(tokens.len(), 9);
    assert_eq!(&tokens[..3], &[1, 2, 3]);
    assert!(tokens.iter().all(|t| *t < 32));
    assert!(model.is_training());

    assert!(model.generate(&[], 1, &SamplingConfig::default(), &mut rng).is_err());
    Ok(())
}

#[test]
fn greedy_generation_is_deterministic() -> Result<()> {
    let model = eval_model(small_config())?;
    let mut rng_a = StdRng::seed_from_u64(1);
    let mut rng_b = StdRng::seed_from_u64(2);
    let a = model.generate(&[4, 8], 5, &SamplingConfig::greedy(), &mut rng_a)?;
    let b = model.generate(&[4, 8], 5, &SamplingConfig::greedy(), &mut rng_b)?;
    assert_eq!(a, b);
    Ok(())
}
