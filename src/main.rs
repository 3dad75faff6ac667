use alr_transformer::{defaults, select_device, AlrConfig, AlrTransformer, DevicePreference};
use anyhow::Result;
use candle_core::{DType, Tensor};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DeviceArg {
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl From<DeviceArg> for DevicePreference {
    fn from(value: DeviceArg) -> Self {
        match value {
            DeviceArg::Auto => DevicePreference::Auto,
            DeviceArg::Cpu => DevicePreference::Cpu,
            DeviceArg::Cuda => DevicePreference::Cuda,
            DeviceArg::Metal => DevicePreference::Metal,
        }
    }
}

/// Builds an ALR transformer, feeds it random token ids and prints the logits.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value_t = defaults::DIM)]
    dim: usize,
    #[arg(long, default_value_t = defaults::DEPTH)]
    depth: usize,
    #[arg(long, default_value_t = defaults::NUM_TOKENS)]
    num_tokens: usize,
    #[arg(long, default_value_t = defaults::DIM_HEAD)]
    dim_head: usize,
    #[arg(long, default_value_t = defaults::HEADS)]
    heads: usize,
    #[arg(long, default_value_t = defaults::FF_MULT)]
    ff_mult: f32,
    #[arg(long, default_value_t = 1)]
    batch: usize,
    #[arg(long, default_value_t = defaults::SEQ_LEN)]
    seq_len: usize,
    #[arg(long, value_enum, default_value_t = DeviceArg::Auto)]
    device: DeviceArg,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let device = select_device(args.device.into());

    let config = AlrConfig::new(args.dim, args.depth, args.num_tokens)
        .dim_head(args.dim_head)
        .heads(args.heads)
        .ff_mult(args.ff_mult)
        .device(device.clone());
    let model = AlrTransformer::new(config)?;
    model.set_training(false);

    let x = Tensor::rand(0f32, args.num_tokens as f32, (args.batch, args.seq_len), &device)?
        .floor()?
        .to_dtype(DType::U32)?;
    let logits = model.forward(&x)?;

    println!("{logits}");
    println!("{:?}", logits.dims());
    Ok(())
}
