// Fine-tunes VBertFt on batches that were tensorized ahead of time, one safetensors file per
// batch holding the reader fields (num_detections, detection_features, mixed_answer_choices...).
use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use candle::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use candle_vcr::inputs::VcrInputs;
use candle_vcr::models::vbert_ft::{Config, Metrics, VBertFt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// The fine-tuning configuration, a json file.
    #[arg(long)]
    config: PathBuf,

    /// Training batches in the safetensors format.
    #[arg(long, num_args = 1..)]
    train_batches: Vec<PathBuf>,

    /// Evaluation batches in the safetensors format, evaluated after every epoch.
    #[arg(long, num_args = 1..)]
    eval_batches: Vec<PathBuf>,

    #[arg(long, default_value_t = 1)]
    epochs: usize,

    #[arg(long, default_value_t = 2e-5)]
    learning_rate: f64,

    /// Resume from weights previously saved with `--save`.
    #[arg(long)]
    load: Option<PathBuf>,

    /// The file where to save the trained weights, in safetensors format.
    #[arg(long)]
    save: Option<PathBuf>,
}

fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        let device = Device::cuda_if_available(0)?;
        if !device.is_cuda() {
            tracing::info!("running on CPU, build with `--features cuda` to run on GPU");
        }
        Ok(device)
    }
}

fn load_batch(path: &Path, config: &Config, device: &Device) -> Result<VcrInputs> {
    let tensors = candle::safetensors::load(path, device)
        .with_context(|| format!("loading batch {path:?}"))?;
    let inputs = VcrInputs::from_tensors(&tensors, config.choice_fields())
        .with_context(|| format!("decoding batch {path:?}"))?;
    Ok(inputs)
}

fn log_metrics(prefix: &str, metrics: &Metrics) {
    match &metrics.detection_accuracy {
        None => tracing::info!("{prefix} accuracy: {:5.2}%", 100. * metrics.accuracy.result()),
        Some(detection_accuracy) => tracing::info!(
            "{prefix} accuracy: {:5.2}% detection accuracy: {:5.2}%",
            100. * metrics.accuracy.result(),
            100. * detection_accuracy.result()
        ),
    }
}

fn evaluate(model: &VBertFt, batches: &[PathBuf], device: &Device) -> Result<Metrics> {
    let mut metrics = Metrics::default();
    for path in batches {
        let inputs = load_batch(path, model.config(), device)?;
        let predictions = model.predict(&inputs, false)?;
        metrics.merge(&model.build_metrics(&inputs, &predictions)?);
    }
    Ok(metrics)
}

fn training_loop(args: &Args, config: Config, device: &Device) -> Result<()> {
    let first_batch = match args.train_batches.first().or(args.eval_batches.first()) {
        Some(path) => load_batch(path, &config, device)?,
        None => anyhow::bail!("no batches provided, use --train-batches or --eval-batches"),
    };
    let feature_dims = first_batch.detections.feature_dims()?;
    // Consumed by the first training step.
    let mut first_batch = (!args.train_batches.is_empty()).then_some(first_batch);
    let bert_config = config.bert_config()?;

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = VBertFt::new(&config, &bert_config, feature_dims, vb)?;
    model.restore_from_checkpoints(&varmap)?;
    if let Some(load) = &args.load {
        tracing::info!("loading weights from {load:?}");
        varmap.load(load)?
    }

    let partition = model.variables_to_train(&varmap);
    let params = ParamsAdamW {
        lr: args.learning_rate,
        ..Default::default()
    };
    let mut opt = AdamW::new(partition.trainable_vars(), params)?;

    for epoch in 1..=args.epochs {
        let mut metrics = Metrics::default();
        for (step, path) in args.train_batches.iter().enumerate() {
            let inputs = match first_batch.take() {
                Some(inputs) => inputs,
                None => load_batch(path, &config, device)?,
            };
            let predictions = model.predict(&inputs, true)?;
            let losses = model.build_losses(&inputs, &predictions)?;
            opt.backward_step(&losses.total()?)?;
            metrics.merge(&model.build_metrics(&inputs, &predictions)?);

            let crossentropy = losses.crossentropy.to_scalar::<f32>()?;
            match &losses.detection_loss {
                None => tracing::info!("{epoch:4} {step:6} crossentropy: {crossentropy:8.5}"),
                Some(detection_loss) => tracing::info!(
                    "{epoch:4} {step:6} crossentropy: {crossentropy:8.5} detection loss: {:8.5}",
                    detection_loss.to_scalar::<f32>()?
                ),
            }
        }
        log_metrics(&format!("{epoch:4} train"), &metrics);

        if !args.eval_batches.is_empty() {
            let metrics = evaluate(&model, &args.eval_batches, device)?;
            log_metrics(&format!("{epoch:4} eval"), &metrics);
        }
    }

    if let Some(save) = &args.save {
        tracing::info!("saving trained weights in {save:?}");
        varmap.save(save)?
    }
    Ok(())
}

pub fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::{prelude::*, EnvFilter};

    let args = Args::parse();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (chrome_layer, _guard) = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        (Some(chrome_layer), Some(guard))
    } else {
        (None, None)
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .with(chrome_layer)
        .init();

    let config = Config::from_json_file(&args.config)?;
    let device = device(args.cpu)?;
    training_loop(&args, config, &device)
}
