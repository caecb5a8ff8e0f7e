use std::fs::File;
use std::io::BufWriter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rnn_bias::checkpoint;
use rnn_bias::data::VOCAB_FILE;
use rnn_bias::{generate, Cooccurrences, Corpus, GenerateConfig, SampleOptions, TrainConfig, TrainStatus, Trainer, Vocabulary};

#[derive(Parser)]
#[command(name = "rnn-bias", version, about = "Word-level RNN language model with gender bias regularization")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a language model and keep the checkpoint with the best validation loss
    Train(TrainConfig),
    /// Sample text from a checkpoint and report its gender co-occurrence bias
    Generate(GenerateConfig),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Raises the stop flag. True when it was already raised, i.e. the user
/// pressed Ctrl-C a second time.
fn repeated_interrupt(flag: &AtomicBool) -> bool {
    flag.swap(true, Ordering::SeqCst)
}

fn train(config: TrainConfig) -> Result<()> {
    config.validate().context("invalid training configuration")?;
    info!("\n{}\n   RNN LANGUAGE MODEL TRAINING{}\n{}", "=".repeat(70), if config.bias_reg { " + BIAS REGULARIZATION" } else { "" }, "=".repeat(70));

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    ctrlc::set_handler(move || {
        if repeated_interrupt(&flag) {
            warn!("second interrupt, exiting immediately");
            std::process::exit(130);
        }
        warn!("interrupt received, stopping after the current epoch (press Ctrl-C again to force quit)");
    })
    .context("failed to install the Ctrl-C handler")?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let corpus = Corpus::load(&config.data, &config.split, &mut rng)
        .with_context(|| format!("failed to load corpus from {}", config.data.display()))?;

    let save = config.save.clone();
    let mut trainer = Trainer::new(config, &corpus.vocab, rng, interrupt)?;
    let outcome = trainer.run(&corpus)?;
    match outcome.status {
        TrainStatus::Completed => info!(
            epochs = outcome.epochs_run,
            checkpoint = %save.display(),
            test_ppl = outcome.test_ppl(),
            "training completed"
        ),
        TrainStatus::Interrupted => warn!(
            epochs = outcome.epochs_run,
            test_ppl = outcome.test_ppl(),
            "training interrupted"
        ),
    }
    Ok(())
}

fn sample(config: GenerateConfig) -> Result<()> {
    config.validate().context("invalid generation configuration")?;

    let vocab = Vocabulary::read(config.data.join(VOCAB_FILE))?;
    let (mut g, mut model) = checkpoint::load(&config.checkpoint)
        .with_context(|| format!("failed to load checkpoint {}", config.checkpoint.display()))?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let file = File::create(&config.outf).with_context(|| format!("failed to create {}", config.outf.display()))?;
    let mut out = BufWriter::new(file);
    let opts = SampleOptions::from(&config);
    let generation = generate(&mut model, &mut g, &vocab, &opts, &mut rng, &mut out)?;
    info!(words = generation.tokens.len(), sentences = generation.sentences.len(), outf = %config.outf.display(), "generation done");

    let scores = Cooccurrences::from_sentences(&generation.sentence_words(&vocab)).scores();
    info!("Gender Co-occurrence Bias: {}", scores.bias);
    info!("Gender Co-occurrence Bias (normalized): {}", scores.bias_norm);
    info!("Gender Distribution Divergence: {}", scores.gdd);
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    match Cli::parse().command {
        Command::Train(config) => train(config),
        Command::Generate(config) => sample(config),
    }
}
