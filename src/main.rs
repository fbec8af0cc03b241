//! MolGen-RL: reinforcement learning for molecular sequence generators.
//!
//! Subcommands:
//!
//! - `fit`          -- Fit the prior generator to a SMILES corpus
//! - `train`        -- Run the RL epoch loop against the configured environment
//! - `sample`       -- Sample molecules from a saved generator
//! - `init-config`  -- Write the default configuration as JSON

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use molgen_rl::config::{DesignerConfig, EnvironmentConfig};
use molgen_rl::env::{AnyEnv, DescriptorEnvironment, RemoteEnvironment};
use molgen_rl::generator::{Generator, MarkovGenerator, SampleRequest};
use molgen_rl::sequence::{SequenceBatch, SmilesVocabulary, Vocabulary};
use molgen_rl::training::{RewardOracle, RewardShaper, TrainingPipeline};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// MolGen-RL: reinforcement learning for molecular sequence generators
#[derive(Parser)]
#[command(name = "molgen-rl", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the prior generator to a SMILES corpus (one molecule per line).
    Fit {
        /// Vocabulary file, one token per line.
        #[arg(long)]
        vocab: PathBuf,

        /// SMILES corpus.
        #[arg(long)]
        corpus: PathBuf,

        /// Where to write the fitted generator.
        #[arg(long, default_value = "data/prior.json")]
        output: PathBuf,
    },

    /// Train an agent against the configured environment.
    Train {
        /// Vocabulary file, one token per line.
        #[arg(long)]
        vocab: PathBuf,

        /// Frozen prior used for exploration and as the agent's starting point.
        #[arg(long, default_value = "data/prior.json")]
        prior: PathBuf,

        /// Start the agent from this checkpoint instead of the prior.
        #[arg(long)]
        agent: Option<PathBuf>,
    },

    /// Sample molecules from a saved generator.
    Sample {
        /// Vocabulary file, one token per line.
        #[arg(long)]
        vocab: PathBuf,

        /// Generator checkpoint.
        #[arg(long)]
        model: PathBuf,

        /// Number of sequences to sample.
        #[arg(long, default_value_t = 100)]
        count: usize,

        /// Drop duplicate sequences.
        #[arg(long)]
        unique: bool,
    },

    /// Write the default configuration.
    InitConfig {
        #[arg(default_value = "config.json")]
        output: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Load or create configuration.
    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<DesignerConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => DesignerConfig::default(),
    };
    config.validate()?;

    match cli.command {
        Commands::Fit {
            vocab,
            corpus,
            output,
        } => cmd_fit(&config, &vocab, &corpus, &output),
        Commands::Train {
            vocab,
            prior,
            agent,
        } => cmd_train(&config, &vocab, &prior, agent.as_deref()).await,
        Commands::Sample {
            vocab,
            model,
            count,
            unique,
        } => cmd_sample(&vocab, &model, count, unique),
        Commands::InitConfig { output } => cmd_init_config(&config, &output),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_fit(config: &DesignerConfig, vocab_path: &Path, corpus: &Path, output: &Path) -> Result<()> {
    let vocab = SmilesVocabulary::load_from_file(vocab_path)?;
    let width = config.generator.max_len;

    let text = std::fs::read_to_string(corpus)
        .with_context(|| format!("Failed to read corpus {}", corpus.display()))?;
    let mut batch = SequenceBatch::new(width);
    let mut skipped = 0usize;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match vocab.encode(line, width) {
            Ok(tokens) => batch.push(tokens)?,
            Err(e) => {
                skipped += 1;
                tracing::debug!(smiles = line, error = %e, "skipping corpus entry");
            }
        }
    }
    if batch.is_empty() {
        bail!("no corpus entry could be encoded with {}", vocab_path.display());
    }
    if skipped > 0 {
        warn!(skipped, "corpus entries skipped (unknown symbols or too long)");
    }

    let mut model = MarkovGenerator::new(
        vocab.size(),
        width,
        config.generator.learning_rate,
        config.generator.seed,
    )?;
    model.fit(&batch, config.generator.smoothing)?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    model.save_to_file(output)?;

    info!(
        sequences = batch.len(),
        path = %output.display(),
        "Prior fitted"
    );
    Ok(())
}

async fn cmd_train(
    config: &DesignerConfig,
    vocab_path: &Path,
    prior_path: &Path,
    agent_path: Option<&Path>,
) -> Result<()> {
    let vocab = SmilesVocabulary::load_from_file(vocab_path)?;
    let prior = MarkovGenerator::load_from_file(prior_path)?;
    let mut agent = match agent_path {
        Some(path) => MarkovGenerator::load_from_file(path)?,
        None => prior.try_clone()?,
    };
    if let Some(seed) = config.generator.seed {
        prior.reseed(seed)?;
        agent.reseed(seed.wrapping_add(1))?;
    }
    for model in [&prior, &agent] {
        if model.vocab_size() != vocab.size() {
            bail!(
                "generator vocabulary of {} tokens does not match {} ({} tokens)",
                model.vocab_size(),
                vocab_path.display(),
                vocab.size()
            );
        }
    }

    let env = create_env(&config.environment)?;
    let shaper = RewardShaper::new(config.rl.baseline, config.rl.invalid_penalty);
    let oracle = RewardOracle::new(&vocab, &env, shaper);

    let pipeline = TrainingPipeline::new(config.clone())?;
    let summary = pipeline
        .run(&mut agent, Some(&prior), &oracle, |g, path| g.save_to_file(path))
        .await?;

    let final_path = config.evaluation.output_dir.join("agent.final.json");
    agent.save_to_file(&final_path)?;

    info!(
        run_id = %summary.run_id,
        best_epoch = ?summary.best_epoch,
        best_desired_fraction = summary.best_desired_fraction,
        path = %final_path.display(),
        "Training finished"
    );
    Ok(())
}

fn cmd_sample(vocab_path: &Path, model_path: &Path, count: usize, unique: bool) -> Result<()> {
    let vocab = SmilesVocabulary::load_from_file(vocab_path)?;
    let model = MarkovGenerator::load_from_file(model_path)?;

    let mut sequences = model.sample(&SampleRequest::new(count))?.sequences;
    if unique {
        sequences = sequences.unique();
    }

    let mut undecodable = 0usize;
    for row in sequences.rows() {
        match vocab.decode(row) {
            Ok(smiles) => println!("{smiles}"),
            Err(_) => undecodable += 1,
        }
    }
    if undecodable > 0 {
        warn!(undecodable, "sequences could not be decoded");
    }
    Ok(())
}

fn cmd_init_config(config: &DesignerConfig, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(output, json)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(path = %output.display(), "Configuration written");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn create_env(config: &EnvironmentConfig) -> Result<AnyEnv> {
    Ok(match config {
        EnvironmentConfig::Remote {
            base_url,
            timeout_secs,
        } => AnyEnv::Remote(RemoteEnvironment::new(
            base_url,
            Duration::from_secs(*timeout_secs),
        )?),
        EnvironmentConfig::Descriptors { objectives } => {
            AnyEnv::Descriptors(DescriptorEnvironment::new(objectives.clone())?)
        }
    })
}
