//! cascade-node — run a pipeline-parallel decode call across stage threads.
//!
//! Every stage runs on its own thread of this process, connected either by
//! in-process channels or by a loopback TCP mesh. The model is a synthetic
//! byte-level stand-in (see `demo`), so the output is predictable.
//!
//! ```bash
//! RUST_LOG=info cargo run --bin cascade-node -- generate --stages 3 --prompt "abc" --max-len 24
//! RUST_LOG=cascade_pipeline=debug cargo run --bin cascade-node -- beam --prompt "xy" --beam 3
//! cargo run --bin cascade-node -- generate --transport tcp --early-exit --exit-layer 1 \
//!     --exit-threshold 0.2 --prompt "hello"
//! ```

mod demo;

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::thread;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cascade_net::TcpLink;
use cascade_pipeline::{
    local_pipeline, plan_stages, Batch, BeamHypothesis, BeamSearchDecoder, BufferedRequests, GenerationController,
    GenerationOutput, PipelineLink, Tokenizer,
};
use cascade_types::config::{BeamConfig, GenerationConfig, LinkConfig, PipelineConfig};
use cascade_types::{PipelineStage, Tensor};

use demo::{ByteTokenizer, DemoModel};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "cascade-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Pipeline-parallel decode across local stages"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sample or greedily decode continuations of one or more prompts.
    Generate(GenerateArgs),
    /// Beam search over a single prompt.
    Beam(BeamArgs),
    /// Log-probabilities of each prompt's own tokens.
    Score(ScoreArgs),
}

#[derive(Args)]
struct PipelineArgs {
    /// Number of pipeline stages.
    #[arg(long, default_value_t = 2)]
    stages: u32,
    /// Total transformer layers split across the stages.
    #[arg(long, default_value_t = 8)]
    layers: u32,
    #[arg(long, value_enum, default_value_t = Transport::Local)]
    transport: Transport,
    /// JSON file with `pipeline`, `generation`, `beam` and `link` sections.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Transport {
    Local,
    Tcp,
}

#[derive(Args)]
struct GenerateArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,
    /// Prompt text; repeat for a batch.
    #[arg(long = "prompt", required = true)]
    prompts: Vec<String>,
    #[arg(long, default_value_t = 32)]
    max_len: usize,
    #[arg(long)]
    top_k: Option<usize>,
    #[arg(long)]
    top_p: Option<f32>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    seed: Option<u64>,
    /// Include the prompt in the output.
    #[arg(long)]
    echo: bool,
    #[arg(long)]
    log_probs: bool,
    #[arg(long)]
    early_exit: bool,
    /// Layer carrying an exit head; repeatable.
    #[arg(long = "exit-layer")]
    exit_layers: Vec<u32>,
    #[arg(long)]
    exit_threshold: Option<f32>,
    #[arg(long)]
    micro_batch: Option<usize>,
}

#[derive(Args)]
struct BeamArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value_t = 32)]
    max_len: usize,
    #[arg(long)]
    beam: Option<usize>,
    #[arg(long)]
    num_return: Option<usize>,
    #[arg(long)]
    length_penalty: Option<f32>,
}

#[derive(Args)]
struct ScoreArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,
    #[arg(long = "prompt", required = true)]
    prompts: Vec<String>,
}

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct NodeConfig {
    pipeline: PipelineConfig,
    generation: GenerationConfig,
    beam: BeamConfig,
    link: LinkConfig,
}

impl NodeConfig {
    fn load(path: Option<&PathBuf>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

// ── Jobs ──────────────────────────────────────────────────────────────────────

enum Job {
    Generate { prompts: Vec<String>, max_len: usize },
    Beam { prompt: String, max_len: usize },
    Score { prompts: Vec<String> },
}

enum Outcome {
    Generated(GenerationOutput),
    Beams(Vec<BeamHypothesis>),
    Scores(Tensor<f32>),
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=cascade_pipeline=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let (args, config, job) = match cli.command {
        Command::Generate(a) => {
            let mut config = NodeConfig::load(a.pipeline.config.as_ref())?;
            apply_generate_overrides(&mut config, &a);
            let job = Job::Generate {
                prompts: a.prompts,
                max_len: a.max_len,
            };
            (a.pipeline, config, job)
        }
        Command::Beam(a) => {
            let mut config = NodeConfig::load(a.pipeline.config.as_ref())?;
            let beam = &mut config.beam;
            beam.beam_size = a.beam.unwrap_or(beam.beam_size);
            beam.num_return_sequences = a.num_return.unwrap_or(beam.num_return_sequences);
            beam.length_penalty = a.length_penalty.unwrap_or(beam.length_penalty);
            let job = Job::Beam {
                prompt: a.prompt,
                max_len: a.max_len,
            };
            (a.pipeline, config, job)
        }
        Command::Score(a) => {
            let config = NodeConfig::load(a.pipeline.config.as_ref())?;
            (a.pipeline, config, Job::Score { prompts: a.prompts })
        }
    };

    let outcome = run(&args, &config, &job)?;
    print_outcome(outcome, &job);
    Ok(())
}

fn apply_generate_overrides(config: &mut NodeConfig, a: &GenerateArgs) {
    let generation = &mut config.generation;
    let sampling = &mut generation.sampling;
    sampling.top_k = a.top_k.unwrap_or(sampling.top_k);
    sampling.top_p = a.top_p.unwrap_or(sampling.top_p);
    sampling.temperature = a.temperature.unwrap_or(sampling.temperature);
    sampling.seed = a.seed.or(sampling.seed);
    generation.echo_prompts |= a.echo;
    generation.return_output_log_probs |= a.log_probs;

    let early_exit = &mut generation.early_exit;
    early_exit.use_early_exit |= a.early_exit;
    if !a.exit_layers.is_empty() {
        early_exit.exit_layers = a.exit_layers.clone();
    }
    if let Some(t) = a.exit_threshold {
        early_exit.early_exit_thresholds = vec![t];
    }
    if a.micro_batch.is_some() {
        config.pipeline.micro_batch_size = a.micro_batch;
    }
}

// ── Stages ────────────────────────────────────────────────────────────────────

/// Plan the stages, connect them and run `job` on every one. Returns the
/// first stage's outcome.
fn run(args: &PipelineArgs, config: &NodeConfig, job: &Job) -> Result<Outcome> {
    let exit_layers = &config.generation.early_exit.exit_layers;
    let stages = plan_stages(args.layers, args.stages, exit_layers)?;
    info!(stages = stages.len(), layers = args.layers, "pipeline planned");

    let links: Vec<LinkPlan> = match args.transport {
        Transport::Local => local_pipeline(&stages).into_iter().map(LinkPlan::Local).collect(),
        Transport::Tcp => {
            let listeners = stages
                .iter()
                .map(|_| TcpListener::bind("127.0.0.1:0"))
                .collect::<std::io::Result<Vec<_>>>()?;
            let addrs = listeners
                .iter()
                .map(TcpListener::local_addr)
                .collect::<std::io::Result<Vec<_>>>()?;
            listeners
                .into_iter()
                .map(|listener| LinkPlan::Tcp {
                    listener,
                    addrs: addrs.clone(),
                })
                .collect()
        }
    };

    let results: Vec<Result<Option<Outcome>>> = thread::scope(|scope| {
        let handles: Vec<_> = stages
            .into_iter()
            .zip(links)
            .map(|(stage, plan)| scope.spawn(move || run_stage(stage, plan, config, job)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow::anyhow!("stage thread panicked"))))
            .collect()
    });

    let mut first = None;
    for (rank, result) in results.into_iter().enumerate() {
        let outcome = result.with_context(|| format!("stage {rank} failed"))?;
        if rank == 0 {
            first = outcome;
        }
    }
    first.context("first stage produced no result")
}

enum LinkPlan {
    Local(cascade_pipeline::LocalLink),
    Tcp { listener: TcpListener, addrs: Vec<SocketAddr> },
}

impl LinkPlan {
    fn open(self, stage: &PipelineStage, config: &LinkConfig) -> Result<Box<dyn PipelineLink + Send>> {
        Ok(match self {
            LinkPlan::Local(link) => Box::new(link),
            LinkPlan::Tcp { listener, addrs } => Box::new(TcpLink::establish(stage.clone(), listener, &addrs, config)?),
        })
    }
}

fn run_stage(stage: PipelineStage, plan: LinkPlan, config: &NodeConfig, job: &Job) -> Result<Option<Outcome>> {
    let mut link = plan.open(&stage, &config.link)?;
    let mut model = DemoModel::new(
        stage.clone(),
        config.pipeline.hidden_size,
        &config.generation.early_exit.exit_layers,
    );
    let tokenizer = ByteTokenizer;
    let pad = tokenizer.eod_token_id();

    let outcome = match job {
        Job::Generate { prompts, max_len } => {
            let prompts = tokenize_all(&tokenizer, prompts);
            let batch = Batch::from_prompts(prompts, *max_len, pad)?;
            let mut controller = GenerationController::new(
                &mut model,
                &mut link,
                &tokenizer,
                config.pipeline.clone(),
                config.generation.clone(),
            );
            controller
                .generate(batch, BufferedRequests::new())?
                .map(Outcome::Generated)
        }
        Job::Beam { prompt, max_len } => {
            let prompt = tokenizer.tokenize(prompt);
            let mut decoder = BeamSearchDecoder::new(
                &mut model,
                &mut link,
                &tokenizer,
                config.pipeline.clone(),
                config.beam.clone(),
            );
            decoder.search(&prompt, *max_len)?.map(Outcome::Beams)
        }
        Job::Score { prompts } => {
            let prompts = tokenize_all(&tokenizer, prompts);
            let len = prompts.iter().map(|(_, p)| p.len()).max().unwrap_or(0);
            if len == 0 {
                bail!("nothing to score");
            }
            let batch = Batch::from_prompts(prompts, len, pad)?;
            let mut controller = GenerationController::new(
                &mut model,
                &mut link,
                &tokenizer,
                config.pipeline.clone(),
                config.generation.clone(),
            );
            controller.score(&batch)?.map(Outcome::Scores)
        }
    };
    Ok(outcome)
}

fn tokenize_all(tokenizer: &dyn Tokenizer, prompts: &[String]) -> Vec<(u64, Vec<i64>)> {
    prompts
        .iter()
        .enumerate()
        .map(|(i, p)| (i as u64, tokenizer.tokenize(p)))
        .collect()
}

// ── Output ────────────────────────────────────────────────────────────────────

fn print_outcome(outcome: Outcome, job: &Job) {
    let tokenizer = ByteTokenizer;
    match outcome {
        Outcome::Generated(out) => {
            info!(call_id = %out.call_id, steps = out.steps, "generation complete");
            for seq in &out.sequences {
                println!("[{}] {:?}", seq.request_id, tokenizer.detokenize(&seq.tokens));
                if let Some(lp) = &seq.log_probs {
                    let total: f32 = lp.iter().sum();
                    println!("    log-prob {total:.4} over {} tokens", lp.len());
                }
            }
        }
        Outcome::Beams(beams) => {
            for (rank, beam) in beams.iter().enumerate() {
                println!(
                    "#{rank} score {:.4} ({} new) {:?}",
                    beam.score,
                    beam.generated_length,
                    tokenizer.detokenize(&beam.tokens)
                );
            }
        }
        Outcome::Scores(scores) => {
            let prompts = match job {
                Job::Score { prompts } => prompts.as_slice(),
                _ => &[],
            };
            for (row, prompt) in prompts.iter().enumerate() {
                let lp = scores.row(row);
                let total: f32 = lp.iter().take(prompt.len().saturating_sub(1)).sum();
                println!("{prompt:?} log-prob {total:.4}");
            }
        }
    }
}
