use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use minivllm_core::config::EngineConfig;
use minivllm_core::engine::{Engine, EngineMetrics, StepOutput};
use minivllm_core::scheduler::{FinishReason, NewRequest, Request, SchedulerStats};
use minivllm_core::RequestId;

#[derive(Parser)]
#[command(name = "minivllm")]
#[command(version = "0.1.0")]
#[command(about = "mini-vLLM - Paged KV cache scheduling simulator", long_about = None)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workload through the engine
    Run {
        /// JSON file with the requests to run
        #[arg(short, long, conflicts_with = "scenario")]
        requests: Option<PathBuf>,

        /// Built-in demo workload (brings its own pool geometry)
        #[arg(short, long, value_enum)]
        scenario: Option<Scenario>,

        /// Stop after this many iterations
        #[arg(long, default_value_t = 1000)]
        max_iterations: u64,

        /// Output file for the report (JSON)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Print the effective engine configuration
    Config {
        #[command(flatten)]
        engine: EngineArgs,
    },
}

/// Engine configuration flags, applied over the environment
#[derive(Args)]
struct EngineArgs {
    /// Start from a preset instead of the environment
    #[arg(long, value_enum)]
    preset: Option<Preset>,

    /// Number of KV cache blocks
    #[arg(long)]
    num_blocks: Option<usize>,

    /// Tokens per block
    #[arg(long)]
    block_size: Option<usize>,

    /// Maximum running requests per step
    #[arg(long)]
    max_batch_size: Option<usize>,
}

impl EngineArgs {
    /// Resolve flags over `base`, the preset, or the MINIVLLM_* environment
    fn resolve(&self, base: Option<EngineConfig>) -> anyhow::Result<EngineConfig> {
        let mut config = match (self.preset, base) {
            (Some(preset), _) => preset.config(),
            (None, Some(base)) => base,
            (None, None) => EngineConfig::from_env().context("Invalid engine environment")?,
        };

        if let Some(n) = self.num_blocks {
            config.num_blocks = n;
        }
        if let Some(n) = self.block_size {
            config.block_size = n;
        }
        if let Some(n) = self.max_batch_size {
            config.max_batch_size = n;
        }

        config.validate().context("Invalid engine configuration")?;
        Ok(config)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Preset {
    LowLatency,
    HighThroughput,
}

impl Preset {
    fn config(self) -> EngineConfig {
        match self {
            Preset::LowLatency => EngineConfig::low_latency(),
            Preset::HighThroughput => EngineConfig::high_throughput(),
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    /// One request on a 10-block pool
    Single,
    /// Three requests batched together
    Batch,
    /// Three requests competing for two blocks
    Oom,
    /// An urgent request arriving at a full pool
    Priority,
}

impl Scenario {
    fn config(self) -> EngineConfig {
        let (num_blocks, max_batch_size) = match self {
            Scenario::Single => (10, 1),
            Scenario::Batch => (20, 4),
            Scenario::Oom | Scenario::Priority => (2, 4),
        };
        EngineConfig { num_blocks, block_size: 16, max_batch_size }
    }

    fn requests(self) -> Vec<RequestSpec> {
        let spec = |id, priority, prompt_tokens, max_tokens, arrive_at| RequestSpec {
            request: NewRequest::new(id, prompt_tokens, max_tokens).with_priority(priority),
            stop_after: None,
            arrive_at,
        };

        match self {
            Scenario::Single => vec![spec(1, 0, 5, 5, 0)],
            Scenario::Batch => vec![spec(1, 0, 5, 3, 0), spec(2, 0, 5, 5, 0), spec(3, 0, 2, 4, 0)],
            Scenario::Oom => vec![spec(1, 0, 5, 3, 0), spec(2, 0, 5, 3, 0), spec(3, 0, 2, 3, 0)],
            Scenario::Priority => {
                vec![spec(1, 1, 8, 4, 0), spec(2, 1, 8, 5, 0), spec(3, 0, 8, 2, 2)]
            }
        }
    }
}

/// One entry of a request file
#[derive(Debug, Clone, Deserialize)]
struct RequestSpec {
    #[serde(flatten)]
    request: NewRequest,

    /// End the sequence early after this many generated tokens
    #[serde(default)]
    stop_after: Option<usize>,

    /// Iteration before which the request is queued
    #[serde(default)]
    arrive_at: u64,
}

#[derive(Serialize)]
struct Report {
    config: EngineConfig,
    completed: bool,
    iterations: u64,
    metrics: EngineMetrics,
    scheduler: SchedulerStats,
    finished: Vec<FinishedRequest>,
    unfinished: Vec<RequestId>,
}

#[derive(Serialize)]
struct FinishedRequest {
    id: RequestId,
    priority: u32,
    prompt_tokens: usize,
    generated_tokens: usize,
    num_preemptions: u32,
    finish_reason: Option<FinishReason>,
}

impl From<&Request> for FinishedRequest {
    fn from(request: &Request) -> Self {
        Self {
            id: request.id,
            priority: request.priority,
            prompt_tokens: request.prompt_tokens,
            generated_tokens: request.generated_tokens,
            num_preemptions: request.num_preemptions,
            finish_reason: request.finish_reason,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays parseable
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("minivllm={0},minivllm_core={0}", default_level))
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Config { engine } => {
            let config = engine.resolve(None)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Run { requests, scenario, max_iterations, output, engine } => {
            let (config, specs) = match (requests, scenario) {
                (Some(path), _) => (engine.resolve(None)?, load_requests(&path)?),
                (None, Some(scenario)) => {
                    (engine.resolve(Some(scenario.config()))?, scenario.requests())
                }
                (None, None) => anyhow::bail!("Either --requests or --scenario is required"),
            };

            let report = run(config, specs, max_iterations)?;
            let json = serde_json::to_string_pretty(&report)?;

            println!("\n=== JSON Report ===");
            println!("{}", json);

            if let Some(path) = output {
                std::fs::write(&path, &json)
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
                println!("\n✅ Report saved to: {}", path.display());
            }
        }
    }

    Ok(())
}

fn load_requests(path: &Path) -> anyhow::Result<Vec<RequestSpec>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse requests from {}", path.display()))
}

/// Drive the engine over the workload, queuing each request at its arrival
fn run(config: EngineConfig, specs: Vec<RequestSpec>, max_iterations: u64) -> anyhow::Result<Report> {
    let mut engine = Engine::new(config).context("Failed to build engine")?;

    println!("🚀 Starting mini-vLLM engine");
    println!(
        "Config: {} blocks × {} tokens/block, batch size {}",
        config.num_blocks, config.block_size, config.max_batch_size
    );

    let mut pending = specs;
    // Pop from the back in arrival order
    pending.sort_by(|a, b| b.arrive_at.cmp(&a.arrive_at));

    let mut finished = Vec::new();
    let mut iterations = 0;

    while iterations < max_iterations {
        while pending.last().is_some_and(|spec| spec.arrive_at <= iterations) {
            let Some(spec) = pending.pop() else { break };
            if let Some(tokens) = spec.stop_after {
                engine.executor_mut().set_stop_after(spec.request.id, tokens);
            }
            engine
                .add_request(spec.request)
                .with_context(|| format!("Failed to add request {}", spec.request.id))?;
            println!("✓ Added request {} (priority {})", spec.request.id, spec.request.priority);
        }

        if pending.is_empty() && !engine.has_work() {
            break;
        }

        let step = engine.step()?;
        iterations += 1;
        print_step(&step);
        finished.extend(step.finished);
    }

    let completed = pending.is_empty() && !engine.has_work();
    if completed {
        println!("\n✅ Done after {} iterations", iterations);
    } else {
        println!("\n⚠️  Stopped after {} iterations with work remaining", iterations);
    }
    println!("{}", engine.metrics());
    println!("{}", engine.scheduler().stats());
    info!(iterations, completed, "workload finished");

    let mut unfinished: Vec<RequestId> = engine.scheduler().requests().map(|r| r.id).collect();
    unfinished.extend(pending.iter().map(|spec| spec.request.id));
    unfinished.sort_unstable();

    Ok(Report {
        config,
        completed,
        iterations,
        metrics: engine.metrics().clone(),
        scheduler: engine.scheduler().stats(),
        finished: finished.iter().map(FinishedRequest::from).collect(),
        unfinished,
    })
}

fn print_step(step: &StepOutput) {
    println!("\n=== Iteration {} ===", step.iteration);
    println!("Batch: {:?} ({} free blocks)", step.batch, step.free_blocks);

    for id in &step.admitted {
        println!("  → {} admitted", id);
    }
    for id in &step.preempted {
        println!("  ↩ {} preempted", id);
    }
    if let Some(stall) = step.stalled {
        println!("  … {} waiting, short {} blocks", stall.request_id, stall.deficit);
    }
    for request in &step.finished {
        let reason = request.finish_reason.map(|r| r.to_string()).unwrap_or_default();
        println!(
            "  ✓ {} finished ({}) after {} tokens",
            request.id, reason, request.generated_tokens
        );
    }
}
