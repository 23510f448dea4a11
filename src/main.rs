use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chartflow_core::config::{AppConfig, EngineConfig, ModelConfig};
use chartflow_core::event::EventBus;
use chartflow_core::traits::Generator;
use chartflow_core::types::RunEvent;
use chartflow_engine::{FlowchartDocument, FlowchartRunner};

#[derive(Parser)]
#[command(name = "chartflow", version, about = "Run LLM flowcharts with speculative lookahead")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "chartflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flowchart and print the terminal text and extracted results
    Run {
        /// Flowchart document (.json or .toml)
        #[arg(short, long)]
        flowchart: PathBuf,
        /// Initial context inserted into every prompt
        #[arg(long, default_value = "")]
        context: String,
        /// Override the configured lookahead depth
        #[arg(long)]
        lookahead: Option<usize>,
        /// Print run events to stderr while the run progresses
        #[arg(long)]
        events: bool,
    },
    /// Validate a flowchart and show how each node is classified
    Validate {
        /// Flowchart document (.json or .toml)
        #[arg(short, long)]
        flowchart: PathBuf,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chartflow=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Validation needs no model configuration
    if let Commands::Validate { flowchart } = &cli.command {
        return validate(flowchart);
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        warn!(
            path = %cli.config.display(),
            "No config file found, using OPENAI_API_KEY or a local Ollama endpoint"
        );
        create_env_config()
    };

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config.redacted())?);
        }
        Commands::Run {
            flowchart,
            context,
            lookahead,
            events,
        } => {
            run(&config, &flowchart, &context, lookahead, events).await?;
        }
        Commands::Validate { .. } => {}
    }

    Ok(())
}

async fn run(
    config: &AppConfig,
    path: &Path,
    context: &str,
    lookahead: Option<usize>,
    events: bool,
) -> anyhow::Result<()> {
    let document = FlowchartDocument::load(path)?;
    let generator: Arc<dyn Generator> = Arc::from(chartflow_llm::create_generator(&config.model)?);

    let mut engine = config.engine.clone();
    if let Some(depth) = lookahead {
        engine.lookahead_depth = depth;
    }
    info!(
        flowchart = %path.display(),
        provider = %config.model.provider,
        model = %config.model.model_id,
        "Starting run"
    );

    let mut runner = FlowchartRunner::from_document(&document, generator)?.with_config(engine);
    let print_handle = if events {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        runner = runner.with_events(bus);
        Some(tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                let finished = matches!(event, RunEvent::RunFinished { .. });
                print_event(&event);
                if finished {
                    break;
                }
            }
        }))
    } else {
        None
    };

    let result = runner.run(context).await;
    if let Some(handle) = print_handle {
        handle.await.ok();
    }
    let output = result?;

    println!("{}", output.text);
    println!("{}", serde_json::to_string_pretty(&output.extracted)?);
    info!(
        steps = output.path.len(),
        launched = output.stats.launched,
        reused = output.stats.reused,
        discarded = output.stats.discarded_failures,
        stale = output.stats.stale,
        elapsed_ms = output.elapsed_ms,
        "Run complete"
    );
    Ok(())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunStarted { start_node, .. } => eprintln!("[run] start at {}", start_node),
        RunEvent::NodeStarted {
            instance,
            speculative,
            ..
        } => eprintln!("[{}] started{}", instance, speculative_tag(*speculative)),
        RunEvent::NodeCompleted {
            instance,
            speculative,
            elapsed_ms,
            ..
        } => eprintln!(
            "[{}] done in {}ms{}",
            instance,
            elapsed_ms,
            speculative_tag(*speculative)
        ),
        RunEvent::NodeFailed {
            instance,
            speculative,
            error,
            ..
        } => eprintln!("[{}] FAILED{}: {}", instance, speculative_tag(*speculative), error),
        RunEvent::DecisionFallback {
            instance,
            returned,
            chosen,
            ..
        } => eprintln!(
            "[{}] decision '{}' matched no connection, following '{}'",
            instance, returned, chosen
        ),
        RunEvent::RunFinished {
            succeeded,
            elapsed_ms,
            ..
        } => eprintln!(
            "[run] {} in {}ms",
            if *succeeded { "finished" } else { "failed" },
            elapsed_ms
        ),
    }
}

fn speculative_tag(speculative: bool) -> &'static str {
    if speculative {
        " (speculative)"
    } else {
        ""
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let document = FlowchartDocument::load(path)?;
    let flowchart = document.flowchart()?;

    println!("start: {}", flowchart.start());
    for (id, node) in flowchart.nodes() {
        let kind = match &node.kind {
            chartflow_engine::NodeKind::Basic => format!("{:?}", node.class()),
            chartflow_engine::NodeKind::LoopStart { iterator, collection } => {
                format!("LoopStart ({} in {})", iterator, collection)
            }
            chartflow_engine::NodeKind::LoopContinue { .. } => "LoopContinue".to_string(),
        };
        let targets: Vec<String> = node
            .connections
            .iter()
            .map(|(label, target)| format!("{label} -> {target}"))
            .collect();
        println!("  {:<20} {:<28} {}", id, kind, targets.join(", "));
    }
    Ok(())
}

fn create_env_config() -> AppConfig {
    let model = match std::env::var("OPENAI_API_KEY") {
        Ok(key) => ModelConfig {
            provider: "openai".to_string(),
            model_id: "gpt-4o-mini".to_string(),
            api_key: Some(key),
            base_url: None,
            max_tokens: 4096,
            retry: Some(Default::default()),
        },
        // Default to Ollama (local)
        Err(_) => ModelConfig {
            provider: "ollama".to_string(),
            model_id: "llama3.2".to_string(),
            api_key: None,
            base_url: Some("http://localhost:11434/v1/chat/completions".to_string()),
            max_tokens: 4096,
            retry: None,
        },
    };

    AppConfig {
        engine: EngineConfig::default(),
        model,
    }
}
