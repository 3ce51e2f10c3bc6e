use anyhow::{Context, Result};
use clap::Parser;
use codemend::config::Config;
use codemend::controller::{RepairController, DEFAULT_MAX_ITERATIONS};
use codemend::ollama::OllamaClient;
use codemend::patch::PatchEngine;
use codemend::report::DEFAULT_REPORT_FILE;
use codemend::sandbox::Sandbox;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "codemend",
    about = "An autonomous repair and optimization loop for Python scripts",
    version
)]
struct Args {
    /// Path to the broken Python script
    script: PathBuf,

    /// Maximum number of repair iterations
    #[arg(short, long, default_value_t = DEFAULT_MAX_ITERATIONS)]
    iterations: u32,

    /// Ollama model to use (default from config, falling back to llama3)
    #[arg(short, long)]
    model: Option<String>,

    /// Description of the expected behavior, enables logic repair
    #[arg(short, long)]
    description: Option<String>,

    /// Sandbox wall-clock timeout in seconds for each candidate run
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Ollama endpoint URL
    #[arg(long)]
    endpoint: Option<String>,

    /// Where to write the debug report
    #[arg(long, default_value = DEFAULT_REPORT_FILE)]
    report: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load();

    let original_code = fs::read_to_string(&args.script)
        .with_context(|| format!("reading {}", args.script.display()))?;

    let model = args.model.unwrap_or_else(|| config.model());
    let endpoint = args.endpoint.unwrap_or_else(|| config.endpoint());
    let timeout = Duration::from_secs(args.timeout.unwrap_or_else(|| config.run_timeout_secs()));

    eprintln!(
        "  Starting repair session for {} (model {}, budget {})",
        args.script.display(),
        model,
        args.iterations
    );

    let sandbox = Sandbox::new(timeout);
    let client = OllamaClient::new(&endpoint, &model);
    let engine = PatchEngine::new(client, &model);
    let controller = RepairController::new(
        sandbox,
        engine,
        &args.script,
        args.iterations,
        args.description,
        &args.report,
    );

    let outcome = controller.run(&original_code).await?;

    if outcome.repaired {
        eprintln!("\n  + Done. Final code verified and saved.");
    } else {
        eprintln!("\n  Run ended without a verified fix; best attempt recorded in the report.");
    }
    eprintln!("  Report: {}", outcome.report_path.display());

    Ok(())
}
