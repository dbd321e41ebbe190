//! CLI binary for pdf2md-pipeline.
//!
//! A thin shim over the library crate: maps flags to `ConversionConfig`,
//! runs documents through a `Scheduler`, and renders live progress from a
//! `ProgressHub` subscription.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use pdf2md_pipeline::pipeline::render::page_image_name;
use pdf2md_pipeline::{
    ConversionConfig, ConversionConfigBuilder, Frame, PageStore, Pipeline, ProgressHub,
    ProgressStatus, Scheduler, Subscription,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert; page artifacts and report.md land next to the PDF
  pdf2md convert docs/report.pdf

  # Four pages in flight, stop after ten minutes
  pdf2md convert -c 4 --document-timeout 600 docs/report.pdf

  # Stream progress events as server-sent-event frames
  pdf2md convert --events docs/report.pdf

  # Re-run page 3 and rebuild report.md from the artifacts on disk
  pdf2md regenerate docs/report.pdf --page 3

FILES (next to the document):
  page_0001.png   rendered page image
  page_0001.md    page artifact, written atomically as each page finishes
  <name>.md       merged document, pages in order with <!-- page N --> markers

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium
  RUST_LOG                Log filter, overrides --verbose / --quiet
"#;

/// Convert documents to Markdown page by page with Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2md",
    version,
    about = "Convert documents to Markdown page by page with Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2MD_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a whole document.
    Convert(ConvertArgs),
    /// Regenerate one page and re-merge the document.
    Regenerate(RegenerateArgs),
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// PDF file to convert.
    document: PathBuf,

    /// Maximum number of page conversions in flight.
    #[arg(short, long, env = "LLM_CONCURRENCY", default_value_t = 2)]
    concurrency: usize,

    /// Abort the run after this many seconds.
    #[arg(long, env = "PDF2MD_DOCUMENT_TIMEOUT")]
    document_timeout: Option<u64>,

    /// Rendering DPI (72–400).
    #[arg(long, env = "PDF2MD_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2MD_PASSWORD")]
    password: Option<String>,

    /// Print the merged Markdown to stdout when done.
    #[arg(long)]
    stdout: bool,

    /// Output the task record and per-page results as JSON.
    #[arg(long)]
    json: bool,

    /// Write progress as server-sent-event frames to stderr instead of a bar.
    #[arg(long)]
    events: bool,

    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args, Debug)]
struct RegenerateArgs {
    /// PDF file whose page should be regenerated.
    document: PathBuf,

    /// 1-indexed page number.
    #[arg(short, long)]
    page: usize,

    /// Page image to transcribe. Default: page_NNNN.png next to the document.
    #[arg(long)]
    image: Option<PathBuf>,

    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4o, claude-sonnet-4-20250514).
    #[arg(long, env = "LLM_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "LLM_PROVIDER")]
    provider: Option<String>,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "LLM_TEMPERATURE", default_value_t = 0.3)]
    temperature: f32,

    /// Max LLM output tokens per page.
    #[arg(long, env = "LLM_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Attempts per page, first call included.
    #[arg(long, env = "LLM_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Base retry delay in milliseconds (linear).
    #[arg(long, env = "LLM_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Per-attempt LLM call timeout in seconds.
    #[arg(long, env = "LLM_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "PDF2MD_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Path to a text file containing a custom user prompt.
    #[arg(long, env = "PDF2MD_USER_PROMPT")]
    user_prompt: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Keep library INFO logs out of the way of the progress bar.
    let bar_active = matches!(&cli.command, Command::Convert(a) if !a.events && !a.json);
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || bar_active {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Convert(ref args) => run_convert(args, cli.quiet).await,
        Command::Regenerate(ref args) => run_regenerate(args, cli.quiet).await,
    }
}

async fn run_convert(args: &ConvertArgs, quiet: bool) -> Result<()> {
    let mut builder = model_config(&args.model)
        .await?
        .concurrency(args.concurrency)
        .dpi(args.dpi);
    if let Some(secs) = args.document_timeout {
        builder = builder.document_timeout_secs(secs);
    }
    if let Some(ref pwd) = args.password {
        builder = builder.password(pwd.clone());
    }
    let config = builder.build().context("Invalid configuration")?;

    let pipeline = Pipeline::from_config(config).context("Failed to set up the pipeline")?;
    let hub = ProgressHub::new();
    let scheduler = Scheduler::new(Arc::new(pipeline), hub.clone());
    let task_id = scheduler.registry().create(&args.document);

    let watcher = if quiet || args.json {
        None
    } else if args.events {
        Some(tokio::spawn(print_frames(hub.subscribe(&task_id))))
    } else {
        Some(tokio::spawn(drive_bar(hub.subscribe(&task_id))))
    };

    let result = scheduler.process_document(&task_id).await;
    if let Some(w) = watcher {
        // The watcher exits on the terminal event; don't hang on a lost one.
        let _ = tokio::time::timeout(Duration::from_secs(2), w).await;
    }
    let output = result.with_context(|| format!("Conversion of {:?} failed", args.document))?;

    if args.json {
        let record = scheduler.registry().get(&task_id);
        let json = serde_json::json!({ "task": record, "pages": output.pages });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).context("Failed to serialise output")?
        );
        return Ok(());
    }

    if args.stdout {
        let mut handle = io::stdout().lock();
        handle
            .write_all(output.markdown.as_bytes())
            .context("Failed to write to stdout")?;
    }

    if !quiet {
        let stats = &output.stats;
        eprintln!(
            "{}  {}/{} pages  {}ms  →  {}",
            if stats.failed_pages == 0 {
                green("✔")
            } else {
                cyan("⚠")
            },
            stats.processed_pages,
            stats.total_pages,
            stats.total_duration_ms,
            bold(&output.merged_path.display().to_string()),
        );
        eprintln!(
            "   {} tokens in  /  {} tokens out",
            dim(&stats.total_input_tokens.to_string()),
            dim(&stats.total_output_tokens.to_string()),
        );
        for page in output.pages.iter().filter(|p| !p.is_ok()) {
            if let Some(ref e) = page.error {
                eprintln!("   {} {}", red("✗"), e);
            }
        }
    }
    Ok(())
}

async fn run_regenerate(args: &RegenerateArgs, quiet: bool) -> Result<()> {
    let config = model_config(&args.model)
        .await?
        .concurrency(1)
        .build()
        .context("Invalid configuration")?;

    let image = args.image.clone().unwrap_or_else(|| {
        PageStore::for_document(&args.document)
            .dir()
            .join(page_image_name(args.page))
    });

    let pipeline = Pipeline::from_config(config).context("Failed to set up the pipeline")?;
    let scheduler = Scheduler::new(Arc::new(pipeline), ProgressHub::new());
    let task_id = scheduler.registry().create(&args.document);

    let outcome = scheduler
        .regenerate_page(&task_id, args.page, &image)
        .await
        .with_context(|| format!("Regeneration of page {} failed", args.page))?;

    if !quiet {
        eprintln!(
            "{}  page {} regenerated, {} pages merged  →  {}",
            green("✔"),
            outcome.page_num,
            outcome.merged_pages,
            bold(&outcome.merged_path.display().to_string()),
        );
        eprintln!(
            "   {} tokens in  /  {} tokens out",
            dim(&outcome.usage.input_tokens.to_string()),
            dim(&outcome.usage.output_tokens.to_string()),
        );
    }
    Ok(())
}

/// Map model flags to a config builder.
async fn model_config(args: &ModelArgs) -> Result<ConversionConfigBuilder> {
    let mut builder = ConversionConfig::builder()
        .temperature(args.temperature)
        .max_tokens(args.max_tokens)
        .max_attempts(args.max_attempts)
        .retry_backoff_ms(args.retry_backoff_ms)
        .api_timeout_secs(args.api_timeout);

    if let Some(ref model) = args.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref path) = args.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(ref path) = args.user_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read user prompt from {:?}", path))?;
        builder = builder.user_prompt(prompt);
    }
    Ok(builder)
}

/// Render subscription events as a progress bar until the task finishes.
async fn drive_bar(sub: Subscription) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
    );
    bar.set_prefix("Converting");
    bar.enable_steady_tick(Duration::from_millis(80));

    loop {
        let event = sub.recv().await;
        bar.set_length(event.total_pages as u64);
        bar.set_position(event.current_page as u64);
        match event.status {
            ProgressStatus::Processing => {}
            ProgressStatus::Completed => {
                bar.finish_and_clear();
                break;
            }
            ProgressStatus::Failed => {
                bar.abandon_with_message(red("failed"));
                break;
            }
        }
    }
}

/// Write every frame as SSE text until the task finishes.
async fn print_frames(sub: Subscription) {
    let mut frames = sub.into_frames();
    while let Some(frame) = frames.next().await {
        eprint!("{}", frame.to_sse());
        if let Frame::Event(ref event) = frame {
            if event.status != ProgressStatus::Processing {
                break;
            }
        }
    }
}
