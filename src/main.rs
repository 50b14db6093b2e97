//! loomchat - run one chat request through the completion pipeline from the command line.
//!
//! The request is a JSON `ChatRequest` (camelCase fields). Streaming output is written to
//! stdout as SSE lines ending with `data: [DONE]`; `--no-stream` prints one JSON object.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;

use loomchat_lib::config::{default_log_dir, EngineConfig};
use loomchat_lib::logger::{init_logging, list_log_files};
use loomchat_lib::transport::{pipe_events, DONE_LINE};
use loomchat_lib::{ChatPipeline, ChatRequest};

#[derive(Parser)]
#[command(name = "loomchat")]
#[command(about = "Streaming completion pipeline for AI roleplay chat")]
struct Args {
    /// Request JSON file, or `-` for stdin
    #[arg(required_unless_present = "list_logs")]
    request: Option<String>,

    /// Print the daily log files, newest first, and exit
    #[arg(long)]
    list_logs: bool,

    /// Directory holding `<name>.json` lorebooks
    #[arg(long)]
    lorebook_dir: Option<PathBuf>,

    /// Return a single JSON object instead of an event stream
    #[arg(long)]
    no_stream: bool,

    /// Append logs to a daily file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log to the per-user data directory when no --log-dir is given
    #[arg(long)]
    log_to_file: bool,

    /// Override the provider base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Provider id (openai, openrouter, groq, mistral, deepseek, together, custom)
    #[arg(long)]
    provider: Option<String>,
}

fn read_request(source: &str) -> Result<ChatRequest> {
    let raw = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read request from stdin")?;
        buf
    } else {
        std::fs::read_to_string(source).with_context(|| format!("failed to read {}", source))?
    };
    serde_json::from_str(&raw).context("request is not a valid chat request")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Resolve values: CLI args > env vars (.env included) > defaults
    let mut config = EngineConfig::from_env();
    if let Some(provider) = args.provider {
        config.provider_id = provider;
    }
    if let Some(base_url) = args.base_url {
        config.base_url = Some(base_url);
    }
    if let Some(dir) = args.lorebook_dir {
        config.lorebook_dir = Some(dir);
    }
    if let Some(dir) = args.log_dir {
        config.log.dir = Some(dir);
    } else if args.log_to_file && config.log.dir.is_none() {
        config.log.dir = default_log_dir();
    }

    if args.list_logs {
        let dir = config
            .log
            .dir
            .clone()
            .or_else(default_log_dir)
            .context("no log directory configured")?;
        for name in list_log_files(&dir)? {
            println!("{}", name);
        }
        return Ok(());
    }

    init_logging(&config.log)?;

    let source = args.request.context("a request file is required")?;
    let mut request = read_request(&source)?;
    if args.no_stream {
        request.stream = false;
    }
    tracing::info!(
        provider = config.provider_id.as_str(),
        model = request.model.as_str(),
        stream = request.stream,
        "loomchat starting"
    );

    let pipeline = ChatPipeline::new(config)?;

    if !request.stream {
        let result = pipeline.complete(request).await?;
        println!("{}", serde_json::to_string(&result)?);
        return Ok(());
    }

    let mut handle = pipeline.stream_completion(request);
    let control = handle.control.clone();
    let mut stdout = tokio::io::stdout();

    let cancelled = tokio::select! {
        result = pipe_events(&mut handle.events, &mut stdout) => {
            result?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };

    if cancelled {
        let partial = control.cancel();
        tracing::info!(chars = partial.len(), "cancelled by user");
        stdout.write_all(DONE_LINE.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}
