//! CodeVibe CLI
//!
//! The `codevibe` command analyzes and runs untrusted Python programs.
//!
//! ## Commands
//!
//! - `run`: Analyze, then execute a program in the sandbox and print the result JSON
//! - `check`: Static analysis only
//! - `rules`: Print the loaded violation rule table
//! - `serve`: Execute newline-delimited JSON requests read from stdin

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use codevibe_core::metrics::METRICS;
use codevibe_core::{
    Cancelled, EngineConfig, ExecutionResult, Executor, LimitOverrides, RuleTable, SourceProgram,
    WireRequest,
};

#[derive(Parser)]
#[command(name = "codevibe")]
#[command(author = "CodeVibe Maintainers")]
#[command(version = codevibe_core::VERSION)]
#[command(about = "Static analysis and sandboxed execution of untrusted Python", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "CODEVIBE_CONFIG")]
    config: Option<PathBuf>,

    /// Replacement rule table (TOML)
    #[arg(long, global = true, env = "CODEVIBE_RULES")]
    rules: Option<PathBuf>,

    /// Sandboxes allowed to run at once
    #[arg(long, global = true, env = "CODEVIBE_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Python interpreter used inside the sandbox
    #[arg(long, global = true, env = "CODEVIBE_PYTHON")]
    python: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze and execute a program, printing the result as JSON
    ///
    /// Exits 0 only when the program ran and exited successfully.
    Run {
        /// Program file, or `-` for stdin
        file: PathBuf,

        #[command(flatten)]
        limits: LimitArgs,
    },

    /// Statically analyze a program without running it
    Check {
        /// Program file, or `-` for stdin
        file: PathBuf,
    },

    /// Print the loaded rule table
    Rules {
        #[arg(long, value_enum, default_value = "text")]
        format: RulesFormat,
    },

    /// Read JSON requests from stdin, one per line, and write one result per line
    Serve,
}

/// Per-run limit overrides. Values are clamped to the configured policy.
#[derive(Args, Debug, Default)]
struct LimitArgs {
    /// Wall-clock limit in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Cap on captured bytes per output stream
    #[arg(long)]
    max_output_bytes: Option<u64>,

    /// Address-space limit in bytes
    #[arg(long)]
    max_memory_bytes: Option<u64>,
}

impl LimitArgs {
    fn overrides(&self) -> LimitOverrides {
        LimitOverrides {
            timeout_ms: self.timeout_ms,
            max_output_bytes: self.max_output_bytes,
            max_memory_bytes: self.max_memory_bytes,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RulesFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    codevibe_core::telemetry::init_tracing(cli.json, level);

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run { file, limits } => cmd_run(&config, &file, &limits).await,
        Commands::Check { file } => cmd_check(&config, &file).await,
        Commands::Rules { format } => cmd_rules(&config, format),
        Commands::Serve => {
            let executor = Arc::new(build_executor(&config)?);
            let stdin = BufReader::new(tokio::io::stdin());
            let max_pending = executor.capacity() * PENDING_PER_SLOT;
            cmd_serve(executor, stdin, tokio::io::stdout(), max_pending).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Config file (or defaults) with command-line flags applied on top.
fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(rules) = &cli.rules {
        config.rules_path = Some(rules.clone());
    }
    if let Some(max_concurrent) = cli.max_concurrent {
        config.max_concurrent = max_concurrent;
    }
    if let Some(python) = &cli.python {
        config.runner.interpreter = python.clone();
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_executor(config: &EngineConfig) -> Result<Executor> {
    Executor::from_config(config).context("Failed to initialise execution engine")
}

fn load_rules(config: &EngineConfig) -> Result<RuleTable> {
    let table = match &config.rules_path {
        Some(path) => RuleTable::load(path),
        None => RuleTable::builtin(),
    };
    table.context("Failed to load rule table")
}

async fn read_source(file: &Path) -> Result<String> {
    if file == Path::new("-") {
        let mut text = String::new();
        tokio::io::stdin()
            .read_to_string(&mut text)
            .await
            .context("Failed to read program from stdin")?;
        return Ok(text);
    }
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read program {}", file.display()))
}

// ---------------------------------------------------------------------------
// run / check / rules
// ---------------------------------------------------------------------------

async fn cmd_run(config: &EngineConfig, file: &Path, limits: &LimitArgs) -> Result<ExitCode> {
    let executor = build_executor(config)?;
    let source = read_source(file).await?;
    let request = executor.request(SourceProgram::python(source), &limits.overrides());

    let result = executor.execute(&request).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    METRICS.flush();

    Ok(if result.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_check(config: &EngineConfig, file: &Path) -> Result<ExitCode> {
    let executor = build_executor(config)?;
    let source = read_source(file).await?;

    let verdict = executor.analyzer().analyze(&SourceProgram::python(source));
    println!("{}", serde_json::to_string_pretty(&verdict)?);

    Ok(if verdict.allowed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_rules(config: &EngineConfig, format: RulesFormat) -> Result<ExitCode> {
    let table = load_rules(config)?;
    match format {
        RulesFormat::Json => {
            let doc = json!({
                "version": table.version(),
                "rules": table.rules(),
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        RulesFormat::Text => {
            println!("Rule table v{} ({} rules)", table.version(), table.len());
            println!();
            for rule in table.rules() {
                println!(
                    "  {:<32} {:<12} {:<20} {:<8} {}",
                    rule.id,
                    rule.kind.to_string(),
                    format!("{:?}", rule.category),
                    format!("{:?}", rule.severity),
                    rule.pattern
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

/// One result line: the caller's id followed by the result fields.
#[derive(Serialize)]
struct ServeResponse<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(flatten)]
    result: &'a ExecutionResult,
}

/// A request that produced no result (unparseable, or cancelled on shutdown).
#[derive(Serialize)]
struct ServeError {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    error: String,
}

/// Requests `serve` keeps outstanding per execution slot.
const PENDING_PER_SLOT: usize = 4;

#[derive(Debug, Default, PartialEq, Eq)]
struct ServeSummary {
    received: u64,
    /// Most requests outstanding at once.
    peak_pending: usize,
}

/// Run requests concurrently under the executor's admission control.
///
/// Responses are written in completion order, one JSON object per line.
/// At most `max_pending` requests are outstanding; further input waits.
/// EOF waits for in-flight requests; Ctrl-C cancels them.
async fn cmd_serve<R, W>(
    executor: Arc<Executor>,
    input: R,
    output: W,
    max_pending: usize,
) -> Result<ServeSummary>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let max_pending = max_pending.max(1);
    let shutdown = CancellationToken::new();
    let interrupt = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(event = "serve.interrupted", "cancelling in-flight executions");
                shutdown.cancel();
            }
        })
    };

    let (tx, mut rx) = mpsc::channel::<String>(max_pending);
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    info!(
        event = "serve.started",
        capacity = executor.capacity(),
        max_pending,
        "reading requests from stdin"
    );

    // A request holds a permit from before its line is read until its
    // response is queued, so stdin is not read while `max_pending` are
    // outstanding.
    let pending = Arc::new(Semaphore::new(max_pending));
    let mut permit = None;
    let mut lines = input.lines();
    let mut tasks = JoinSet::new();
    let mut summary = ServeSummary::default();
    loop {
        tokio::select! {
            Some(joined) = tasks.join_next() => reap(joined),
            acquired = pending.clone().acquire_owned(), if permit.is_none() => {
                permit = Some(acquired.context("Request limiter closed")?);
            }
            line = lines.next_line(), if permit.is_some() => {
                let Some(line) = line.context("Failed to read request")? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let Some(held) = permit.take() else { continue };
                summary.received += 1;

                let executor = executor.clone();
                let tx = tx.clone();
                let cancel = shutdown.child_token();
                tasks.spawn(async move {
                    let response = serve_one(&executor, &line, cancel).await;
                    // The writer only stops after every sender is gone.
                    let _ = tx.send(response).await;
                    drop(held);
                });
                let outstanding = max_pending - pending.available_permits();
                summary.peak_pending = summary.peak_pending.max(outstanding);
            }
            _ = shutdown.cancelled() => break,
        }
    }

    while let Some(joined) = tasks.join_next().await {
        reap(joined);
    }
    drop(tx);
    interrupt.abort();

    writer
        .await
        .context("Response writer panicked")?
        .context("Failed to write response")?;

    info!(
        event = "serve.finished",
        requests = summary.received,
        peak_pending = summary.peak_pending
    );
    METRICS.flush();
    Ok(summary)
}

fn reap(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        warn!(error = %err, "request task failed");
    }
}

async fn serve_one(executor: &Executor, line: &str, cancel: CancellationToken) -> String {
    let wire: WireRequest = match serde_json::from_str(line) {
        Ok(wire) => wire,
        Err(err) => {
            warn!(error = %err, "invalid request");
            return encode(&ServeError {
                id: request_id(line),
                error: format!("invalid request: {err}"),
            });
        }
    };

    let id = wire.id.clone();
    let request = wire.into_request(executor.policy());
    match executor.execute_cancellable(&request, cancel).await {
        Ok(result) => encode(&ServeResponse {
            id: id.as_deref(),
            result: &result,
        }),
        Err(Cancelled) => encode(&ServeError {
            id,
            error: Cancelled.to_string(),
        }),
    }
}

/// Best-effort id recovery from a request that failed to parse.
fn request_id(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("id")?.as_str().map(str::to_owned)
}

fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|err| {
        json!({ "error": format!("failed to encode response: {err}") }).to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn executor() -> Arc<Executor> {
        Arc::new(Executor::from_config(&EngineConfig::default()).unwrap())
    }

    async fn serve(input: &str) -> Vec<Value> {
        serve_with_limit(input, 16).await.1
    }

    async fn serve_with_limit(input: &str, max_pending: usize) -> (ServeSummary, Vec<Value>) {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let input = BufReader::new(input.as_bytes());
        let summary = cmd_serve(executor(), input, server, max_pending)
            .await
            .unwrap();

        let mut text = String::new();
        client.read_to_string(&mut text).await.unwrap();
        let responses = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        (summary, responses)
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codevibe.toml");
        std::fs::write(&path, "max_concurrent = 2\n[runner]\ninterpreter = \"python3.12\"\n")
            .unwrap();

        let cli = Cli::try_parse_from([
            "codevibe",
            "--config",
            path.to_str().unwrap(),
            "--max-concurrent",
            "6",
            "--rules",
            "/etc/codevibe/rules.toml",
            "rules",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();

        assert_eq!(config.max_concurrent, 6);
        assert_eq!(config.runner.interpreter, PathBuf::from("python3.12"));
        assert_eq!(
            config.rules_path,
            Some(PathBuf::from("/etc/codevibe/rules.toml"))
        );
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let cli = Cli::try_parse_from(["codevibe", "--max-concurrent", "0", "serve"]).unwrap();
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn test_run_limit_flags() {
        let cli = Cli::try_parse_from(["codevibe", "run", "-", "--timeout-ms", "2000"]).unwrap();
        match cli.command {
            Commands::Run { file, limits } => {
                assert_eq!(file, PathBuf::from("-"));
                assert_eq!(limits.overrides().timeout_ms, Some(2000));
                assert_eq!(limits.overrides().max_output_bytes, None);
            }
            _ => panic!("expected run command"),
        }
    }

    #[tokio::test]
    async fn test_read_source_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.py");
        std::fs::write(&path, "print(1)\n").unwrap();
        assert_eq!(read_source(&path).await.unwrap(), "print(1)\n");
        assert!(read_source(&dir.path().join("missing.py")).await.is_err());
    }

    #[tokio::test]
    async fn test_serve_echoes_id_with_result() {
        let responses = serve("{\"id\": \"req-1\", \"source\": \"import socket\"}\n").await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], "req-1");
        assert_eq!(responses[0]["status"], "violation");
        assert_eq!(responses[0]["violations"][0]["rule"], "import.socket");
    }

    #[tokio::test]
    async fn test_serve_reports_bad_requests_and_skips_blank_lines() {
        let input = "\n{\"id\": \"bad\", \"source\": \"x\", \"colour\": 1}\nnot json\n";
        let mut responses = serve(input).await;
        responses.sort_by_key(|r| r.get("id").is_none());

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], "bad");
        assert!(responses[0]["error"]
            .as_str()
            .unwrap()
            .starts_with("invalid request"));
        assert!(responses[1].get("id").is_none());
        assert!(responses[1]["error"].is_string());
    }

    #[tokio::test]
    async fn test_serve_runs_every_request() {
        let input: String = (0..5)
            .map(|i| format!("{{\"id\": \"{i}\", \"source\": \"eval('{i}')\"}}\n"))
            .collect();
        let responses = serve(&input).await;

        let mut ids: Vec<String> = responses
            .iter()
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4"]);
        assert!(responses.iter().all(|r| r["status"] == "violation"));
    }

    #[tokio::test]
    async fn test_serve_bounds_outstanding_requests() {
        let input: String = (0..40)
            .map(|i| format!("{{\"id\": \"{i}\", \"source\": \"import os\"}}\n"))
            .collect();
        let (summary, responses) = serve_with_limit(&input, 3).await;

        assert_eq!(summary.received, 40);
        assert!(summary.peak_pending >= 1);
        assert!(summary.peak_pending <= 3, "peak {}", summary.peak_pending);
        assert_eq!(responses.len(), 40);
    }
}
