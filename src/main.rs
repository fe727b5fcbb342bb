//! policy-bridge CLI entry point.
//!
//! Loads a compiled policy module and evaluates authorization inputs
//! against it from the command line.

use std::io::{self, BufRead, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use policy_bridge_common::{ConfigFile, LoggingConfig};
use policy_bridge_runtime::{EngineStatus, PolicyEngine};

#[derive(Parser)]
#[command(
    name = "policy-bridge",
    version,
    about = "Evaluate inputs against a WebAssembly policy module"
)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "POLICY_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Compiled policy module; overrides the configuration file.
    #[arg(long, env = "POLICY_WASM_PATH")]
    artifact: Option<PathBuf>,

    /// Number of pooled instances.
    #[arg(long)]
    pool_size: Option<usize>,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate one JSON input (argument or stdin).
    Eval {
        /// Input document; read from stdin when omitted.
        input: Option<String>,
    },
    /// Show engine status and the module's exports.
    Describe,
    /// Run the built-in role checks.
    Selftest,
    /// Evaluate newline-delimited JSON inputs concurrently.
    Batch {
        /// Input file; read from stdin when omitted.
        file: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct SelftestCase {
    description: &'static str,
    input: Value,
    expected: bool,
    allowed: bool,
    tier: Option<String>,
    passed: bool,
}

#[derive(Serialize)]
struct BatchLine {
    line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => ConfigFile::default(),
    };
    if let Some(path) = &cli.artifact {
        file.bridge.artifact.path = Some(path.clone());
    }
    if let Some(size) = cli.pool_size {
        file.bridge.pool.size = size;
    }
    file.logging.json |= cli.log_json;

    init_tracing(&file.logging);
    file.bridge.validate().context("Invalid configuration")?;

    let engine = Arc::new(PolicyEngine::new(file.bridge));
    let status = engine.initialize();
    match status {
        EngineStatus::Ready => info!("Policy module loaded"),
        _ => warn!(
            status = %status,
            reason = engine.degraded_reason().as_deref().unwrap_or("unknown"),
            "Serving fallback decisions only"
        ),
    }

    let code = match cli.command {
        Command::Eval { input } => eval(&engine, input).await?,
        Command::Describe => describe(&engine)?,
        Command::Selftest => selftest(&engine).await?,
        Command::Batch { file } => batch(&engine, file).await?,
    };

    engine.shutdown();
    Ok(code)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);

    // Results go to stdout; logs stay on stderr.
    if logging.json {
        registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(io::stderr)).init();
    }
}

async fn eval(engine: &Arc<PolicyEngine>, input: Option<String>) -> anyhow::Result<ExitCode> {
    let text = match input {
        Some(text) => text,
        None => {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read input from stdin")?;
            text
        }
    };
    let input: Value = serde_json::from_str(&text).context("Input is not valid JSON")?;

    match engine.evaluate_blocking(input).await {
        Ok(decision) => {
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(if decision.allowed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Err(e) => {
            println!("{}", json!({"allowed": false, "error": e.to_string()}));
            Ok(ExitCode::from(2))
        }
    }
}

fn describe(engine: &PolicyEngine) -> anyhow::Result<ExitCode> {
    let report = json!({
        "status": engine.status(),
        "degraded_reason": engine.degraded_reason(),
        "module": engine.describe(),
        "exports": engine.describe_exports(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

async fn selftest(engine: &Arc<PolicyEngine>) -> anyhow::Result<ExitCode> {
    let cases = [
        ("Admin should be allowed", json!({"user": {"role": "admin"}}), true),
        ("User should be denied", json!({"user": {"role": "user"}}), false),
        ("Guest should be denied", json!({"user": {"role": "guest"}}), false),
        ("No role should be denied", json!({"user": {}}), false),
        ("No user should be denied", json!({}), false),
    ];

    let mut results = Vec::with_capacity(cases.len());
    for (description, input, expected) in cases {
        let outcome = engine.evaluate_blocking(input.clone()).await;
        let (allowed, tier) = match &outcome {
            Ok(decision) => (decision.allowed(), Some(decision.tier().to_string())),
            Err(_) => (false, None),
        };
        results.push(SelftestCase {
            description,
            input,
            expected,
            allowed,
            tier,
            passed: allowed == expected,
        });
    }

    let passed = results.iter().filter(|case| case.passed).count();
    let report = json!({
        "status": engine.status(),
        "passed": passed,
        "total": results.len(),
        "cases": results,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if passed == results.len() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn batch(engine: &Arc<PolicyEngine>, file: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let reader: Box<dyn BufRead> = match &file {
        Some(path) => Box::new(io::BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("Failed to open '{}'", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    let mut tasks = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read batch input")?;
        if line.trim().is_empty() {
            continue;
        }
        let number = index + 1;
        let engine = Arc::clone(engine);
        tasks.push(tokio::spawn(async move {
            match serde_json::from_str::<Value>(&line) {
                Ok(input) => match engine.evaluate_blocking(input).await {
                    Ok(decision) => BatchLine {
                        line: number,
                        allowed: Some(decision.allowed()),
                        tier: Some(decision.tier().to_string()),
                        error: None,
                    },
                    Err(e) => BatchLine {
                        line: number,
                        allowed: Some(false),
                        tier: None,
                        error: Some(e.to_string()),
                    },
                },
                Err(e) => BatchLine {
                    line: number,
                    allowed: None,
                    tier: None,
                    error: Some(format!("invalid JSON: {e}")),
                },
            }
        }));
    }

    let mut failures = 0usize;
    for task in tasks {
        let line = task.await.context("Batch task failed")?;
        if line.error.is_some() {
            failures += 1;
        }
        println!("{}", serde_json::to_string(&line)?);
    }

    info!(failures, "Batch complete");
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
