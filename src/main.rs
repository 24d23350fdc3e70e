use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::admission::{AdmissionGate, AdmissionReport};
use turnstile::config::TurnstileConfig;
use turnstile::identity::{fingerprint, RequestMetadata};
use turnstile::ledger::{compute_cost, token_count, CostLedger, PricingTable, Usage};
use turnstile::ratelimit::{is_valid_cost, FailoverLimiter};
use turnstile::store;

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Token bucket admission control")]
struct Cli {
    /// Configuration file; TURNSTILE__SECTION__FIELD variables override it
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Charge a limiter key and report each decision
    Check {
        #[arg(long)]
        key: String,
        #[arg(long, default_value_t = 1.0)]
        cost: f64,
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Resolve a request's limiter keys and run it through admission
    Resolve {
        #[arg(long)]
        credential: Option<String>,
        #[arg(long)]
        peer: Option<IpAddr>,
        /// Request header as NAME=VALUE; may be repeated
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },
    /// Cost ledger operations
    Cost {
        #[command(subcommand)]
        action: CostAction,
    },
}

#[derive(Debug, Subcommand)]
enum CostAction {
    Add {
        #[arg(long)]
        key: String,
        #[arg(long)]
        amount: f64,
    },
    Get {
        #[arg(long)]
        key: String,
    },
    Reset {
        #[arg(long)]
        key: String,
    },
    /// Estimate the cost of a model call from its token usage
    Estimate {
        #[arg(long)]
        model: String,
        #[arg(long, default_value_t = 0)]
        prompt_tokens: u64,
        #[arg(long, default_value_t = 0)]
        completion_tokens: u64,
        /// YAML pricing table keyed by model name
        #[arg(long)]
        pricing: Option<String>,
    },
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got {:?}", raw)),
    }
}

#[derive(Debug, Serialize)]
struct CheckLine {
    key_fingerprint: String,
    attempt: u32,
    allowed: bool,
    status: u16,
    backend: String,
}

#[derive(Debug, Serialize)]
struct ResolveLine {
    keys: Vec<String>,
    #[serde(flatten)]
    decision: AdmissionReport,
}

#[derive(Debug, Serialize)]
struct CostLine {
    key_fingerprint: String,
    total: f64,
}

#[derive(Debug, Serialize)]
struct EstimateLine {
    model: String,
    tokens: u64,
    cost: f64,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn emit<T: Serialize>(line: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(line)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(cli.config.as_deref()).context("loading configuration")?;
    info!(
        capacity = config.limiter.capacity,
        refill_rate = config.limiter.refill_rate,
        backend = config.limiter.backend_url.is_some(),
        "Configuration loaded"
    );

    // One client for every component that talks to the shared store.
    let handle = config
        .limiter
        .backend_url
        .as_deref()
        .map(store::connect)
        .transpose()
        .context("opening backend store")?;

    match cli.command {
        Command::Check { key, cost, repeat } => {
            if !is_valid_cost(cost) {
                return Err(anyhow!("cost must be finite and non-negative"));
            }
            let limiter = FailoverLimiter::from_config_with_store(&config.limiter, handle.as_ref())?;
            for attempt in 1..=repeat {
                let allowed = limiter.allow(&key, cost).await;
                emit(&CheckLine {
                    key_fingerprint: fingerprint(&key),
                    attempt,
                    allowed,
                    status: if allowed { 200 } else { 429 },
                    backend: limiter.active_backend().to_string(),
                })?;
            }
        }
        Command::Resolve {
            credential,
            peer,
            headers,
        } => {
            let gate = AdmissionGate::from_config_with_store(&config, handle.as_ref())?;
            let mut request = RequestMetadata::new();
            if let Some(credential) = credential {
                request = request.with_credential(credential);
            }
            if let Some(peer) = peer {
                request = request.with_peer(peer);
            }
            for (name, value) in headers {
                request = request.with_header(name, value);
            }

            let keys = gate
                .resolver()
                .resolve_all(&request)
                .iter()
                .map(|key| key.redacted())
                .collect();
            let decision = gate.check(&request).await;
            emit(&ResolveLine {
                keys,
                decision: AdmissionReport::from(&decision),
            })?;
        }
        Command::Cost { action } => {
            let ledger = CostLedger::from_config_with_store(
                &config.ledger,
                handle.as_ref(),
                Duration::from_millis(config.limiter.backend_timeout_ms),
            )?;
            match action {
                CostAction::Add { key, amount } => {
                    let total = ledger.add_cost(&key, amount).await?;
                    emit(&CostLine {
                        key_fingerprint: fingerprint(&key),
                        total,
                    })?;
                }
                CostAction::Get { key } => {
                    let total = ledger.get_cost(&key).await;
                    emit(&CostLine {
                        key_fingerprint: fingerprint(&key),
                        total,
                    })?;
                }
                CostAction::Reset { key } => {
                    ledger.reset(&key).await;
                    emit(&CostLine {
                        key_fingerprint: fingerprint(&key),
                        total: 0.0,
                    })?;
                }
                CostAction::Estimate {
                    model,
                    prompt_tokens,
                    completion_tokens,
                    pricing,
                } => {
                    let table = match pricing {
                        Some(path) => PricingTable::from_file(&path)
                            .with_context(|| format!("loading pricing table {}", path))?,
                        None => PricingTable::new(),
                    };
                    let usage = Usage::new(prompt_tokens, completion_tokens);
                    emit(&EstimateLine {
                        cost: compute_cost(&model, &usage, &table),
                        tokens: token_count(&usage),
                        model,
                    })?;
                }
            }
        }
    }

    Ok(())
}
