// packages/engine/src/main.rs
//! Kernel Evaluation Engine
//!
//! Starts a pool of kernels, evaluates each expression given on the command
//! line (or one per line on stdin), prints the results in input order and
//! shuts the pool down.
//!
//! ```text
//! kernel-eval-engine [--config FILE] [EXPR ...]
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use kernel_eval_engine::observability::{init_metrics, init_tracing};
use kernel_eval_engine::{BuildInfo, EngineConfig, Expr, KernelPool};
use std::io::BufRead;
use std::path::PathBuf;
use tracing::{error, info};

const LONG_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_HASH"), ")");

/// Evaluate expressions on a pool of kernels
#[derive(Parser, Debug)]
#[command(name = "kernel-eval-engine")]
#[command(version, long_version = LONG_VERSION, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Expressions in input form; read one per line from stdin when omitted
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    exprs: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = EngineConfig::load_from(args.config.as_deref())
        .context("failed to load configuration")?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.logging)?;
    init_metrics(&config.metrics)?;

    info!("Starting Kernel Evaluation Engine {}", BuildInfo::current());
    info!("Configuration loaded: {:?}", config);

    let exprs = if args.exprs.is_empty() {
        std::io::stdin()
            .lock()
            .lines()
            .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
            .collect::<std::io::Result<Vec<_>>>()
            .context("failed to read expressions from stdin")?
    } else {
        args.exprs
    };

    let pool = KernelPool::from_config(&config)
        .await
        .context("failed to start kernel pool")?;

    // Strings are parsed by the kernel as input source
    let results = pool
        .evaluate_many(exprs.iter().map(|source| Expr::string(source.as_str())))
        .await;

    let mut failed = 0;
    for (source, result) in exprs.iter().zip(results) {
        match result {
            Ok(value) => println!("{}", value),
            Err(e) => {
                failed += 1;
                error!("{}: {}", source, e);
                println!("$Failed");
            }
        }
    }

    if let Err(e) = pool.terminate().await {
        error!("Kernel pool did not shut down cleanly: {}", e);
    }

    if failed > 0 {
        bail!("{} of {} evaluations failed", failed, exprs.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_config_and_expressions() {
        let args = Args::try_parse_from([
            "kernel-eval-engine",
            "--config",
            "engine.toml",
            "Range[3]",
            "-1",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("engine.toml")));
        assert_eq!(args.exprs, vec!["Range[3]", "-1"]);

        let args = Args::try_parse_from(["kernel-eval-engine", "-c", "a.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("a.toml")));
        assert!(args.exprs.is_empty());
    }
}
