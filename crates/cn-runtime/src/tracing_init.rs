use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use cn_config::{LogFormat, LoggingConfig};

/// Initialise the `tracing` subscriber stack from [`LoggingConfig`].
///
/// The stack is deliberately thin: the stock compact formatter for plain
/// output, the stock JSON formatter for structured output, and an optional
/// non-blocking file layer next to stderr. The `domain` field injected by
/// the `cn_*` macros is rendered as an ordinary key=value pair, so plain
/// output stays greppable (`domain=rule`) and JSON consumers filter on the
/// key directly.
///
/// Returns an optional [`WorkerGuard`] that **must** be held until the
/// process exits — dropping it flushes and closes the file writer.
///
/// Precedence: `RUST_LOG` overrides all config-driven directives.
pub fn init_tracing(config: &LoggingConfig, base_dir: &Path) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;
    let file = open_file_writer(config, base_dir)?;

    match (config.format, file) {
        (LogFormat::Json, Some((writer, guard))) => {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .json()
                        .with_target(false)
                        .with_writer(std::io::stderr)
                        .with_filter(filter),
                )
                .with(fmt::layer().json().with_target(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        (LogFormat::Json, None) => {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .json()
                        .with_target(false)
                        .with_writer(std::io::stderr)
                        .with_filter(filter),
                )
                .init();
            Ok(None)
        }
        (LogFormat::Plain, Some((writer, guard))) => {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .compact()
                        .with_target(false)
                        .with_writer(std::io::stderr)
                        .with_filter(filter),
                )
                .with(
                    fmt::layer()
                        .compact()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(Some(guard))
        }
        (LogFormat::Plain, None) => {
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .compact()
                        .with_target(false)
                        .with_writer(std::io::stderr)
                        .with_filter(filter),
                )
                .init();
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Pieces
// ---------------------------------------------------------------------------

/// Global level directive plus per-module overrides, unless `RUST_LOG` is
/// set (which wins outright).
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if std::env::var("RUST_LOG").is_ok() {
        return Ok(EnvFilter::from_default_env());
    }
    let directives = std::iter::once(config.level.clone())
        .chain(
            config
                .modules
                .iter()
                .map(|(module, level)| format!("{module}={level}")),
        )
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::try_new(&directives)
        .map_err(|e| anyhow::anyhow!("invalid log filter {directives:?}: {e}"))
}

/// Open the configured log file (relative paths resolve against the config
/// directory) behind a non-blocking writer.
fn open_file_writer(
    config: &LoggingConfig,
    base_dir: &Path,
) -> Result<Option<(NonBlocking, WorkerGuard)>> {
    let Some(ref file_path) = config.file else {
        return Ok(None);
    };
    let resolved: PathBuf = if file_path.is_relative() {
        base_dir.join(file_path)
    } else {
        file_path.clone()
    };
    let dir = resolved
        .parent()
        .ok_or_else(|| anyhow::anyhow!("log file path has no parent directory"))?;
    std::fs::create_dir_all(dir)?;
    let file_name = resolved
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("log file path has no file name"))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(Some(tracing_appender::non_blocking(appender)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(level: &str, modules: &[(&str, &str)]) -> LoggingConfig {
        LoggingConfig {
            level: level.to_string(),
            modules: modules
                .iter()
                .map(|(m, l)| (m.to_string(), l.to_string()))
                .collect(),
            file: None,
            format: LogFormat::Plain,
        }
    }

    #[test]
    fn filter_combines_level_and_modules() {
        let mut modules = HashMap::new();
        modules.insert("cn_runtime::reactor".to_string(), "debug".to_string());
        let cfg = LoggingConfig {
            level: "info".to_string(),
            modules,
            file: None,
            format: LogFormat::Plain,
        };
        // EnvFilter has no equality; building without error is the contract.
        build_filter(&cfg).unwrap();
    }

    #[test]
    fn filter_rejects_garbage_directives() {
        assert!(build_filter(&config("not a level!!", &[])).is_err());
    }

    #[test]
    fn file_writer_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LoggingConfig {
            file: Some(PathBuf::from("logs/node.log")),
            ..config("info", &[])
        };
        let writer = open_file_writer(&cfg, dir.path()).unwrap();
        assert!(writer.is_some());
        assert!(dir.path().join("logs").is_dir());
    }

    #[test]
    fn no_file_configured_means_no_writer() {
        let dir = tempfile::tempdir().unwrap();
        assert!(open_file_writer(&config("info", &[]), dir.path())
            .unwrap()
            .is_none());
    }
}
