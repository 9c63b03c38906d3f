//! Subscriber setup for embedders that don't bring their own.

use std::{fs::File, io::LineWriter, path::Path, sync::Mutex};

use anyhow::Context;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

const DEFAULT_STDERR_FILTER: &str = "info";
const DEFAULT_LOG_FILE_FILTER: &str = "info,piecework=debug";

#[derive(Debug, Default, Clone, Copy)]
pub struct InitLoggingOptions<'a> {
    /// Stderr directives used when RUST_LOG is not set.
    pub default_rust_log_value: Option<&'a str>,
    /// Appends a plain-text copy of the log here.
    pub log_file: Option<&'a Path>,
    pub log_file_rust_log: Option<&'a str>,
}

/// Changes stderr verbosity of the installed subscriber at runtime.
#[derive(Clone)]
pub struct LogFilterReloader {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogFilterReloader {
    pub fn set_stderr_filter(&self, directives: &str) -> anyhow::Result<()> {
        let filter = parse_filter(directives)?;
        self.handle
            .reload(filter)
            .context("subscriber is gone")?;
        tracing::info!(directives, "stderr log filter changed");
        Ok(())
    }
}

fn parse_filter(directives: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::builder()
        .parse(directives)
        .with_context(|| format!("invalid log filter {directives:?}"))
}

fn stderr_filter(default: Option<&str>) -> anyhow::Result<EnvFilter> {
    let default = default.unwrap_or(DEFAULT_STDERR_FILTER);
    EnvFilter::builder()
        .with_default_directive(
            default
                .parse()
                .with_context(|| format!("invalid default log directive {default:?}"))?,
        )
        .from_env()
        .context("invalid RUST_LOG value")
}

fn open_log_file(path: &Path) -> anyhow::Result<Mutex<LineWriter<File>>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("error opening log file {path:?}"))?;
    Ok(Mutex::new(LineWriter::new(file)))
}

/// Installs the global subscriber: stderr filtered by RUST_LOG, and an
/// optional log file with its own filter.
pub fn init_logging(opts: InitLoggingOptions<'_>) -> anyhow::Result<LogFilterReloader> {
    let (stderr_filter, handle) = reload::Layer::new(stderr_filter(opts.default_rust_log_value)?);
    let file_layer = match opts.log_file {
        Some(path) => Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(open_log_file(path)?)
                .with_filter(parse_filter(
                    opts.log_file_rust_log.unwrap_or(DEFAULT_LOG_FILE_FILTER),
                )?),
        ),
        None => None,
    };
    tracing_subscriber::registry()
        .with(stderr_filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .context("can't init logging")?;
    Ok(LogFilterReloader { handle })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_parse() {
        assert!(parse_filter(DEFAULT_LOG_FILE_FILTER).is_ok());
        assert!(parse_filter("piecework::disk=trace,warn").is_ok());
        assert!(parse_filter("piecework=notalevel").is_err());
        assert!(stderr_filter(Some("debug")).is_ok());
    }

    #[test]
    fn test_log_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("piecework.log");
        let _writer = open_log_file(&path).unwrap();
        assert!(path.exists());
        assert!(open_log_file(&dir.path().join("missing/dir.log")).is_err());
    }
}
