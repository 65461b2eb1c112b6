//! Daemon configuration: environment variables with a `SILO_` prefix, with
//! CLI flag overrides. Parsing fails fast (clap exits the process) before
//! any socket or KV file is opened.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

fn default_async_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .div_ceil(2)
        .max(2)
}

#[derive(Parser, Debug, Clone)]
#[command(name = "siloed", about = "Binary repository curation daemon")]
pub struct Config {
    /// Root directory for the pool, repositories, and KV stores.
    #[arg(long, env = "SILO_BASE_DIR")]
    pub base_dir: PathBuf,

    /// Address the HTTP façade binds to.
    #[arg(long, env = "SILO_BIND_ADDR", default_value = "0.0.0.0:7420")]
    pub bind_addr: SocketAddr,

    /// Shared-secret bearer token. If unset, the façade is unauthenticated.
    #[arg(long, env = "SILO_API_TOKEN")]
    pub api_token: Option<String>,

    /// Number of async scheduler workers.
    #[arg(long, env = "SILO_ASYNC_WORKERS", default_value_t = default_async_workers())]
    pub async_workers: usize,

    /// `tracing_subscriber::EnvFilter` directive.
    #[arg(long, env = "SILO_LOG", default_value = "info")]
    pub log: String,
}

impl Config {
    /// Parse from argv + environment, exiting the process on failure.
    pub fn load() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_async_workers_is_at_least_two() {
        assert!(default_async_workers() >= 2);
    }

    #[test]
    fn parses_required_flags() {
        let config = Config::parse_from(["siloed", "--base-dir", "/tmp/silo"]);
        assert_eq!(config.base_dir, PathBuf::from("/tmp/silo"));
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:7420");
        assert!(config.api_token.is_none());
        assert_eq!(config.log, "info");
    }

    #[test]
    fn rejects_unparsable_bind_addr() {
        let err = Config::try_parse_from(["siloed", "--base-dir", "/tmp/silo", "--bind-addr", "not-an-addr"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
