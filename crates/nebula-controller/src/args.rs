use std::net::SocketAddr;

use clap::Parser;
use nebula_common::telemetry::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "nebula-controller", about = "Keeps pipelines and servers in sync with the scheduler")]
pub struct Args {
    #[arg(long, env = "NEBULA_ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    /// Namespaces to manage, comma separated.
    #[arg(long, env = "NEBULA_NAMESPACES", value_delimiter = ',', default_value = "default")]
    pub namespaces: Vec<String>,

    /// Scheduler base URL; `{namespace}` is substituted per namespace.
    #[arg(
        long,
        env = "NEBULA_SCHEDULER_URL_TEMPLATE",
        default_value = "http://nebula-scheduler.{namespace}:9004"
    )]
    pub scheduler_url_template: String,

    /// Name this controller subscribes to status streams with.
    #[arg(long, env = "NEBULA_SUBSCRIBER_NAME", default_value = "nebula-controller")]
    pub subscriber_name: String,

    #[arg(long, env = "NEBULA_ADMIN_ADDR", default_value = "0.0.0.0:8080")]
    pub admin_addr: SocketAddr,

    #[arg(long, env = "NEBULA_RPC_MAX_ATTEMPTS", default_value_t = 5)]
    pub rpc_max_attempts: u32,

    #[arg(long, env = "NEBULA_RPC_INITIAL_BACKOFF_MS", default_value_t = 100)]
    pub rpc_initial_backoff_ms: u64,

    #[arg(long, env = "NEBULA_RPC_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "NEBULA_CONFLICT_RETRY_STEPS", default_value_t = 5)]
    pub conflict_retry_steps: u32,

    /// Pause before re-subscribing after a stream ends or fails.
    #[arg(long, env = "NEBULA_RECONNECT_DELAY_MS", default_value_t = 2000)]
    pub reconnect_delay_ms: u64,

    /// Log output format: text or json.
    #[arg(long, env = "NEBULA_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// OTLP/HTTP collector base URL. Tracing export is off when unset.
    #[arg(long, env = "NEBULA_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Bearer token for the OTLP collector.
    #[arg(long, env = "NEBULA_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["nebula-controller"]);
        assert_eq!(args.namespaces, vec!["default".to_string()]);
        assert_eq!(args.log_format, LogFormat::Text);
        assert_eq!(args.rpc_max_attempts, 5);
        assert!(args.otlp_endpoint.is_none());
    }

    #[test]
    fn test_namespace_list() {
        let args = Args::parse_from([
            "nebula-controller",
            "--namespaces",
            "seldon,models",
            "--log-format",
            "json",
        ]);
        assert_eq!(args.namespaces, vec!["seldon".to_string(), "models".to_string()]);
        assert_eq!(args.log_format, LogFormat::Json);
    }
}
