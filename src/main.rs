use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pgspy::config::DEFAULT_MAX_MESSAGE_LEN;
use pgspy::{FramingErrorPolicy, Proxy, ProxyConfig, QueryWatcher, consumer_fn};

#[derive(Parser, Debug)]
#[command(name = "pgspy")]
#[command(about = "Transparent PostgreSQL proxy that logs the wire protocol passing through it")]
struct Cli {
    /// Address clients connect to.
    #[arg(short, long, env = "PGSPY_LISTEN", default_value = "127.0.0.1:5543")]
    listen: String,

    /// PostgreSQL server to forward to.
    #[arg(short, long, env = "PGSPY_UPSTREAM", default_value = "127.0.0.1:5432")]
    upstream: String,

    /// Largest single socket read, in bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    read_buffer_size: usize,

    /// Largest payload a message may declare before the stream counts as corrupt.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_LEN)]
    max_message_len: usize,

    /// Keep proxying a connection whose stream can no longer be decoded.
    #[arg(long)]
    passthrough_on_framing_error: bool,

    /// Only log connections, not individual queries.
    #[arg(long)]
    quiet_queries: bool,
}

impl Cli {
    fn to_config(&self) -> ProxyConfig {
        ProxyConfig {
            read_buffer_size: self.read_buffer_size,
            max_message_len: self.max_message_len,
            on_framing_error: if self.passthrough_on_framing_error {
                FramingErrorPolicy::Passthrough
            } else {
                FramingErrorPolicy::Teardown
            },
            ..ProxyConfig::new(&self.listen, &self.upstream)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let proxy = Proxy::bind(cli.to_config())
        .await
        .with_context(|| format!("starting proxy on {}", cli.listen))?;

    let served = if cli.quiet_queries {
        tokio::select! {
            res = proxy.serve(|_| consumer_fn(|_| {})) => res,
            _ = tokio::signal::ctrl_c() => Ok(()),
        }
    } else {
        tokio::select! {
            res = proxy.serve(QueryWatcher::new) => res,
            _ = tokio::signal::ctrl_c() => Ok(()),
        }
    };
    served.context("accept loop failed")?;

    tracing::info!("shutting down");
    Ok(())
}
