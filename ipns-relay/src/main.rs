use std::{net::SocketAddr, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use ipns_relay::{tracing::init_tracing, Config, IpnsRelay};
use url::Url;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to a TOML config file. See `config.sample.toml`.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Socket the broadcast server listens on.
    #[clap(long, env = "LISTEN_SOCKET")]
    listen: Option<SocketAddr>,
    /// Required `Authorization` header value for `/broadcast`.
    #[clap(long, env = "AUTH_SECRET", hide_env_values = true)]
    auth_secret: Option<String>,
    /// Base url of the name feed, e.g. `wss://name.web3.storage`.
    #[clap(long, env = "ENDPOINT")]
    endpoint: Option<Url>,
    /// Kubo RPC API used to put records.
    #[clap(long, env = "KUBO_API_URL")]
    kubo_api_url: Option<Url>,
    /// Do not watch the name feed.
    #[clap(long)]
    no_feed: bool,
    /// Do not serve `/broadcast`.
    #[clap(long)]
    no_server: bool,
    /// [tracing_subscriber::EnvFilter]
    #[clap(short, long)]
    tracing_env_filter: Option<String>,
    /// Print the sample config and exit.
    #[clap(long)]
    print_sample_config: bool,
}

impl Cli {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(listen) = self.listen {
            config.listen_socket = listen;
        }
        if let Some(secret) = &self.auth_secret {
            config.auth_secret = Some(secret.clone()).filter(|secret| !secret.is_empty());
        }
        if let Some(endpoint) = &self.endpoint {
            config.feed_endpoint = endpoint.clone();
        }
        if let Some(url) = &self.kubo_api_url {
            config.kubo_api_url = url.clone();
        }
        if self.no_feed {
            config.feed_enabled = false;
        }
        if self.no_server {
            config.server_enabled = false;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    if args.print_sample_config {
        print!("{}", ipns_relay::config::SAMPLE_CONFIG);
        return Ok(());
    }

    let config = args.config()?;
    init_tracing(config.logging.as_ref(), args.tracing_env_filter.as_deref())?;

    let relay = IpnsRelay::start(config).await?;
    relay.run_until_done().await?;

    Ok(())
}
