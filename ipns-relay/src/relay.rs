//! Wires the store, coordinator and intake surfaces together.

use std::sync::Arc;

use anyhow::Result;
use ipns_publisher::{Coordinator, Ingest, KuboStore, RecordStore, Validator};

use crate::{config::Config, feed::FeedWatcher, server::BroadcastServer};

/// A running relay: the HTTP endpoint and the feed watcher share one
/// coordinator, so updates from both are coalesced per key.
pub struct IpnsRelay {
    ingest: Ingest,
    server: Option<BroadcastServer>,
    feed: Option<FeedWatcher>,
}

impl IpnsRelay {
    /// Start a relay publishing through the Kubo API configured in `config`.
    pub async fn start(config: Config) -> Result<Self> {
        let store = Arc::new(KuboStore::new(config.kubo_api_url.clone()));
        tracing::info!("Publishing through Kubo at {}", config.kubo_api_url);
        Self::start_with_store(config, store).await
    }

    /// Start a relay publishing to `store`.
    pub async fn start_with_store(config: Config, store: Arc<dyn RecordStore>) -> Result<Self> {
        let coordinator = Coordinator::new_with_settings(store, config.coordinator_settings());
        let ingest =
            Ingest::new_with_settings(coordinator, Validator::default(), config.ingest_settings());

        let server = if config.server_enabled {
            Some(
                BroadcastServer::builder(ingest.clone())
                    .listen_socket(config.listen_socket)
                    .auth_secret(config.auth_secret.clone())
                    .run()
                    .await?,
            )
        } else {
            None
        };

        let feed = if config.feed_enabled {
            let watcher = FeedWatcher::start_with_delay(
                &config.feed_endpoint,
                ingest.clone(),
                config.reconnect_delay,
            )?;
            tracing::info!("Watching feed {}", watcher.url());
            Some(watcher)
        } else {
            None
        };

        if server.is_none() && feed.is_none() {
            tracing::warn!("Both the broadcast server and the feed are disabled.");
        }

        Ok(Self {
            ingest,
            server,
            feed,
        })
    }

    pub fn ingest(&self) -> &Ingest {
        &self.ingest
    }

    pub fn coordinator(&self) -> &Coordinator {
        self.ingest.coordinator()
    }

    pub fn server(&self) -> Option<&BroadcastServer> {
        self.server.as_ref()
    }

    pub fn feed(&self) -> Option<&FeedWatcher> {
        self.feed.as_ref()
    }

    /// Runs until ctrl-c.
    pub async fn run_until_done(self) -> Result<()> {
        tokio::signal::ctrl_c().await?;
        tracing::info!(
            "Shutting down, {} pending and {} running writes are abandoned.",
            self.coordinator().pending_len(),
            self.coordinator().running_len()
        );
        self.shutdown();
        Ok(())
    }

    /// Stop both intake surfaces and the workers.
    pub fn shutdown(self) {
        if let Some(server) = &self.server {
            server.shutdown();
        }
        drop(self);
    }
}
