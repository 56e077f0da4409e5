// Component assembly and live reconfiguration.
//
// Validation runs over the whole config before anything is applied, so a
// failed reload leaves the previous configuration in force. Components
// whose settings cannot change in place (persister, listeners) are
// respawned against the same channels.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use carbond_cache::{Cache, CarbonlinkListener, CarbonlinkSettings};
use carbond_config::Config;
use carbond_persister::{respawn, Persister, PersisterSettings};
use carbond_receiver::{Protocol, Receiver, ReceiverSettings};
use tracing::{info, warn};

/// The assembled daemon.
pub struct App {
    cache: Cache,
    persister: Option<Persister>,
    tcp: Option<Receiver>,
    udp: Option<Receiver>,
    pickle: Option<Receiver>,
    carbonlink: Option<CarbonlinkListener>,
    applied: Option<Config>,
}

impl App {
    pub fn new() -> Self {
        Self {
            cache: Cache::new(),
            persister: None,
            tcp: None,
            udp: None,
            pickle: None,
            carbonlink: None,
            applied: None,
        }
    }

    /// Start the cache worker. Call once, before the first
    /// [`configure`](App::configure).
    pub fn start(&self) {
        self.cache.start();
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().map(Receiver::addr)
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().map(Receiver::addr)
    }

    pub fn pickle_addr(&self) -> Option<SocketAddr> {
        self.pickle.as_ref().map(Receiver::addr)
    }

    pub fn carbonlink_addr(&self) -> Option<SocketAddr> {
        self.carbonlink.as_ref().map(CarbonlinkListener::addr)
    }

    /// Validate, then apply a configuration. Safe to call repeatedly; only
    /// components whose settings actually changed are touched.
    pub async fn configure(&mut self, config: Config) -> Result<()> {
        let mut config = config;
        config.common.graph_prefix = expand_graph_prefix(&config.common.graph_prefix);
        config.validate().context("configuration rejected")?;

        self.apply_cache(&config).await;
        self.apply_persister(&config).await?;
        self.apply_receivers(&config).await?;
        self.apply_carbonlink(&config).await?;

        self.applied = Some(config);
        Ok(())
    }

    async fn apply_cache(&self, config: &Config) {
        let applied = self
            .cache
            .edit_settings(|s| {
                s.graph_prefix = config.common.graph_prefix.clone();
                s.max_size = config.cache.max_size;
                s.input_capacity = config.cache.input_buffer;
                s.output_capacity = config.cache.output_buffer;
            })
            .await;
        if applied.is_none() {
            warn!("cache settings not applied, previous settings stay in force");
        }
    }

    async fn apply_persister(&mut self, config: &Config) -> Result<()> {
        let settings = PersisterSettings {
            enabled: config.whisper.enabled,
            graph_prefix: config.common.graph_prefix.clone(),
            root_path: config.whisper.data_dir.clone(),
            workers: config.whisper.workers,
            max_updates_per_second: config.whisper.max_updates_per_second,
            schemas_file: config.whisper.schemas_file.clone(),
            aggregation_file: (!config.whisper.aggregation_file.is_empty())
                .then(|| PathBuf::from(&config.whisper.aggregation_file)),
        };

        self.persister = respawn(
            self.persister.take(),
            settings,
            self.cache.output(),
            self.cache.input(),
        )
        .await
        .context("persister start failed")?;
        Ok(())
    }

    async fn apply_receivers(&mut self, config: &Config) -> Result<()> {
        let settings = ReceiverSettings {
            graph_prefix: config.common.graph_prefix.clone(),
            log_incomplete: config.udp.log_incomplete,
        };

        let previous = self.applied.as_ref();

        let tcp_changed = previous.map_or(true, |p| {
            p.tcp != config.tcp || p.common.graph_prefix != config.common.graph_prefix
        });
        if tcp_changed {
            if let Some(receiver) = self.tcp.take() {
                receiver.stop().await;
            }
            if config.tcp.enabled {
                self.tcp = Some(
                    Receiver::listen(
                        Protocol::Tcp,
                        config.tcp_addr()?,
                        self.cache.input(),
                        settings.clone(),
                    )
                    .await
                    .context("tcp listener failed")?,
                );
            }
        }

        let udp_changed = previous.map_or(true, |p| {
            p.udp != config.udp || p.common.graph_prefix != config.common.graph_prefix
        });
        if udp_changed {
            if let Some(receiver) = self.udp.take() {
                receiver.stop().await;
            }
            if config.udp.enabled {
                self.udp = Some(
                    Receiver::listen(
                        Protocol::Udp,
                        config.udp_addr()?,
                        self.cache.input(),
                        settings.clone(),
                    )
                    .await
                    .context("udp listener failed")?,
                );
            }
        }

        let pickle_changed = previous.map_or(true, |p| {
            p.pickle != config.pickle || p.common.graph_prefix != config.common.graph_prefix
        });
        if pickle_changed {
            if let Some(receiver) = self.pickle.take() {
                receiver.stop().await;
            }
            if config.pickle.enabled {
                self.pickle = Some(
                    Receiver::listen(
                        Protocol::Pickle,
                        config.pickle_addr()?,
                        self.cache.input(),
                        settings,
                    )
                    .await
                    .context("pickle listener failed")?,
                );
            }
        }

        Ok(())
    }

    async fn apply_carbonlink(&mut self, config: &Config) -> Result<()> {
        let changed = self
            .applied
            .as_ref()
            .map_or(true, |p| p.carbonlink != config.carbonlink);
        if !changed {
            return Ok(());
        }

        if let Some(listener) = self.carbonlink.take() {
            listener.stop().await;
        }
        if config.carbonlink.enabled {
            self.carbonlink = Some(
                CarbonlinkListener::listen(
                    config.carbonlink_addr()?,
                    self.cache.query_sender(),
                    CarbonlinkSettings {
                        read_timeout: config.carbonlink.read_timeout(),
                        query_timeout: config.carbonlink.query_timeout(),
                    },
                )
                .await
                .context("carbonlink listener failed")?,
            );
        }
        Ok(())
    }

    /// Orderly shutdown: stop taking input, then the cache worker, then
    /// let the persister drain its lanes. Unpersisted samples are lost by
    /// design.
    pub async fn shutdown(&mut self) {
        for receiver in [self.tcp.take(), self.udp.take(), self.pickle.take()]
            .into_iter()
            .flatten()
        {
            receiver.stop().await;
        }
        if let Some(listener) = self.carbonlink.take() {
            listener.stop().await;
        }

        self.cache.stop().await;

        if let Some(persister) = self.persister.take() {
            persister.stop().await;
        }
        info!("carbond stopped");
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// `{host}` -> local hostname with dots flattened, as the metric tree
/// expects.
fn expand_graph_prefix(prefix: &str) -> String {
    let hostname = gethostname::gethostname();
    let hostname = hostname.to_string_lossy();
    let host = if hostname.is_empty() {
        "localhost".to_string()
    } else {
        hostname.replace('.', "_")
    };
    prefix.replace("{host}", &host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.common.graph_prefix = "carbon.".to_string();
        config.whisper.enabled = false;
        config.tcp.enabled = false;
        config.udp.enabled = false;
        config.pickle.enabled = false;
        config.carbonlink.enabled = false;
        config
    }

    #[test]
    fn graph_prefix_expansion_replaces_host() {
        let expanded = expand_graph_prefix("carbon.agents.{host}.");
        assert!(!expanded.contains("{host}"));
        assert!(expanded.starts_with("carbon.agents."));
        assert!(expanded.ends_with('.'));

        // The hostname's own dots are flattened to keep the tree depth.
        let host_part = expanded
            .trim_start_matches("carbon.agents.")
            .trim_end_matches('.');
        assert!(!host_part.contains('.'));

        assert_eq!(expand_graph_prefix("carbon."), "carbon.");
    }

    #[tokio::test]
    async fn configure_starts_and_respawns_listeners() {
        let mut app = App::new();
        app.start();

        let mut config = quiet_config();
        app.configure(config.clone()).await.unwrap();
        assert!(app.tcp_addr().is_none());

        config.tcp.enabled = true;
        config.tcp.listen = "127.0.0.1:0".to_string();
        app.configure(config.clone()).await.unwrap();
        let first_addr = app.tcp_addr().unwrap();

        // Unchanged config keeps the same listener.
        app.configure(config.clone()).await.unwrap();
        assert_eq!(app.tcp_addr().unwrap(), first_addr);

        config.tcp.enabled = false;
        app.configure(config).await.unwrap();
        assert!(app.tcp_addr().is_none());

        app.shutdown().await;
    }

    #[tokio::test]
    async fn bad_reload_keeps_previous_configuration() {
        let mut app = App::new();
        app.start();

        let mut config = quiet_config();
        config.carbonlink.enabled = true;
        config.carbonlink.listen = "127.0.0.1:0".to_string();
        app.configure(config.clone()).await.unwrap();
        let addr = app.carbonlink_addr().unwrap();

        let mut broken = config.clone();
        broken.common.log_level = "nope".to_string();
        assert!(app.configure(broken).await.is_err());

        // The previous listener survived the rejected reload.
        assert_eq!(app.carbonlink_addr().unwrap(), addr);

        app.shutdown().await;
    }
}
