use crate::config::{parse_peers, NodeConfig, DEFAULT_BIND_ADDR};
use clap::{ArgAction, Parser};
use regis::{GovernorSettings, NodeId, RegistryConfig, ReplicationSettings, Result};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "regis-server", version, about = "Service registry node", long_about = None)]
pub struct Cli {
    /// Address to serve the registry API on
    #[arg(long, env = "REGIS_BIND_ADDR", default_value = DEFAULT_BIND_ADDR)]
    pub bind: SocketAddr,

    /// Comma separated base URLs of sibling registry nodes
    #[arg(long, env = "REGIS_PEERS", default_value = "")]
    pub peers: String,

    /// Stable node id (a fresh one is generated when omitted)
    #[arg(long, env = "REGIS_NODE_ID")]
    pub node_id: Option<String>,

    /// Lease granted when a registration does not ask for one
    #[arg(long, env = "REGIS_LEASE_SECS", default_value_t = 90)]
    pub lease_secs: u64,

    #[arg(long, env = "REGIS_GRACE_MULTIPLIER", default_value_t = 1.0)]
    pub grace_multiplier: f64,

    /// How often clients are expected to renew
    #[arg(long, env = "REGIS_RENEWAL_INTERVAL_SECS", default_value_t = 30)]
    pub renewal_interval_secs: u64,

    /// Renewal ratio below which evictions are suspended
    #[arg(long, env = "REGIS_RENEWAL_THRESHOLD", default_value_t = 0.85)]
    pub renewal_threshold: f64,

    #[arg(long, env = "REGIS_RATE_WINDOW_SECS", default_value_t = 60)]
    pub rate_window_secs: u64,

    /// Sustained healthy time before evictions resume
    #[arg(long, env = "REGIS_RECOVERY_SECS", default_value_t = 60)]
    pub recovery_secs: u64,

    /// Never suspend evictions
    #[arg(long, env = "REGIS_DISABLE_SELF_PRESERVATION")]
    pub disable_self_preservation: bool,

    #[arg(long, env = "REGIS_DELTA_RETENTION_SECS", default_value_t = 180)]
    pub delta_retention_secs: u64,

    #[arg(long, env = "REGIS_EVICTION_INTERVAL_SECS", default_value_t = 30)]
    pub eviction_interval_secs: u64,

    #[arg(long, env = "REGIS_GOVERNOR_INTERVAL_SECS", default_value_t = 5)]
    pub governor_interval_secs: u64,

    #[arg(long, env = "REGIS_RETENTION_INTERVAL_SECS", default_value_t = 30)]
    pub retention_interval_secs: u64,

    #[arg(long, env = "REGIS_RECONCILE_INTERVAL_SECS", default_value_t = 300)]
    pub reconcile_interval_secs: u64,

    #[arg(long, env = "REGIS_PEER_TIMEOUT_MS", default_value_t = 2000)]
    pub peer_timeout_ms: u64,

    #[arg(long, env = "REGIS_QUEUE_CAPACITY", default_value_t = 1024)]
    pub queue_capacity: usize,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count)]
    pub verbosity: u8,
}

impl Cli {
    /// Log filter used when `RUST_LOG` is unset
    pub fn log_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn,regis=info,regis_node=info",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    pub fn into_config(self) -> Result<NodeConfig> {
        let node_id = match &self.node_id {
            Some(id) => id.parse::<NodeId>()?,
            None => NodeId::new(),
        };

        let registry = RegistryConfig::new()
            .with_default_lease(Duration::from_secs(self.lease_secs))
            .with_grace_multiplier(self.grace_multiplier)
            .with_delta_retention(Duration::from_secs(self.delta_retention_secs))
            .with_governor(GovernorSettings {
                renewal_interval: Duration::from_secs(self.renewal_interval_secs),
                threshold_ratio: self.renewal_threshold,
                rate_window: Duration::from_secs(self.rate_window_secs),
                recovery_period: Duration::from_secs(self.recovery_secs),
                enabled: !self.disable_self_preservation,
            });

        let config = NodeConfig::new()
            .with_bind_addr(self.bind)
            .with_node_id(node_id)
            .with_registry(registry)
            .with_replication(ReplicationSettings {
                peer_timeout: Duration::from_millis(self.peer_timeout_ms),
                queue_capacity: self.queue_capacity,
            })
            .with_peers(parse_peers(&self.peers)?)
            .with_eviction_interval(Duration::from_secs(self.eviction_interval_secs))
            .with_governor_interval(Duration::from_secs(self.governor_interval_secs))
            .with_retention_interval(Duration::from_secs(self.retention_interval_secs))
            .with_reconcile_interval(Duration::from_secs(self.reconcile_interval_secs));

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regis::Error;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["regis-server"]).unwrap();
        let config = cli.into_config().unwrap();
        assert_eq!(config.bind_addr.port(), 8761);
        assert!(config.peers.is_empty());
        assert_eq!(config.registry, RegistryConfig::default());
        assert_eq!(config.reconcile_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_flags_map_onto_config() {
        let cli = Cli::try_parse_from([
            "regis-server",
            "--bind",
            "127.0.0.1:9000",
            "--peers",
            "http://10.0.0.2:8761,http://10.0.0.3:8761",
            "--renewal-threshold",
            "0.5",
            "--disable-self-preservation",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.log_filter(), "debug");

        let config = cli.into_config().unwrap();
        assert_eq!(config.peers.len(), 2);
        assert!(!config.registry.governor.enabled);
        assert!((config.registry.governor.threshold_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bad_peer_list_is_fatal() {
        let cli = Cli::try_parse_from(["regis-server", "--peers", "not a url"]).unwrap();
        assert!(matches!(cli.into_config(), Err(Error::Config(_))));
    }
}
