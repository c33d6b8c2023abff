//! The serializable configuration bundle for a node: bind/advertise addresses, the master URI,
//! and the timeout/backoff/queueing knobs the rest of the crate reads defaults from. Loadable
//! from a TOML file the same way the teacher's services load JSON config with `serde_json`.

use serde_derive::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_name: String,
    pub bind_host: IpAddr,
    pub advertised_host: String,
    pub master_uri: String,
    pub message_database_root: PathBuf,
    pub queue_high_water_mark: usize,
    #[serde(with = "duration_millis")]
    pub reconnect_backoff_initial: Duration,
    #[serde(with = "duration_millis")]
    pub reconnect_backoff_cap: Duration,
    pub master_call_retry_cap: u32,
    #[serde(with = "duration_millis")]
    pub peer_idle_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            node_name: "/unnamed_node".to_string(),
            bind_host: IpAddr::from([0, 0, 0, 0]),
            advertised_host: "localhost".to_string(),
            master_uri: "http://localhost:11311".to_string(),
            message_database_root: PathBuf::from("."),
            queue_high_water_mark: 1024 * 1024,
            reconnect_backoff_initial: Duration::from_millis(100),
            reconnect_backoff_cap: Duration::from_secs(4),
            master_call_retry_cap: 5,
            peer_idle_timeout: Duration::from_secs(60),
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(toml: &str) -> crate::error::Result<NodeConfig> {
        serdeconv::from_toml_str(toml)
            .map_err(|e| crate::error::NodeError::with_detail(crate::error::ErrorKind::BadArgument, format!("invalid node config: {}", e)))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
