// Identity of this proxy instance and the names derived from it.
use std::fmt;

use serde::{Deserialize, Serialize};

const NAME_PREFIX: &str = "gatehost";

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PodInfo {
    pub network: String,
    pub pod_name: String,
    pub namespace: String,
}

impl Default for PodInfo {
    fn default() -> Self {
        Self {
            network: "default".to_string(),
            pod_name: "proxy-0".to_string(),
            namespace: "default".to_string(),
        }
    }
}

impl PodInfo {
    pub fn new(
        network: impl Into<String>,
        pod_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            pod_name: pod_name.into(),
            namespace: namespace.into(),
        }
    }

    /// Subject shared by every proxy of the network.
    pub fn network_subject(&self) -> String {
        format!("{NAME_PREFIX}.{}.{}", self.namespace, self.network)
    }

    /// Subject addressed to this proxy only.
    pub fn pod_subject(&self) -> String {
        format!("{}.{}", self.network_subject(), self.pod_name)
    }

    pub fn kv_prefix(&self) -> String {
        format!("{NAME_PREFIX}_{}_{}", self.namespace, self.network)
    }

    /// Bucket of instance name -> `InstanceInfo` JSON.
    pub fn instances_bucket(&self) -> String {
        format!("{}_instances", self.kv_prefix())
    }

    pub fn gamemodes_bucket(&self) -> String {
        format!("{}_gamemodes", self.kv_prefix())
    }
}

impl fmt::Display for PodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PodInfo{{network: {}, pod: {}, namespace: {}}}",
            self.network, self.pod_name, self.namespace
        )
    }
}
