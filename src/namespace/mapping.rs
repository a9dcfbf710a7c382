use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// a single range in a uid/gid mapping, in OCI runtime-spec form
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// start of range inside the container (logical value)
    #[serde(rename = "containerID")]
    pub container_id: u32,
    /// start of range on the host (on-disk value)
    #[serde(rename = "hostID")]
    pub host_id: u32,
    /// number of ids in this range
    pub size: u32,
}

impl IdMapping {
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// check if a container id falls within this range
    pub fn contains_container(&self, id: u32) -> bool {
        id >= self.container_id && id < self.container_id.saturating_add(self.size)
    }

    /// check if a host id falls within this range
    pub fn contains_host(&self, id: u32) -> bool {
        id >= self.host_id && id < self.host_id.saturating_add(self.size)
    }

    /// both ranges must fit in the 32-bit id space
    pub fn validate(&self) -> Result<()> {
        let end = 1u64 << 32;
        if u64::from(self.container_id) + u64::from(self.size) > end
            || u64::from(self.host_id) + u64::from(self.size) > end
        {
            return Err(Error::InvalidMapping(format!(
                "containerID {} hostID {} size {} exceeds the 32-bit id range",
                self.container_id, self.host_id, self.size
            )));
        }
        Ok(())
    }
}

/// uid/gid mapping and privilege mode the bundle was unpacked with
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapOptions {
    #[serde(default)]
    pub uid_mappings: Vec<IdMapping>,
    #[serde(default)]
    pub gid_mappings: Vec<IdMapping>,
    /// unpacked without elevated privileges
    #[serde(default)]
    pub rootless: bool,
}

impl MapOptions {
    /// no mappings, privileged
    pub fn identity() -> Self {
        Self::default()
    }

    /// reject ranges that run past the end of the id space
    pub fn validate(&self) -> Result<()> {
        self.uid_mappings
            .iter()
            .chain(&self.gid_mappings)
            .try_for_each(IdMapping::validate)
    }

    /// on-disk uid to the uid recorded in a layer
    ///
    /// an empty mapping table is the identity.
    pub fn uid_to_container(&self, host: u32) -> Result<u32> {
        if self.uid_mappings.is_empty() {
            return Ok(host);
        }
        host_to_container(host, &self.uid_mappings).ok_or(Error::UnmappedUid(host))
    }

    /// on-disk gid to the gid recorded in a layer
    pub fn gid_to_container(&self, host: u32) -> Result<u32> {
        if self.gid_mappings.is_empty() {
            return Ok(host);
        }
        host_to_container(host, &self.gid_mappings).ok_or(Error::UnmappedGid(host))
    }
}

/// convert host (on-disk) id to container (logical) id
///
/// `None` when no range holds the id or the result would leave the id space.
pub fn host_to_container(host: u32, map: &[IdMapping]) -> Option<u32> {
    map.iter()
        .find(|entry| entry.contains_host(host))
        .and_then(|entry| entry.container_id.checked_add(host - entry.host_id))
}
