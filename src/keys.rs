//! Key and table naming for every storage tier
//!
//! Cache-tier keys are `&`-separated strings so they can double as members of
//! the sorted-set indexes. Durable keys are slash-separated object paths.

use crate::error::{Result, SpatialDbError};
use crate::morton;
use std::fmt;
use std::str::FromStr;

const NEARISO_TAG: &str = "neariso";

/// Identity of one cache-tier cuboid
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CuboidKey {
    pub project: String,
    pub channel: String,
    pub resolution: u32,
    pub address: u64,
    pub timestamp: u64,
    /// Whether the key refers to the near-isotropic tier
    pub neariso: bool,
}

impl CuboidKey {
    pub fn new(
        project: impl Into<String>,
        channel: impl Into<String>,
        resolution: u32,
        address: u64,
        timestamp: u64,
    ) -> Self {
        Self {
            project: project.into(),
            channel: channel.into(),
            resolution,
            address,
            timestamp,
            neariso: false,
        }
    }

    pub fn with_neariso(mut self, neariso: bool) -> Self {
        self.neariso = neariso;
        self
    }

    /// The same cuboid position at another address
    pub fn at(&self, address: u64) -> Self {
        Self {
            address,
            ..self.clone()
        }
    }

    /// Key of the super-cuboid holding this cuboid
    pub fn super_key(&self, factor: [u64; 3]) -> Result<SuperCuboidKey> {
        Ok(SuperCuboidKey {
            project: self.project.clone(),
            channel: self.channel.clone(),
            resolution: self.resolution,
            super_address: morton::super_address(self.address, factor)?,
            timestamp: self.timestamp,
            neariso: self.neariso,
        })
    }
}

impl fmt::Display for CuboidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}&{}&{}&{}&{}",
            self.project, self.channel, self.resolution, self.address, self.timestamp
        )?;
        if self.neariso {
            write!(f, "&{}", NEARISO_TAG)?;
        }
        Ok(())
    }
}

impl FromStr for CuboidKey {
    type Err = SpatialDbError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('&').collect();
        let bad = || SpatialDbError::InvalidArgument(format!("malformed cuboid key {:?}", s));
        let neariso = match parts.len() {
            5 => false,
            6 if parts[5] == NEARISO_TAG => true,
            _ => return Err(bad()),
        };
        Ok(Self {
            project: parts[0].to_string(),
            channel: parts[1].to_string(),
            resolution: parts[2].parse().map_err(|_| bad())?,
            address: parts[3].parse().map_err(|_| bad())?,
            timestamp: parts[4].parse().map_err(|_| bad())?,
            neariso,
        })
    }
}

/// Identity of one durable super-cuboid
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SuperCuboidKey {
    pub project: String,
    pub channel: String,
    pub resolution: u32,
    pub super_address: u64,
    pub timestamp: u64,
    pub neariso: bool,
}

impl SuperCuboidKey {
    /// Object-store path of the super-cuboid
    pub fn object_path(&self) -> String {
        format!(
            "{}/{}/r{}{}/t{}/{:020}.super",
            self.project,
            self.channel,
            self.resolution,
            if self.neariso { "-iso" } else { "" },
            self.timestamp,
            self.super_address
        )
    }

    /// Keys of the constituent cuboids, in ascending address order
    pub fn cuboid_keys(&self, factor: [u64; 3]) -> Result<Vec<CuboidKey>> {
        let origin = morton::super_origin(self.super_address, factor)?;
        let mut keys = Vec::with_capacity((factor[0] * factor[1] * factor[2]) as usize);
        for z in 0..factor[2] {
            for y in 0..factor[1] {
                for x in 0..factor[0] {
                    let address = morton::xyz_to_morton(origin[0] + x, origin[1] + y, origin[2] + z)?;
                    keys.push(CuboidKey {
                        project: self.project.clone(),
                        channel: self.channel.clone(),
                        resolution: self.resolution,
                        address,
                        timestamp: self.timestamp,
                        neariso: self.neariso,
                    });
                }
            }
        }
        keys.sort_by_key(|k| k.address);
        Ok(keys)
    }
}

impl fmt::Display for SuperCuboidKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.object_path())
    }
}

/// Table holding the spatial index of a channel at one resolution
pub fn index_table(channel: &str, resolution: u32) -> String {
    format!("{}_idx_res{}", channel, resolution)
}

/// Table holding exception lists of a channel at one resolution
pub fn exception_table(channel: &str, resolution: u32) -> String {
    format!("{}_exc_res{}", channel, resolution)
}

/// Table whose rows serialize writers of individual cuboids
pub fn cuboid_table(channel: &str, resolution: u32) -> String {
    format!("{}_cuboid_res{}", channel, resolution)
}

/// Row key of an exception list
pub fn exception_row(address: u64, timestamp: u64, entity: u64) -> String {
    format!("{}&{}&{}", address, timestamp, entity)
}
