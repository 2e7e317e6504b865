//! Static Placement Ring Adapter
//!
//! Implements the `PlacementRing` port with a fixed replica-to-partition
//! assignment table, either supplied explicitly or spread round-robin.

use crate::domain::ports::{DeviceId, PlacementRing};
use crate::error::{Error, Result};

/// Largest partition power accepted (16M partitions).
const MAX_PART_POWER: u32 = 24;

/// Ring with `2^part_power` partitions and one assignment row per replica.
#[derive(Debug, Clone)]
pub struct StaticRing {
    part_power: u32,
    devices: Vec<DeviceId>,
    /// `replica2part2dev[r][p]` is the device index of replica `r` of `p`.
    replica2part2dev: Vec<Vec<usize>>,
}

impl StaticRing {
    /// Spread `replicas` copies of every partition over `devices` so that no
    /// partition lands twice on the same device.
    pub fn balanced(devices: Vec<DeviceId>, part_power: u32, replicas: usize) -> Result<Self> {
        Self::validate_shape(&devices, part_power, replicas)?;
        let partitions = 1usize << part_power;
        let n = devices.len();
        let table = (0..replicas)
            .map(|r| (0..partitions).map(|p| (p + r) % n).collect())
            .collect();
        Ok(Self {
            part_power,
            devices,
            replica2part2dev: table,
        })
    }

    /// Ring from an explicit `replica -> partition -> device index` table.
    pub fn from_assignment(
        devices: Vec<DeviceId>,
        part_power: u32,
        replica2part2dev: Vec<Vec<usize>>,
    ) -> Result<Self> {
        Self::validate_shape(&devices, part_power, replica2part2dev.len())?;
        let partitions = 1usize << part_power;
        for (r, row) in replica2part2dev.iter().enumerate() {
            if row.len() != partitions {
                return Err(Error::Config(format!(
                    "replica {} assigns {} partitions, ring has {}",
                    r,
                    row.len(),
                    partitions
                )));
            }
            if let Some(bad) = row.iter().find(|d| **d >= devices.len()) {
                return Err(Error::Config(format!(
                    "replica {} references unknown device index {}",
                    r, bad
                )));
            }
        }
        for p in 0..partitions {
            let mut seen: Vec<usize> = replica2part2dev.iter().map(|row| row[p]).collect();
            seen.sort_unstable();
            seen.dedup();
            if seen.len() != replica2part2dev.len() {
                return Err(Error::Config(format!(
                    "partition {} is assigned to the same device twice",
                    p
                )));
            }
        }
        Ok(Self {
            part_power,
            devices,
            replica2part2dev,
        })
    }

    fn validate_shape(devices: &[DeviceId], part_power: u32, replicas: usize) -> Result<()> {
        if part_power > MAX_PART_POWER {
            return Err(Error::Config(format!(
                "part_power {} exceeds {}",
                part_power, MAX_PART_POWER
            )));
        }
        if replicas == 0 {
            return Err(Error::Config("ring needs at least one replica".into()));
        }
        if devices.len() < replicas {
            return Err(Error::Config(format!(
                "ring has {} devices for {} replicas",
                devices.len(),
                replicas
            )));
        }
        Ok(())
    }

    pub fn part_power(&self) -> u32 {
        self.part_power
    }

    pub fn replicas(&self) -> usize {
        self.replica2part2dev.len()
    }
}

impl PlacementRing for StaticRing {
    fn part_shift(&self) -> u32 {
        32 - self.part_power
    }

    fn get_part_nodes(&self, partition: u32) -> Vec<DeviceId> {
        self.replica2part2dev
            .iter()
            .filter_map(|row| row.get(partition as usize))
            .map(|idx| self.devices[*idx].clone())
            .collect()
    }

    fn devices(&self) -> Vec<DeviceId> {
        self.devices.clone()
    }
}
