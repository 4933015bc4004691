//! Machine-type catalog, node shapes, and ephemeral storage mappings.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Device slots ephemeral disks are mapped to, in order. The root volume
/// is attached by the provider, so mapping starts at the second device.
pub const EPHEMERAL_DEVICE_SLOTS: [&str; 3] = ["/dev/xvdb", "/dev/xvdc", "/dev/xvdd"];

/// Wall time a node is assumed to be rented for, in seconds.
const NODE_WALL_TIME_SECS: u64 = 60 * 60;

const GIB: u64 = 1 << 30;

/// Static description of a provider machine type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MachineType {
    pub name: &'static str,
    pub cores: u32,
    pub memory_gib: f64,
    /// Number of instance-store (ephemeral) disks.
    pub ephemeral_disks: u32,
    /// Capacity of each ephemeral disk.
    pub disk_capacity_gib: u64,
}

const fn machine(
    name: &'static str,
    cores: u32,
    memory_gib: f64,
    ephemeral_disks: u32,
    disk_capacity_gib: u64,
) -> MachineType {
    MachineType {
        name,
        cores,
        memory_gib,
        ephemeral_disks,
        disk_capacity_gib,
    }
}

const CATALOG: &[MachineType] = &[
    machine("t2.micro", 1, 1.0, 0, 0),
    machine("t2.medium", 2, 4.0, 0, 0),
    machine("m3.medium", 1, 3.75, 1, 4),
    machine("m3.large", 2, 7.5, 1, 32),
    machine("m3.xlarge", 4, 15.0, 2, 40),
    machine("m3.2xlarge", 8, 30.0, 2, 80),
    machine("c3.large", 2, 3.75, 2, 16),
    machine("c3.xlarge", 4, 7.5, 2, 40),
    machine("c3.2xlarge", 8, 15.0, 2, 80),
    machine("r3.large", 2, 15.25, 1, 32),
    machine("r3.xlarge", 4, 30.5, 1, 80),
    machine("d2.xlarge", 4, 30.5, 3, 2000),
    machine("i2.2xlarge", 8, 61.0, 2, 800),
    machine("i2.4xlarge", 16, 122.0, 4, 800),
    machine("d2.2xlarge", 8, 61.0, 6, 2000),
];

impl MachineType {
    /// Look up a machine type by name.
    pub fn lookup(name: &str) -> CoreResult<&'static MachineType> {
        CATALOG
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| CoreError::UnknownMachineType(name.to_string()))
    }

    /// All machine types the catalog knows about.
    pub fn catalog() -> &'static [MachineType] {
        CATALOG
    }

    /// Resources a node of this type offers to the workload scheduler.
    pub fn shape(&self) -> NodeShape {
        NodeShape {
            wall_time_secs: NODE_WALL_TIME_SECS,
            memory_bytes: (self.memory_gib * GIB as f64) as u64,
            cores: self.cores,
            disk_bytes: self.ephemeral_disks as u64 * self.disk_capacity_gib * GIB,
        }
    }
}

/// Parse a preemptable node type of the form `<machine-type>:<bid-price>`.
pub fn parse_preemptable_node_type(spec: &str) -> CoreResult<(&'static MachineType, f64)> {
    let (name, price) = spec
        .split_once(':')
        .ok_or_else(|| CoreError::InvalidBid(spec.to_string()))?;
    let price: f64 = price
        .trim()
        .parse()
        .map_err(|_| CoreError::InvalidBid(spec.to_string()))?;
    if !price.is_finite() || price <= 0.0 {
        return Err(CoreError::InvalidBid(spec.to_string()));
    }
    Ok((MachineType::lookup(name.trim())?, price))
}

/// Resources of one node, as seen by the workload scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeShape {
    pub wall_time_secs: u64,
    pub memory_bytes: u64,
    pub cores: u32,
    pub disk_bytes: u64,
}

/// One ephemeral disk bound to a device slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSlot {
    /// Device path on the instance (`/dev/xvdb`).
    pub device: String,
    /// Provider name of the ephemeral disk (`ephemeral0`).
    pub virtual_name: String,
}

/// Ordered mapping of ephemeral disks to device slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMapping {
    pub slots: Vec<StorageSlot>,
}

impl StorageMapping {
    /// Build the mapping for a machine type.
    ///
    /// Machine types with more ephemeral disks than there are device slots
    /// are rejected instead of silently truncated.
    pub fn for_machine(machine: &MachineType) -> CoreResult<Self> {
        let disks = machine.ephemeral_disks;
        if disks as usize > EPHEMERAL_DEVICE_SLOTS.len() {
            return Err(CoreError::UnsupportedStorage {
                machine_type: machine.name.to_string(),
                disks,
                max: EPHEMERAL_DEVICE_SLOTS.len(),
            });
        }

        let slots = EPHEMERAL_DEVICE_SLOTS
            .iter()
            .take(disks as usize)
            .enumerate()
            .map(|(i, device)| StorageSlot {
                device: device.to_string(),
                virtual_name: format!("ephemeral{i}"),
            })
            .collect();

        let mapping = Self { slots };
        debug!(machine_type = machine.name, ?mapping, "storage mapping built");
        Ok(mapping)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_disks(disks: u32) -> MachineType {
        machine("test.type", 2, 4.0, disks, 10)
    }

    #[test]
    fn lookup_known_type() {
        let m = MachineType::lookup("m3.large").unwrap();
        assert_eq!(m.cores, 2);
        assert_eq!(m.ephemeral_disks, 1);
    }

    #[test]
    fn lookup_unknown_type_fails() {
        assert!(matches!(
            MachineType::lookup("z9.huge"),
            Err(CoreError::UnknownMachineType(_))
        ));
    }

    #[test]
    fn storage_mapping_matches_disk_count() {
        for disks in 0..=3 {
            let mapping = StorageMapping::for_machine(&with_disks(disks)).unwrap();
            assert_eq!(mapping.len(), disks as usize);
            for (i, slot) in mapping.slots.iter().enumerate() {
                assert_eq!(slot.device, EPHEMERAL_DEVICE_SLOTS[i]);
                assert_eq!(slot.virtual_name, format!("ephemeral{i}"));
            }
        }
    }

    #[test]
    fn two_disks_use_first_two_slots() {
        let m = MachineType::lookup("m3.xlarge").unwrap();
        let mapping = StorageMapping::for_machine(m).unwrap();
        let devices: Vec<_> = mapping.slots.iter().map(|s| s.device.as_str()).collect();
        assert_eq!(devices, vec!["/dev/xvdb", "/dev/xvdc"]);
    }

    #[test]
    fn more_than_three_disks_is_unsupported() {
        let err = StorageMapping::for_machine(&with_disks(4)).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedStorage { disks: 4, max: 3, .. }));

        let m = MachineType::lookup("i2.4xlarge").unwrap();
        assert!(StorageMapping::for_machine(m).is_err());
    }

    #[test]
    fn shape_converts_units() {
        let shape = MachineType::lookup("m3.xlarge").unwrap().shape();
        assert_eq!(shape.wall_time_secs, 3600);
        assert_eq!(shape.cores, 4);
        assert_eq!(shape.memory_bytes, 15 * GIB);
        assert_eq!(shape.disk_bytes, 2 * 40 * GIB);
    }

    #[test]
    fn parse_bid() {
        let (m, price) = parse_preemptable_node_type("c3.large:0.25").unwrap();
        assert_eq!(m.name, "c3.large");
        assert_eq!(price, 0.25);
    }

    #[test]
    fn parse_bid_rejects_garbage() {
        assert!(parse_preemptable_node_type("c3.large").is_err());
        assert!(parse_preemptable_node_type("c3.large:cheap").is_err());
        assert!(parse_preemptable_node_type("c3.large:-1").is_err());
        assert!(matches!(
            parse_preemptable_node_type("nope:0.1"),
            Err(CoreError::UnknownMachineType(_))
        ));
    }
}
