use crate::{DeviceId, DriverError, NodeId, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

const MAX_STANDARD_ID: u16 = 0x7FF;

/// Arbitration id layout of the bus.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressLayout {
    /// Commands to node `n` go to `command_base + n`.
    pub command_base: u16,
    /// Node `n` answers on `reply_base + n`.
    pub reply_base: u16,
    /// Received by every node; nobody answers on a broadcast address.
    pub broadcast: u16,
    /// Only the set-device-id command is sent here.
    pub set_id: u16,
}

impl Default for AddressLayout {
    fn default() -> Self {
        Self {
            command_base: 0x140,
            reply_base: 0x240,
            broadcast: 0x280,
            set_id: 0x300,
        }
    }
}

impl AddressLayout {
    /// Both bases must place every possible node id inside the 11-bit range, and the
    /// fixed addresses must fit it too.
    pub fn validate(&self) -> Result<()> {
        let top = u16::from(NodeId::MAX);
        for (name, base) in [
            ("command_base", self.command_base),
            ("reply_base", self.reply_base),
        ] {
            if !matches!(base.checked_add(top), Some(last) if last <= MAX_STANDARD_ID) {
                return Err(DriverError::Config(format!(
                    "addresses.{name} 0x{base:X} + {top} exceeds the 11-bit id range"
                )));
            }
        }
        for (name, id) in [("broadcast", self.broadcast), ("set_id", self.set_id)] {
            if id > MAX_STANDARD_ID {
                return Err(DriverError::Config(format!(
                    "addresses.{name} 0x{id:X} exceeds the 11-bit id range"
                )));
            }
        }
        Ok(())
    }
}

/// Resolves devices to arbitration ids and inbound ids back to their owner.
/// Built once from the registered set; immutable afterwards.
#[derive(Clone, Debug)]
pub struct AddressMap {
    layout: AddressLayout,
    nodes: Vec<NodeId>,
    owners: HashMap<u16, NodeId>,
}

impl AddressMap {
    pub fn new(layout: AddressLayout, nodes: impl IntoIterator<Item = NodeId>) -> Result<Self> {
        // Offsets below cannot overflow once the layout is in range
        layout.validate()?;
        let nodes: Vec<NodeId> = nodes.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let command_ids: BTreeSet<u16> = nodes
            .iter()
            .map(|n| layout.command_base + u16::from(n.get()))
            .collect();
        let mut owners = HashMap::with_capacity(nodes.len());
        for &node in &nodes {
            let command = layout.command_base + u16::from(node.get());
            let reply = layout.reply_base + u16::from(node.get());
            let conflict = |reason| DriverError::AddressConflict {
                node: node.get(),
                address: reply,
                reason,
            };
            if reply == layout.broadcast {
                return Err(conflict("aliases the broadcast address"));
            }
            if reply == layout.set_id {
                return Err(conflict("aliases the set-id address"));
            }
            if command_ids.contains(&reply) {
                return Err(conflict("aliases a command address"));
            }
            owners.insert(reply, node);
        }
        Ok(Self {
            layout,
            nodes,
            owners,
        })
    }

    pub fn layout(&self) -> &AddressLayout {
        &self.layout
    }

    /// Registered nodes in ascending order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn is_registered(&self, node: NodeId) -> bool {
        self.nodes.binary_search(&node).is_ok()
    }

    pub fn command_address(&self, device: DeviceId) -> u16 {
        match device {
            DeviceId::Individual(node) => self.layout.command_base + u16::from(node.get()),
            DeviceId::Broadcast => self.layout.broadcast,
        }
    }

    /// `None` for broadcast, which has no reply path.
    pub fn reply_address(&self, device: DeviceId) -> Option<u16> {
        device
            .node()
            .map(|node| self.layout.reply_base + u16::from(node.get()))
    }

    pub fn set_id_address(&self) -> u16 {
        self.layout.set_id
    }

    /// The registered node answering on `address`, if any.
    pub fn owner_of(&self, address: u16) -> Option<NodeId> {
        self.owners.get(&address).copied()
    }
}
