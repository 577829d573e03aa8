//! Node identities as advertised in handshake messages.

use crate::address::Address;
use crate::vec2::Vec2;
use serde::{Deserialize, Serialize};

/// Address + position + area-of-interest radius of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub addr: Address,
    pub pos: Vec2,
    #[serde(default)]
    pub aoi_radius: u32,
}

impl Identity {
    pub fn new(addr: Address, pos: Vec2, aoi_radius: u32) -> Self {
        Self {
            addr,
            pos,
            aoi_radius,
        }
    }
}
