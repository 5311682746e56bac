use serde::{Deserialize, Serialize};

use super::Address;

/// Member of the delegate set.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub account: Address,
    pub address: String,
    pub port: u16,
    pub weight: u32,
}

impl Peer {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    pub fn same_identity(&self, other: &Peer) -> bool {
        self.account == other.account
    }
}
