use serde::{Deserialize, Serialize};

use crate::errors::ChainResult;

use super::{address_len, Address, ACCOUNT_ADDRESS_LENGTH, GAS_TOKEN, NATIVE_TOKEN};

/// Registered token, stored in the token tree under its address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub name: String,
    pub decimals: u8,
    pub total: i64,
    pub issuer: Address,
}

impl Token {
    /// A registry entry is usable only with a name, a precision and a supply.
    pub fn is_well_formed(&self) -> bool {
        !self.name.is_empty()
            && self.decimals > 0
            && self.total > 0
            && address_len(&self.address) == Some(ACCOUNT_ADDRESS_LENGTH)
            && self.address == self.address.to_ascii_lowercase()
    }

    pub fn to_bytes(&self) -> ChainResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ChainResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Native and gas balances live in dedicated account fields, not in the registry.
pub fn is_builtin_token(token_address: &str) -> bool {
    token_address == NATIVE_TOKEN || token_address == GAS_TOKEN
}
