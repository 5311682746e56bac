use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::ChainResult;

use super::{Address, GAS_TOKEN, NATIVE_TOKEN};

/// Ledger entry stored in the state trie under its address.
///
/// Maps are ordered so the serialized bytes, and therefore the state root,
/// do not depend on insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub amount: i64,
    pub gas: i64,
    pub nonce: u64,
    #[serde(default)]
    pub balances: BTreeMap<String, i64>,
    #[serde(default)]
    pub contracts: BTreeMap<Address, ContractAccount>,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }

    pub fn with_funds(address: Address, amount: i64, gas: i64) -> Self {
        Self {
            address,
            amount,
            gas,
            ..Self::default()
        }
    }

    pub fn balance_of(&self, token: &str) -> i64 {
        balance_of(self.amount, self.gas, &self.balances, token)
    }

    /// Removes `value` of `token`; leaves the account untouched when funds are short.
    pub fn debit(&mut self, token: &str, value: i64) -> bool {
        debit(&mut self.amount, &mut self.gas, &mut self.balances, token, value)
    }

    pub fn credit(&mut self, token: &str, value: i64) -> bool {
        credit(&mut self.amount, &mut self.gas, &mut self.balances, token, value)
    }

    pub fn contract(&self, sub_address: &str) -> Option<&ContractAccount> {
        self.contracts.get(sub_address)
    }

    pub fn to_bytes(&self) -> ChainResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ChainResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Contract instance living under its owner's account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAccount {
    pub address: Address,
    pub amount: i64,
    pub gas: i64,
    pub code_hash: String,
    pub code: String,
    pub data: Vec<u8>,
    #[serde(default)]
    pub balances: BTreeMap<String, i64>,
}

impl ContractAccount {
    pub fn balance_of(&self, token: &str) -> i64 {
        balance_of(self.amount, self.gas, &self.balances, token)
    }

    pub fn debit(&mut self, token: &str, value: i64) -> bool {
        debit(&mut self.amount, &mut self.gas, &mut self.balances, token, value)
    }

    pub fn credit(&mut self, token: &str, value: i64) -> bool {
        credit(&mut self.amount, &mut self.gas, &mut self.balances, token, value)
    }
}

fn balance_of(amount: i64, gas: i64, balances: &BTreeMap<String, i64>, token: &str) -> i64 {
    match token {
        NATIVE_TOKEN => amount,
        GAS_TOKEN => gas,
        other => balances.get(other).copied().unwrap_or(0),
    }
}

fn debit(
    amount: &mut i64,
    gas: &mut i64,
    balances: &mut BTreeMap<String, i64>,
    token: &str,
    value: i64,
) -> bool {
    if value < 0 || balance_of(*amount, *gas, balances, token) < value {
        return false;
    }
    if value == 0 {
        return true;
    }
    let slot = match token {
        NATIVE_TOKEN => amount,
        GAS_TOKEN => gas,
        other => balances.entry(other.to_string()).or_insert(0),
    };
    *slot -= value;
    true
}

fn credit(
    amount: &mut i64,
    gas: &mut i64,
    balances: &mut BTreeMap<String, i64>,
    token: &str,
    value: i64,
) -> bool {
    if value < 0 {
        return false;
    }
    if value == 0 {
        return true;
    }
    let slot = match token {
        NATIVE_TOKEN => amount,
        GAS_TOKEN => gas,
        other => balances.entry(other.to_string()).or_insert(0),
    };
    match slot.checked_add(value) {
        Some(next) => {
            *slot = next;
            true
        }
        None => false,
    }
}
