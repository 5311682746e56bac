mod account;
mod block;
mod peer;
mod receipt;
mod token;
mod transaction;
mod vote;

pub use account::{Account, ContractAccount};
pub use block::{encode_set, BlobSource, Block, Header, BLOCK_VERSION};
pub use peer::Peer;
pub use receipt::{FailType, SubTransaction, TransactionReceipt};
pub use token::{is_builtin_token, Token};
pub use transaction::{Transaction, TransactionKind};
pub use vote::BlockVote;

/// Hex-encoded address. Accounts are 32 bytes, contracts 64 bytes.
pub type Address = String;

pub const ACCOUNT_ADDRESS_LENGTH: usize = 32;
pub const CONTRACT_ADDRESS_LENGTH: usize = ACCOUNT_ADDRESS_LENGTH * 2;

/// Token id of the native currency held in `Account::amount`.
pub const NATIVE_TOKEN: &str = "";
/// Token id of the fee currency held in `Account::gas`.
pub const GAS_TOKEN: &str = "0000000000000000000000000000000000000000000000000000000000000001";

/// Decodes a hex address and returns its raw length, or `None` if it is not hex.
pub fn address_len(address: &str) -> Option<usize> {
    hex::decode(address).ok().map(|bytes| bytes.len())
}

pub fn is_account_address(address: &str) -> bool {
    address_len(address) == Some(ACCOUNT_ADDRESS_LENGTH)
}

/// Splits a contract address into its owner account and sub-address halves.
pub fn split_contract_address(address: &str) -> Option<(Address, Address)> {
    if address_len(address) != Some(CONTRACT_ADDRESS_LENGTH) {
        return None;
    }
    let (owner, sub) = address.split_at(ACCOUNT_ADDRESS_LENGTH * 2);
    Some((owner.to_ascii_lowercase(), sub.to_ascii_lowercase()))
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
