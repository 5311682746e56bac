use std::time::Duration;

use thiserror::Error;

use crate::crypto::sha3_hex;
use crate::types::{is_account_address, Address, ContractAccount, SubTransaction, Transaction};

/// Input handed to a contract invocation. Everything the contract may read is
/// in here; it must not consult clocks or entropy.
#[derive(Clone, Debug)]
pub struct ContractCall {
    pub tx: Transaction,
    pub contract_address: Address,
    pub owner: Address,
    pub contract: ContractAccount,
    /// Hash of the parent block, usable as a deterministic seed.
    pub previous_hash: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContractOutcome {
    pub sub_transactions: Vec<SubTransaction>,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployedContract {
    pub code: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractFailure {
    #[error("contract execution failed: {0}")]
    Error(String),
    #[error("contract execution timed out")]
    Timeout,
}

/// Contract execution engine. Implementations must be pure functions of
/// their inputs so that every replay yields the same outcome.
pub trait ContractExecutor: Send + Sync + 'static {
    fn deploy(&self, tx: &Transaction, contract_address: &str) -> Result<DeployedContract, String>;

    fn call(&self, call: &ContractCall) -> Result<ContractOutcome, String>;
}

/// Runs `job` on the blocking pool and gives up after `timeout`.
pub async fn run_bounded<T, F>(timeout: Duration, job: F) -> Result<T, ContractFailure>
where
    F: FnOnce() -> Result<T, String> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::task::spawn_blocking(job);
    match tokio::time::timeout(timeout, handle).await {
        Err(_) => Err(ContractFailure::Timeout),
        Ok(Err(join)) => Err(ContractFailure::Error(join.to_string())),
        Ok(Ok(result)) => result.map_err(ContractFailure::Error),
    }
}

/// Sub-address of a contract deployed by `from` with `nonce`.
pub fn derive_contract_address(from: &str, nonce: u64) -> String {
    let mut seed = hex::decode(from).unwrap_or_default();
    seed.extend_from_slice(&nonce.to_be_bytes());
    sha3_hex(&seed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BuiltinKind {
    Forward,
    Vault,
}

impl BuiltinKind {
    fn parse(code: &str) -> Option<Self> {
        match code {
            "forward" => Some(Self::Forward),
            "vault" => Some(Self::Vault),
            _ => None,
        }
    }
}

/// Contracts compiled into the node.
///
/// * `forward`: every call passes the received value on to the 32-byte
///   account named (hex) in the call data.
/// * `vault`: keeps whatever it receives; the owner releases funds with call
///   data `withdraw:<amount>`.
#[derive(Clone, Debug, Default)]
pub struct BuiltinContracts;

impl ContractExecutor for BuiltinContracts {
    fn deploy(&self, tx: &Transaction, _contract_address: &str) -> Result<DeployedContract, String> {
        let kind = BuiltinKind::parse(tx.data.trim())
            .ok_or_else(|| format!("unknown contract code {:?}", tx.data))?;
        let code = match kind {
            BuiltinKind::Forward => "forward",
            BuiltinKind::Vault => "vault",
        };
        Ok(DeployedContract {
            code: code.to_string(),
            data: Vec::new(),
        })
    }

    fn call(&self, call: &ContractCall) -> Result<ContractOutcome, String> {
        let kind = BuiltinKind::parse(&call.contract.code)
            .ok_or_else(|| format!("unknown contract code {:?}", call.contract.code))?;
        let tx = &call.tx;
        let parent = tx.id();
        match kind {
            BuiltinKind::Forward => {
                let target = tx.data.trim().to_ascii_lowercase();
                if !is_account_address(&target) {
                    return Err(format!("forward target {target:?} is not an account"));
                }
                Ok(ContractOutcome {
                    sub_transactions: vec![SubTransaction {
                        parent,
                        from: call.contract_address.clone(),
                        to: target,
                        amount: tx.amount,
                        data: String::new(),
                        token_address: tx.token_address.clone(),
                    }],
                    data: call.contract.data.clone(),
                })
            }
            BuiltinKind::Vault => {
                let Some(requested) = tx.data.trim().strip_prefix("withdraw:") else {
                    return Ok(ContractOutcome {
                        sub_transactions: Vec::new(),
                        data: call.contract.data.clone(),
                    });
                };
                if tx.from != call.owner {
                    return Err("only the owner may withdraw".into());
                }
                let amount: i64 = requested
                    .parse()
                    .map_err(|err| format!("invalid withdraw amount: {err}"))?;
                Ok(ContractOutcome {
                    sub_transactions: vec![SubTransaction {
                        parent,
                        from: call.contract_address.clone(),
                        to: call.owner.clone(),
                        amount,
                        data: String::new(),
                        token_address: tx.token_address.clone(),
                    }],
                    data: call.contract.data.clone(),
                })
            }
        }
    }
}
