use serde::{Deserialize, Serialize};

use super::Address;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailType {
    Success,
    CheckFail,
    NoGas,
    InvalidNonce,
    NoEnoughAmount,
    InvalidAddress,
    InvalidContractAddress,
    InitContractAccountFail,
    CheckContractSubtxError,
    ContractError,
    ContractTimeout,
    ContractUpgradeRefused,
}

/// One debit/credit pair produced while executing a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTransaction {
    pub parent: String,
    pub from: Address,
    pub to: Address,
    pub amount: i64,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub token_address: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub tx_id: String,
    pub fee: i64,
    pub success: bool,
    pub fail_type: FailType,
    pub sub_transactions: Vec<SubTransaction>,
}

impl TransactionReceipt {
    pub fn success(tx_id: String, fee: i64, sub_transactions: Vec<SubTransaction>) -> Self {
        Self {
            tx_id,
            fee,
            success: true,
            fail_type: FailType::Success,
            sub_transactions,
        }
    }

    pub fn failure(tx_id: String, fee: i64, fail_type: FailType) -> Self {
        Self {
            tx_id,
            fee,
            success: false,
            fail_type,
            sub_transactions: Vec::new(),
        }
    }
}
