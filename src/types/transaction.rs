use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::crypto::{address_from_public_key, sha3_hex, sign_message, signature_to_hex, verify_signer};
use crate::errors::{ChainError, ChainResult};

use super::{address_len, Address, ACCOUNT_ADDRESS_LENGTH, CONTRACT_ADDRESS_LENGTH};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Address,
    pub timestamp: u64,
    pub amount: i64,
    pub fee: i64,
    pub nonce: u64,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub token_address: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub signature: String,
}

/// Borrowed view over the fields covered by the transaction id and signature.
#[derive(Serialize)]
struct UnsignedTransaction<'a> {
    from: &'a str,
    to: &'a str,
    timestamp: u64,
    amount: i64,
    fee: i64,
    nonce: u64,
    data: &'a str,
    token_address: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    Transfer,
    ContractCall,
    Deploy,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        from: Address,
        to: Address,
        timestamp: u64,
        amount: i64,
        fee: i64,
        nonce: u64,
        data: String,
        token_address: String,
    ) -> Self {
        Self {
            from,
            to,
            timestamp,
            amount,
            fee,
            nonce,
            data,
            token_address,
            public_key: String::new(),
            signature: String::new(),
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let unsigned = UnsignedTransaction {
            from: &self.from,
            to: &self.to,
            timestamp: self.timestamp,
            amount: self.amount,
            fee: self.fee,
            nonce: self.nonce,
            data: &self.data,
            token_address: &self.token_address,
        };
        serde_json::to_vec(&unsigned).expect("serializing transaction")
    }

    /// Content hash of the unsigned fields, hex encoded.
    pub fn id(&self) -> String {
        sha3_hex(&self.canonical_bytes())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing transaction")
    }

    pub fn sign(mut self, keypair: &Keypair) -> Self {
        self.public_key = hex::encode(keypair.public.to_bytes());
        self.signature = signature_to_hex(&sign_message(keypair, &self.canonical_bytes()));
        self
    }

    /// Builds and signs a transaction originating from `keypair`.
    #[allow(clippy::too_many_arguments)]
    pub fn signed(
        keypair: &Keypair,
        to: Address,
        timestamp: u64,
        amount: i64,
        fee: i64,
        nonce: u64,
        data: String,
        token_address: String,
    ) -> Self {
        let from = address_from_public_key(&keypair.public);
        Self::new(from, to, timestamp, amount, fee, nonce, data, token_address).sign(keypair)
    }

    pub fn kind(&self) -> Option<TransactionKind> {
        if self.to.is_empty() {
            return Some(TransactionKind::Deploy);
        }
        match address_len(&self.to) {
            Some(ACCOUNT_ADDRESS_LENGTH) => Some(TransactionKind::Transfer),
            Some(CONTRACT_ADDRESS_LENGTH) => Some(TransactionKind::ContractCall),
            _ => None,
        }
    }

    pub fn verify(&self) -> ChainResult<()> {
        verify_signer(
            &self.from,
            &self.public_key,
            &self.canonical_bytes(),
            &self.signature,
        )
    }

    /// Admission checks applied before a transaction may enter the pool.
    pub fn validate(&self) -> ChainResult<()> {
        if self.amount < 0 {
            return Err(ChainError::Transaction(format!(
                "invalid amount {}",
                self.amount
            )));
        }
        if self.fee < 0 {
            return Err(ChainError::Transaction(format!("invalid fee {}", self.fee)));
        }
        if address_len(&self.from) != Some(ACCOUNT_ADDRESS_LENGTH)
            || self.from != self.from.to_ascii_lowercase()
        {
            return Err(ChainError::Transaction(format!(
                "invalid sender address {}",
                self.from
            )));
        }
        if self.kind().is_none() || self.to != self.to.to_ascii_lowercase() || self.to == self.from
        {
            return Err(ChainError::Transaction(format!(
                "invalid receiver address {}",
                self.to
            )));
        }
        self.verify()
            .map_err(|err| ChainError::Transaction(format!("invalid signature: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    fn transfer(amount: i64) -> Transaction {
        let keypair = generate_keypair();
        Transaction::signed(&keypair, "cd".repeat(32), 1, amount, 1, 1, String::new(), String::new())
    }

    #[test]
    fn id_ignores_signature() {
        let tx = transfer(5);
        let mut unsigned = tx.clone();
        unsigned.signature.clear();
        unsigned.public_key.clear();
        assert_eq!(tx.id(), unsigned.id());
    }

    #[test]
    fn negative_amount_is_rejected() {
        let err = transfer(-1).validate().expect_err("negative amount");
        assert!(matches!(err, ChainError::Transaction(_)));
        transfer(5).validate().expect("valid transfer");
    }

    #[test]
    fn transfer_to_self_is_rejected() {
        let keypair = generate_keypair();
        let own = crate::crypto::address_from_public_key(&keypair.public);
        let tx = Transaction::signed(&keypair, own, 1, 5, 1, 1, String::new(), String::new());
        match tx.validate() {
            Err(ChainError::Transaction(reason)) => assert!(reason.contains("invalid receiver address")),
            other => panic!("expected a rejection, got {other:?}"),
        }
    }

    #[test]
    fn tampering_breaks_signature() {
        let mut tx = transfer(5);
        tx.amount = 6;
        assert!(tx.validate().is_err());
    }

    #[test]
    fn kind_follows_receiver_length() {
        let mut tx = transfer(5);
        assert_eq!(tx.kind(), Some(TransactionKind::Transfer));
        tx.to = "cd".repeat(64);
        assert_eq!(tx.kind(), Some(TransactionKind::ContractCall));
        tx.to.clear();
        assert_eq!(tx.kind(), Some(TransactionKind::Deploy));
        tx.to = "cd".repeat(3);
        assert_eq!(tx.kind(), None);
    }
}
