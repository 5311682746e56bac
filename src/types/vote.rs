use ed25519_dalek::Keypair;
use serde::{Deserialize, Serialize};

use crate::crypto::{sign_message, signature_to_hex, verify_signer};
use crate::errors::{ChainError, ChainResult};

use super::Peer;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockVote {
    pub chain_id: u64,
    pub block_hash: String,
    pub block_height: u64,
    pub result: bool,
    pub voter: Peer,
    pub public_key: String,
    pub signature: String,
}

#[derive(Serialize)]
struct VoteBody<'a> {
    chain_id: u64,
    block_hash: &'a str,
    block_height: u64,
    result: bool,
    voter: &'a str,
}

impl BlockVote {
    pub fn signed(
        chain_id: u64,
        block_hash: String,
        block_height: u64,
        voter: Peer,
        keypair: &Keypair,
    ) -> Self {
        let mut vote = Self {
            chain_id,
            block_hash,
            block_height,
            result: true,
            voter,
            public_key: hex::encode(keypair.public.to_bytes()),
            signature: String::new(),
        };
        vote.signature = signature_to_hex(&sign_message(keypair, &vote.signing_bytes()));
        vote
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let body = VoteBody {
            chain_id: self.chain_id,
            block_hash: &self.block_hash,
            block_height: self.block_height,
            result: self.result,
            voter: &self.voter.account,
        };
        serde_json::to_vec(&body).expect("serializing vote")
    }

    /// Only approving votes exist; a missing vote is the only way to refuse a block.
    pub fn validate(&self) -> ChainResult<()> {
        if !self.result {
            return Err(ChainError::Block("vote result is not an approval".into()));
        }
        verify_signer(
            &self.voter.account,
            &self.public_key,
            &self.signing_bytes(),
            &self.signature,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{address_from_public_key, generate_keypair};

    #[test]
    fn vote_signature_covers_block_hash() {
        let keypair = generate_keypair();
        let voter = Peer {
            account: address_from_public_key(&keypair.public),
            address: "127.0.0.1".into(),
            port: 1,
            weight: 1,
        };
        let vote = BlockVote::signed(1, "ab".repeat(32), 4, voter, &keypair);
        vote.validate().expect("valid vote");

        let mut forged = vote.clone();
        forged.block_hash = "cd".repeat(32);
        assert!(forged.validate().is_err());

        let mut rejecting = vote;
        rejecting.result = false;
        assert!(rejecting.validate().is_err());
    }
}
