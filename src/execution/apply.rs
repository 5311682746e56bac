use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::crypto::sha3_hex;
use crate::errors::ChainResult;
use crate::state::{NodeStore, StateTree};
use crate::types::{
    encode_set, is_account_address, split_contract_address, Account, Address, ContractAccount,
    FailType, Header, SubTransaction, Transaction, TransactionKind, TransactionReceipt, GAS_TOKEN,
};

use super::contract::{
    derive_contract_address, run_bounded, ContractCall, ContractExecutor, ContractFailure,
};

/// Result of dispatching one transaction: the sub-transactions it produced,
/// or the reason it failed.
type Applied = Result<Vec<SubTransaction>, FailType>;

/// Accounts touched by one transaction, written back only if it succeeds.
#[derive(Default)]
struct Staged {
    accounts: BTreeMap<Address, Account>,
}

impl Staged {
    fn fetch(&mut self, tree: &StateTree, address: &str) -> ChainResult<Option<&mut Account>> {
        match self.accounts.entry(address.to_string()) {
            Entry::Occupied(entry) => Ok(Some(entry.into_mut())),
            Entry::Vacant(entry) => match tree.account(address)? {
                Some(account) => Ok(Some(entry.insert(account))),
                None => Ok(None),
            },
        }
    }

    fn fetch_or_create(&mut self, tree: &StateTree, address: &str) -> ChainResult<&mut Account> {
        match self.accounts.entry(address.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let account = tree
                    .account(address)?
                    .unwrap_or_else(|| Account::new(address.to_string()));
                Ok(entry.insert(account))
            }
        }
    }

    fn contract(
        &mut self,
        tree: &StateTree,
        owner: &str,
        sub_address: &str,
    ) -> ChainResult<Option<&mut ContractAccount>> {
        Ok(self
            .fetch(tree, owner)?
            .and_then(|account| account.contracts.get_mut(sub_address)))
    }

    fn commit(self, tree: &mut StateTree) -> ChainResult<()> {
        for account in self.accounts.values() {
            tree.store_account(account)?;
        }
        Ok(())
    }
}

/// Header body produced once every transaction has been applied.
#[derive(Clone, Debug)]
pub struct BuiltBlock {
    pub header: Header,
    pub transactions: Vec<Transaction>,
    pub receipts: Vec<TransactionReceipt>,
}

/// Applies transactions on top of a parent header.
///
/// The proposer feeds it transactions drained from the pool; a validator feeds
/// it the transaction list of a candidate block. Both end with [`finalize`],
/// so the two sides compute the same header for the same input.
///
/// [`finalize`]: BlockBuilder::finalize
pub struct BlockBuilder {
    header: Header,
    state: StateTree,
    tokens: StateTree,
    transactions: Vec<Transaction>,
    receipts: Vec<TransactionReceipt>,
    executor: Arc<dyn ContractExecutor>,
    contract_timeout: Duration,
}

impl BlockBuilder {
    pub fn new(
        parent: &Header,
        coinbase: Address,
        timestamp: u64,
        store: Arc<dyn NodeStore>,
        executor: Arc<dyn ContractExecutor>,
        contract_timeout: Duration,
    ) -> ChainResult<Self> {
        let state = StateTree::at_hex(store.clone(), &parent.state_root)?;
        let tokens = StateTree::at_hex(store, &parent.token_root)?;
        Ok(Self {
            header: parent.next(coinbase, timestamp),
            state,
            tokens,
            transactions: Vec::new(),
            receipts: Vec::new(),
            executor,
            contract_timeout,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn state(&self) -> &StateTree {
        &self.state
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Applies `tx` and records it with its receipt, whether it succeeded or not.
    ///
    /// Errors are local storage failures; transaction rejections only show up
    /// in the returned receipt.
    pub async fn apply(&mut self, tx: Transaction) -> ChainResult<&TransactionReceipt> {
        let receipt = self.apply_transaction(&tx).await?;
        if !receipt.success {
            debug!(tx = %receipt.tx_id, fail = ?receipt.fail_type, "transaction failed");
        }
        self.transactions.push(tx);
        self.receipts.push(receipt);
        Ok(&self.receipts[self.receipts.len() - 1])
    }

    async fn apply_transaction(&mut self, tx: &Transaction) -> ChainResult<TransactionReceipt> {
        let id = tx.id();
        if !is_account_address(&tx.from) {
            return Ok(TransactionReceipt::failure(id, 0, FailType::InvalidAddress));
        }
        if tx.verify().is_err() || tx.amount < 0 {
            return Ok(TransactionReceipt::failure(id, 0, FailType::CheckFail));
        }
        if !self.tokens.is_registered_token(&tx.token_address)? {
            return Ok(TransactionReceipt::failure(id, 0, FailType::CheckFail));
        }
        let Some(mut sender) = self.state.account(&tx.from)? else {
            return Ok(TransactionReceipt::failure(id, 0, FailType::CheckFail));
        };
        if tx.fee < 0 || sender.gas < tx.fee {
            return Ok(TransactionReceipt::failure(id, 0, FailType::NoGas));
        }
        if tx.nonce != sender.nonce + 1 {
            return Ok(TransactionReceipt::failure(id, 0, FailType::InvalidNonce));
        }

        // The fee is burned and the nonce consumed even if dispatch fails.
        sender.gas -= tx.fee;
        sender.nonce = tx.nonce;
        self.state.store_account(&sender)?;
        self.header.total_fee += tx.fee;

        let applied = match tx.kind() {
            Some(TransactionKind::Transfer) => self.transfer(tx)?,
            Some(TransactionKind::ContractCall) => self.call_contract(tx).await?,
            Some(TransactionKind::Deploy) => self.deploy_contract(tx).await?,
            None => Err(FailType::InvalidAddress),
        };
        Ok(match applied {
            Ok(sub_transactions) => TransactionReceipt::success(id, tx.fee, sub_transactions),
            Err(fail_type) => TransactionReceipt::failure(id, tx.fee, fail_type),
        })
    }

    fn transfer(&mut self, tx: &Transaction) -> ChainResult<Applied> {
        let mut staged = Staged::default();
        let Some(sender) = staged.fetch(&self.state, &tx.from)? else {
            return Ok(Err(FailType::CheckFail));
        };
        if !sender.debit(&tx.token_address, tx.amount) {
            return Ok(Err(FailType::NoEnoughAmount));
        }
        let receiver = staged.fetch_or_create(&self.state, &tx.to)?;
        if !receiver.credit(&tx.token_address, tx.amount) {
            return Ok(Err(FailType::CheckFail));
        }
        staged.commit(&mut self.state)?;
        Ok(Ok(vec![direct_sub_transaction(tx)]))
    }

    async fn call_contract(&mut self, tx: &Transaction) -> ChainResult<Applied> {
        let Some((owner, sub_address)) = split_contract_address(&tx.to) else {
            return Ok(Err(FailType::InvalidContractAddress));
        };
        let mut staged = Staged::default();
        if staged.contract(&self.state, &owner, &sub_address)?.is_none() {
            return Ok(Err(FailType::InvalidContractAddress));
        }
        let Some(sender) = staged.fetch(&self.state, &tx.from)? else {
            return Ok(Err(FailType::CheckFail));
        };
        if !sender.debit(&tx.token_address, tx.amount) {
            return Ok(Err(FailType::NoEnoughAmount));
        }
        let Some(contract) = staged.contract(&self.state, &owner, &sub_address)? else {
            return Ok(Err(FailType::InvalidContractAddress));
        };
        if !contract.credit(&tx.token_address, tx.amount) {
            return Ok(Err(FailType::CheckFail));
        }

        let call = ContractCall {
            tx: tx.clone(),
            contract_address: tx.to.clone(),
            owner: owner.clone(),
            contract: contract.clone(),
            previous_hash: self.header.previous_hash.clone(),
        };
        let executor = self.executor.clone();
        let outcome = match run_bounded(self.contract_timeout, move || executor.call(&call)).await
        {
            Ok(outcome) => outcome,
            Err(ContractFailure::Timeout) => return Ok(Err(FailType::ContractTimeout)),
            Err(ContractFailure::Error(_)) => return Ok(Err(FailType::ContractError)),
        };
        if outcome
            .sub_transactions
            .iter()
            .any(|sub| sub.from != tx.to)
        {
            return Ok(Err(FailType::ContractError));
        }

        for sub in &outcome.sub_transactions {
            if !is_account_address(&sub.to) {
                return Ok(Err(FailType::CheckContractSubtxError));
            }
            let Some(contract) = staged.contract(&self.state, &owner, &sub_address)? else {
                return Ok(Err(FailType::InvalidContractAddress));
            };
            if !contract.debit(&sub.token_address, sub.amount) {
                return Ok(Err(FailType::CheckContractSubtxError));
            }
            let receiver = staged.fetch_or_create(&self.state, &sub.to)?;
            if !receiver.credit(&sub.token_address, sub.amount) {
                return Ok(Err(FailType::CheckContractSubtxError));
            }
        }
        if let Some(contract) = staged.contract(&self.state, &owner, &sub_address)? {
            contract.data = outcome.data;
        }
        staged.commit(&mut self.state)?;

        let mut sub_transactions = vec![direct_sub_transaction(tx)];
        sub_transactions.extend(outcome.sub_transactions);
        Ok(Ok(sub_transactions))
    }

    async fn deploy_contract(&mut self, tx: &Transaction) -> ChainResult<Applied> {
        let sub_address = derive_contract_address(&tx.from, tx.nonce);
        let mut staged = Staged::default();
        let Some(sender) = staged.fetch(&self.state, &tx.from)? else {
            return Ok(Err(FailType::CheckFail));
        };
        if sender.contracts.contains_key(&sub_address) {
            return Ok(Err(FailType::ContractUpgradeRefused));
        }

        let executor = self.executor.clone();
        let deploy_tx = tx.clone();
        let target = sub_address.clone();
        let deployed = match run_bounded(self.contract_timeout, move || {
            executor.deploy(&deploy_tx, &target)
        })
        .await
        {
            Ok(deployed) => deployed,
            Err(ContractFailure::Timeout) => return Ok(Err(FailType::ContractTimeout)),
            Err(ContractFailure::Error(_)) => return Ok(Err(FailType::InitContractAccountFail)),
        };

        let Some(sender) = staged.fetch(&self.state, &tx.from)? else {
            return Ok(Err(FailType::CheckFail));
        };
        if !sender.debit(&tx.token_address, tx.amount) {
            return Ok(Err(FailType::NoEnoughAmount));
        }
        let mut contract = ContractAccount {
            address: sub_address.clone(),
            code_hash: sha3_hex(deployed.code.as_bytes()),
            code: deployed.code,
            data: deployed.data,
            ..ContractAccount::default()
        };
        if !contract.credit(&tx.token_address, tx.amount) {
            return Ok(Err(FailType::InitContractAccountFail));
        }
        sender.contracts.insert(sub_address.clone(), contract);
        staged.commit(&mut self.state)?;

        Ok(Ok(vec![SubTransaction {
            parent: tx.id(),
            from: tx.from.clone(),
            to: format!("{}{}", tx.from, sub_address),
            amount: tx.amount,
            data: tx.data.clone(),
            token_address: tx.token_address.clone(),
        }]))
    }

    /// Credits the collected fees to the coinbase and seals the roots and set hashes.
    ///
    /// Blocks never register tokens, so the token root only changes through genesis.
    pub fn finalize(mut self) -> ChainResult<BuiltBlock> {
        if self.header.total_fee > 0 {
            let mut miner = self
                .state
                .account(&self.header.coinbase)?
                .unwrap_or_else(|| Account::new(self.header.coinbase.clone()));
            miner.credit(GAS_TOKEN, self.header.total_fee);
            self.state.store_account(&miner)?;
        }
        self.header.state_root = self.state.root_hex();
        self.header.token_root = self.tokens.root_hex();
        self.header.tx_set_hash = encode_set(&self.transactions).0;
        self.header.receipt_set_hash = encode_set(&self.receipts).0;
        Ok(BuiltBlock {
            header: self.header,
            transactions: self.transactions,
            receipts: self.receipts,
        })
    }
}

fn direct_sub_transaction(tx: &Transaction) -> SubTransaction {
    SubTransaction {
        parent: tx.id(),
        from: tx.from.clone(),
        to: tx.to.clone(),
        amount: tx.amount,
        data: tx.data.clone(),
        token_address: tx.token_address.clone(),
    }
}

/// Replays `transactions` on `parent` as proposed by `coinbase` at `timestamp`.
pub async fn replay(
    parent: &Header,
    coinbase: Address,
    timestamp: u64,
    transactions: &[Transaction],
    store: Arc<dyn NodeStore>,
    executor: Arc<dyn ContractExecutor>,
    contract_timeout: Duration,
) -> ChainResult<BuiltBlock> {
    let mut builder = BlockBuilder::new(parent, coinbase, timestamp, store, executor, contract_timeout)?;
    for tx in transactions {
        builder.apply(tx.clone()).await?;
    }
    builder.finalize()
}
