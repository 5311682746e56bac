//! Transaction application shared by block production and validation.

mod apply;
mod contract;

pub use apply::{replay, BlockBuilder, BuiltBlock};
pub use contract::{
    derive_contract_address, run_bounded, BuiltinContracts, ContractCall, ContractExecutor,
    ContractFailure, ContractOutcome, DeployedContract,
};
