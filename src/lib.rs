//! Permissioned delegate blockchain node.
//!
//! A fixed set of delegates take turns proposing blocks on a fixed cadence.
//! Every other delegate replays a proposal against its own ledger state and
//! votes for it only if the resulting roots match; a block commits once more
//! than half of the delegates have voted. Nodes that fall behind catch up by
//! height through the synchronizer.
//!
//! Applications typically depend on [`config::NodeConfig`] to bootstrap a node
//! and on [`node::Node`] and [`node::NodeHandle`] to operate it. The `chain`,
//! `consensus`, `execution` and `pool` modules hold the replication engine;
//! `state` and `storage` hold persistent ledger data.

pub mod api;
pub mod chain;
pub mod client;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod errors;
pub mod execution;
pub mod node;
pub mod pool;
pub mod state;
pub mod status;
pub mod storage;
pub mod supervisor;
pub mod sync;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;
