pub mod chain;
pub mod explorer;
pub mod ledger;
pub mod policy;

pub use chain::{ChainReader, ChainVerifier, RpcChainReader};
pub use explorer::{EtherscanExplorer, ExplorerApi};
pub use ledger::Ledger;
pub use policy::PolicyEngine;
