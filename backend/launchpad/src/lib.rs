//! Creator launchpad: funding-proposal drafts and the orchestrated transition
//! that opens them for funding on the ledger.

pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod links;
pub mod manifest;
pub mod orchestrator;
pub mod params;
pub mod publisher;
pub mod readiness;
pub mod rpc;
pub mod rules;
pub mod saga;
pub mod signer;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod fixtures;
#[cfg(test)]
mod test_open_funding;
