/// hedge_engine — portfolio closure engine for a hedging-and-recovery
/// XAUUSD strategy. See SPEC_FULL.md for the module-by-module contract.
pub mod broker;
pub mod config;
pub mod cost;
pub mod evaluator;
pub mod executor;
pub mod hedge;
pub mod orchestrator;
pub mod purpose;
pub mod scorer;
pub mod state;
pub mod types;
pub mod zone;

pub use types::*;
