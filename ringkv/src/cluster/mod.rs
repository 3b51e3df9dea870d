pub mod controller;
pub mod token_metadata;

#[cfg(test)]
mod controller_tests;

pub use controller::{OperationMode, RingController};
pub use token_metadata::{PendingRangeMap, RingState, TokenMetadata};
