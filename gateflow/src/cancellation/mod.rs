//! Cooperative cancellation of runs and stage instances.

mod token;

pub use token::CancellationToken;
