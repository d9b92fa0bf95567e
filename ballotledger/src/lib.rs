#[macro_use]
extern crate serde;

#[macro_use]
extern crate log;

mod approval;
mod ballot;
mod canonical;
mod config;
mod encryption;
mod error;
mod gated;
mod kms;
mod ledger;
mod outcome;
mod results;
mod serde_hex;
mod service;
mod signing;
mod store;
mod token;

pub use approval::*;
pub use ballot::*;
pub use canonical::*;
pub use config::*;
pub use encryption::*;
pub use error::*;
pub use gated::*;
pub use kms::*;
pub use ledger::*;
pub use outcome::*;
pub use results::*;
pub use serde_hex::*;
pub use service::*;
pub use signing::*;
pub use store::*;
pub use token::*;

#[cfg(test)]
mod tests;
