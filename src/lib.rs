//! Cloud VM tag collector
//!
//! Polls AWS, Azure or GCP for virtual machines, groups their private
//! addresses by tag and keeps matching IP lists on a Forcepoint SMC in sync.

pub mod aggregate;
pub mod aws;
pub mod azure;
pub mod cli;
pub mod config;
pub mod error;
pub mod gcp;
pub mod inventory;
pub mod publish;
pub mod report;
pub mod smc;
pub mod sync;
