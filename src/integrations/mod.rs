//! Typed adapters to external partners.
//!
//! One adapter per partner, all built on the same plumbing: token from the
//! vault, single 401 replay, classified errors, retry at the operation
//! boundary. Raw partner JSON never leaves this module — `mappers` converts
//! at the edge.

pub mod cardops;
pub mod crm;
pub mod http;
pub mod ledgerbooks;
pub mod mappers;

pub use cardops::CardOpsClient;
pub use crm::CrmClient;
pub use ledgerbooks::LedgerBooksClient;
