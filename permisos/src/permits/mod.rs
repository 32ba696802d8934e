//! Permit application domain: the status lifecycle and everything that moves an application
//! along it.
//!
//! - [`status`] is the closed set of statuses and the adjacency table between them
//! - [`transitions`] applies a status change inside a caller's transaction and audits it
//! - [`issuer`] turns a paid application into a stored permit PDF
//! - [`expiry`] retires issued permits and unpaid OXXO vouchers once their dates pass
//! - [`storage`] and [`document`] hold the PDF rendering and the blob store behind it

pub mod document;
pub mod expiry;
pub mod issuer;
pub mod status;
pub mod storage;
pub mod transitions;
