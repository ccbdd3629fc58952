//! Audience access server.
//!
//! Decides, per (reader, content item) pair, whether access is granted and
//! why: an active subscription (`SUBSCRIBER`) or a one-time free metering
//! unlock (`METERING`). Readers authenticate with a signed third-party
//! identity token; unlock grants live in a client-held cookie keyed by an
//! HMAC of the (resource, subject) pair.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod membership;
pub mod registry;
pub mod verifier;
pub mod web;

#[cfg(feature = "testutil")]
pub mod testutil;
