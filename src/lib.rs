//! Aggregates VPN subscription links from a fleet of heterogeneous panels
//! behind one endpoint per subscriber, and enforces reseller quotas: usage
//! deltas are synced from every panel into local accumulators, and quota or
//! expiry exhaustion is pushed back out as remote disables, both per
//! subscriber and cascading from the reseller's own plan.

pub mod collector;
pub mod config;
pub mod db;
pub mod enforcement;
pub mod notifications;
pub mod panels;
pub mod web;
