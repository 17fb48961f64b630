//! Database access layer: `FromRow` domain models and free query functions
//! over a shared `PgPool`. Counter updates are single arithmetic UPDATE
//! statements, relying on per-row atomicity instead of application locks.

pub mod agents;
pub mod models;
pub mod panels;
pub mod scope;
pub mod store;
pub mod users;

pub use models::{Agent, LinkTarget, LocalUser, Panel, SyncLink};
pub use scope::OwnerScope;
pub use store::{PgStore, Store};
