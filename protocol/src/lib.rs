//! Agent-facing broker surface.
//!
//! This crate turns the store trait family into the operation set transports
//! mount:
//!
//! - [`Broker`] - the [`broker_core::protocol::BrokerApi`] implementation
//! - [`TenantGuard`] - credential -> organization scope resolution and
//!   permission wildcard matching
//! - [`envelope`] - logical-failure envelope with agent guidance
//! - [`LeaseReclaimer`] / [`RecurrenceMaterializer`] - the periodic control
//!   loops, driven by a shared shutdown signal
//!
//! Transports (REST, MCP, ...) are external collaborators: they
//! authenticate, call the facade, and serialize results. Nothing in this
//! crate speaks HTTP.

pub mod auth;
pub mod error;
pub mod handler;
pub mod materializer;
pub mod reclaimer;

pub use auth::{check_permissions, has_permission, permission_matches, TenantGuard};
pub use error::envelope;
pub use handler::{Broker, DEFAULT_TASK_TIMEOUT_HOURS};
pub use materializer::{MaterializerConfig, RecurrenceMaterializer};
pub use reclaimer::{LeaseReclaimer, ReclaimerConfig};
