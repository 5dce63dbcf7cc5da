//! # boardsync
//!
//! Client-side data synchronization core for work-management dashboards:
//! tickets, projects, bugs and calendar events kept consistent with a remote
//! source of truth.
//!
//! ## Overview
//!
//! - **Command Executor**: one remote call per command, fixed timeout, errors
//!   normalized to a small set of kinds
//! - **Polling Scheduler**: interval fetches with single-flight per request key
//! - **Push Subscriber**: server-to-client channel with unbounded exponential
//!   reconnect backoff
//! - **Reconciliation Store**: canonical entity cache merged from fetch results,
//!   with change observers
//! - **Mutation Coordinator**: optimistic local changes, confirmed or rolled back
//!
//! [`SyncCore`](live::SyncCore) wires them into live feeds. Push messages are
//! only invalidation hints; fetch results are the only writes the store trusts.
//!
//! ## Feature Flags
//!
//! - `http` (default): `reqwest` transport and server-sent events channel
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use boardsync::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::from_env()?;
//! let session = Arc::new(SessionContext::init(Arc::new(FileCredentialStore::new(
//!     &config.credential_file,
//! ))));
//! let core = SyncCore::new(config, Arc::clone(&session));
//!
//! let _feed = core.watch(LiveFeedSpec::new(EntityKind::Ticket).with_default_scopes(&session));
//! let key = EntityKey::new(EntityKind::Ticket, "t-1");
//! core.update(&key, EntityPatch::new().with_status(WorkStatus::Done)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::redundant_closure_for_method_calls)]

/// Prelude module for convenient imports.
///
/// # Usage
///
/// ```rust
/// use boardsync::prelude::*;
/// ```
pub mod prelude {
    pub use crate::command::{
        CommandError, CommandExecutor, CommandResult, ErrorKind, JsonTransport, RemoteCall,
    };
    pub use crate::config::SyncConfig;
    pub use crate::domain::{
        Entity, EntityId, EntityKey, EntityKind, EntityPatch, Priority, UserId, WorkStatus,
    };
    pub use crate::error::SyncError;
    pub use crate::fetch_key::{FetchKey, FetchParams};
    pub use crate::live::{LiveFeed, LiveFeedSpec, SyncCore};
    pub use crate::optimistic::{MutationCoordinator, OperationHandle, OperationStatus};
    pub use crate::polling::{PollHandle, PollOutcome, PollingScheduler};
    pub use crate::push::{
        ConnectionStatus, PushMessage, PushSubscriber, Subscription, TopicFilter,
    };
    pub use crate::session::{
        CredentialStore, FileCredentialStore, MemoryCredentialStore, SessionContext, SessionState,
    };
    pub use crate::store::{MergeReport, ReconciliationStore};
}

pub mod command;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch_key;
pub mod live;
pub mod optimistic;
pub mod polling;
pub mod push;
pub mod session;
pub mod store;
