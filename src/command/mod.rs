//! Command executor.
//!
//! A command is exactly one remote call. [`CommandExecutor::execute`] runs it
//! under a fixed timeout and normalizes the outcome into a [`CommandResult`]:
//!
//! ```text
//! RemoteCall::call ── Ok(data) ─────────────────────────► Ok(data)
//!                  └─ Err(RemoteError) ─► ErrorKind ────► Err(CommandError { kind, message })
//!                                          └─ unauthorized ─► SessionContext::invalidate()
//! ```
//!
//! The concrete calls ([`FetchCollection`], [`FetchEntity`], [`PatchEntity`])
//! go through a [`JsonTransport`]; [`HttpTransport`] is the `reqwest`
//! implementation behind the `http` feature.

mod calls;
mod error;
mod executor;
#[cfg(feature = "http")]
mod http;

pub use calls::{
    FetchCollection, FetchEntity, JsonTransport, Method, PatchEntity, decode_collection,
    decode_entity,
};
pub use error::{CommandError, CommandResult, ErrorKind, RemoteError};
pub use executor::{CommandExecutor, RemoteCall};
#[cfg(feature = "http")]
pub use http::HttpTransport;
#[cfg(feature = "http")]
pub(crate) use http::{map_request_error, reject_status};
