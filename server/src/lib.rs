//! # Subspace Session Server
//!
//! Authoritative server for shared-universe multiplayer spaceflight.
//! Connected players run their own simulations at independent time-warp
//! rates; the server partitions them into *subspaces* (shared
//! time-frames), relays vessel state between compatible frames and keeps
//! every subspace clock advancing monotonically.
//!
//! ## Architecture
//!
//! All universe and roster mutation happens on one drain loop
//! ([`orchestrator`]), which pulls decoded messages from every
//! connection through a single channel. Per-connection reader and
//! writer tasks ([`connection`]) only move bytes; anything they learn
//! (timeouts, protocol violations, closed sockets) is recorded on the
//! session and acted upon in the next reconciliation pass. This keeps
//! the synchronization bookkeeping in [`universe`] free of locks.
//!
//! ## Module Organization
//!
//! - [`connection`]: frame reassembly, read/write tasks, send batching
//! - [`session`]: per-connection state and the activity state machine
//! - [`registry`]: the session table, handshake negotiation, broadcast
//! - [`universe`]: subspaces, the object catalog, the replay log and
//!   update classification
//! - [`dispatcher`]: message handling and the reconciliation pass
//! - [`settings`]: the validated settings registry and per-capita
//!   scaling
//! - [`store`]: roster, access lists and object persistence
//! - [`orchestrator`]: listeners, worker tasks and the drain loop

pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod session;
pub mod settings;
pub mod store;
pub mod universe;
