//! Client-side synchronization core for the collaborative canvas.
//!
//! Each user session keeps an optimistic in-memory copy of the shared canvas,
//! pushes local edits to a change-feed backend, and reconciles remote changes
//! back into the copy. Around that loop sit advisory edit leases, grouped
//! undo/redo for manual and generated edits, and cursor presence. The UI,
//! the AI orchestrator, and project persistence all talk to one
//! [`session::CanvasSession`].
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`session`] | Per-canvas context object tying the components together |
//! | [`object`] | Canvas object model, validation, clamping, patches |
//! | [`store`] | Optimistic object store and pending-confirmation set |
//! | [`bridge`] | Outbound write worker and inbound reconcile loop |
//! | [`lock`] | Advisory edit leases with renewal |
//! | [`undo`] | Snapshot undo/redo grouped by operation id |
//! | [`presence`] | Online users and throttled cursors |
//! | [`feed`] | Change-feed contract with memory and Postgres backends |
//! | [`db`] | Postgres pool and embedded migrations |
//! | [`config`] | Environment-driven tuning |
//! | [`error`] | Shared error-code trait |

pub mod bridge;
pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod lock;
pub mod object;
pub mod presence;
pub mod session;
pub mod store;
pub mod undo;
