//! # grid-id
//!
//! Identifiers minted by the grid arbiter.
//!
//! Every generated identifier has the shape `{prefix}_{ulid}`:
//! - `wkr_01HV4Z2WQXKJNM8GPQY6VBKC3D` names an anonymous worker handle
//! - `job_01HV4Z3MXNKPQR9HSTZ7WCLD4E` identifies a job the arbiter created
//!
//! Callers may still hand the arbiter their own free-form job ids and worker
//! names; these types are only used for values the arbiter generates itself,
//! and to recognise them again (for example when adopting a worker that is
//! already running a job after a restart).

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export so the macro expansion can name the ULID type.
pub use ulid::Ulid;
