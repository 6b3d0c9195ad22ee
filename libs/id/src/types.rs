//! Identifier families used by the arbiter.

use crate::define_id;

// Generated names for anonymous (transient and leased) worker handles.
define_id!(WorkerId, "wkr");

// Arbiter-generated job identifiers.
define_id!(JobId, "job");
