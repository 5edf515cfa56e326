//! Shared helpers for the Trellis workspace: sensitive-value masking used
//! before variables reach any log sink, and lexical path containment used by
//! the call sandbox.

pub mod masking;
pub mod paths;

pub use masking::{is_internal_env_key, is_sensitive_key, mask_value};
pub use paths::{normalize_lexically, path_is_contained};
