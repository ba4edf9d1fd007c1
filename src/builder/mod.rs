//! Builder API for ergonomic state tree construction.
//!
//! [`StateBuilder`] collects a whole subtree (ports, outcomes, children,
//! transitions and data flows) and creates it in one go, referring to
//! children, ports and outcomes by name instead of by id.

pub mod error;
mod state;

pub use error::BuildError;
pub use state::{StateBuilder, SELF};
