//! Local CLI command handlers.

pub mod index;
pub mod info;

pub use index::{IndexCommandInput, run_index};
pub use info::run_info;
