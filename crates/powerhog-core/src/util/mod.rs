//! Utility modules for powerhog.

mod privilege;
pub mod process_table;

pub use privilege::is_superuser;
pub use process_table::{ProcessTable, SystemProcessTable};
