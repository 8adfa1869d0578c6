mod versioned_schema;

pub use versioned_schema::*;

/// Offset added to schema versions when written to `PRAGMA user_version`,
/// so a database created by another tool is never mistaken for ours.
pub const BASE_DB_VERSION: usize = 77000;
