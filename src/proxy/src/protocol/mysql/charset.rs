/// Collation ids from the `SHOW COLLATION` catalog. Only the ones this proxy
/// advertises are kept.
pub const UTF8_GENERAL_CI: u8 = 33;
pub const UTF8_MB4_GENERAL_CI: u8 = 45;

pub const DEFAULT_COLLATION_ID: u8 = UTF8_GENERAL_CI;
