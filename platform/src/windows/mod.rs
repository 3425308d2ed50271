pub mod elevation;
pub mod volumes;

pub use elevation::is_elevated;
pub use volumes::LogicalDriveTable;
