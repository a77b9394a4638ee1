pub mod db;
pub mod error;
pub mod reference;

pub use db::{DeviceStore, InsertOutcome, StoreStats};
pub use error::RestartReason;
pub use reference::{ReferenceSource, ReferenceTable};
