pub mod status;

pub use status::{StatusPatch, StatusRecord, Versioned};
