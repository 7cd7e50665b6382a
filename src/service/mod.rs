//! CrudService: generic record access over registered descriptors.

mod crud;
mod validation;
pub use crud::CrudService;
pub use validation::{PreparedRecord, RecordValidator};
