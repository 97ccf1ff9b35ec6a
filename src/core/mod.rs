pub mod cancel;
pub mod errors;
pub mod types;
