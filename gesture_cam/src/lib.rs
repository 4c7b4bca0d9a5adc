//! Camera front end of the gesture pipeline.
pub mod sensors;
pub mod shutdown;
pub mod snapshot;
