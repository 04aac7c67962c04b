pub mod detection;
pub mod frame;
pub mod job;
pub mod outcome;
pub mod status;
