pub mod dead_letter;
pub mod detector;
pub mod inference;
pub mod queue;
pub mod result_store;
pub mod retry;
pub mod status;
pub mod storage;
