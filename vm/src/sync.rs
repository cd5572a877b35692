pub mod mutex;
pub mod scheduler;
