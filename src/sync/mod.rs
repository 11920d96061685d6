pub mod lifo;
pub mod monitor;
pub mod semaphore;
