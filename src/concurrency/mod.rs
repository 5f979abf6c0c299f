pub mod state_lock;

pub use state_lock::{StateLock, StateLockGuard};
