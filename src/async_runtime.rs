//! Tokio runtime construction.
//!
//! Generalizes the teacher crate's `bft::async_runtime::tokio::init`
//! (same builder shape, knobs, and thread stack size) into a
//! `RelayError`-returning wrapper, since this crate's error handling is
//! unified rather than `Result<_, ()>`.

use crate::error::RelayError;

pub type Runtime = tokio::runtime::Runtime;

/// Build a multi-threaded runtime with `num_threads` workers.
pub fn init(num_threads: usize) -> Result<Runtime, RelayError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_threads)
        .thread_name("swpt-relay-worker")
        .thread_stack_size(2 * 1024 * 1024)
        .enable_all()
        .build()
        .map_err(RelayError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_runtime_with_requested_worker_count() {
        let rt = init(2).unwrap();
        rt.block_on(async {
            assert_eq!(1 + 1, 2);
        });
    }
}
