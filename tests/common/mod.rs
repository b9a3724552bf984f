//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use cpe_rs::{CollectionProcessingEngine, EngineState};
use std::time::Duration;

/// Upper bound for a test run to reach a terminal state
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Wait for the run to end, failing the test if it hangs
pub fn wait_for_end(engine: &CollectionProcessingEngine) -> EngineState {
    engine
        .wait_timeout(test_timeout())
        .unwrap_or_else(|| panic!("run did not end within {:?}", test_timeout()))
}

/// Poll `condition` until it holds or the timeout elapses
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + test_timeout();
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
