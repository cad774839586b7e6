// packages/engine/tests/common/mod.rs
//! Helpers shared by the integration tests

#![allow(dead_code)]

use kernel_eval_engine::utils::config::{KernelConfig, SessionConfig};
use kernel_eval_engine::{STARTUP_READ_TIMEOUT, TERMINATE_READ_TIMEOUT};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Kernel configuration pointing at the mock kernel binary
pub fn mock_kernel() -> KernelConfig {
    KernelConfig {
        path: env!("CARGO_BIN_EXE_mock-kernel").into(),
        args: vec![],
        env: HashMap::new(),
    }
}

/// Mock kernel with extra environment knobs
pub fn mock_kernel_with(env: &[(&str, &str)]) -> KernelConfig {
    let mut kernel = mock_kernel();
    for (key, value) in env {
        kernel.env.insert(key.to_string(), value.to_string());
    }
    kernel
}

/// Session timeouts short enough for tests
pub fn test_session_config() -> SessionConfig {
    SessionConfig::from_parameters([(STARTUP_READ_TIMEOUT, 10.0), (TERMINATE_READ_TIMEOUT, 1.0)])
        .expect("valid session parameters")
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
