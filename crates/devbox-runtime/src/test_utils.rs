//! Helpers for tests that need a real container engine.
use std::collections::{BTreeMap, HashMap};
use std::process::Command;

use crate::ContainerSpec;

/// Image used by Docker-backed tests; small and ships busybox `find`/`stat`.
pub const DEFAULT_TEST_IMAGE: &str = "alpine:3.19";

pub fn has_docker() -> bool {
    Command::new("docker")
        .arg("info")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn test_image() -> String {
    std::env::var("DEVBOX_TEST_IMAGE").unwrap_or_else(|_| DEFAULT_TEST_IMAGE.to_string())
}

/// Minimal spec labelled so leftovers can be found with `docker ps -a --filter label=devbox.test`.
pub fn test_spec(name: &str) -> ContainerSpec {
    ContainerSpec {
        name: name.to_string(),
        image: test_image(),
        cpu: 0.5,
        memory_mb: 256,
        disk_mb: 1024,
        env_vars: BTreeMap::from([("DEVBOX_TEST".to_string(), "1".to_string())]),
        workspace_root: "/workspace".to_string(),
        volume: None,
        network: None,
        internal_port: 8080,
        labels: HashMap::from([("devbox.test".to_string(), "true".to_string())]),
    }
}

/// Macro to skip tests when Docker isn't reachable
#[macro_export]
macro_rules! require_docker {
    () => {
        if !$crate::test_utils::has_docker() {
            eprintln!("Test ignored: Docker not available");
            return;
        }
    };
    ($ret:expr) => {
        if !$crate::test_utils::has_docker() {
            eprintln!("Test ignored: Docker not available");
            return $ret;
        }
    };
}
