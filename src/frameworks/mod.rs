//! Frameworks shipped with the binary.

pub mod echo;

use std::sync::Arc;

use crate::unit::Frameworks;

/// Registry with every built-in framework.
pub fn builtin() -> Frameworks {
    let mut frameworks = Frameworks::new();
    frameworks.register("echo", Arc::new(echo::EchoFramework));
    frameworks
}
