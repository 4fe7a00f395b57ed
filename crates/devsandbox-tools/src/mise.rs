//! mise (dev tool version manager): expose the host's installed runtimes
//! read-only so `mise exec` works inside the sandbox without re-downloading
//! toolchains. Shims and new installs land in the per-project home.

use std::path::Path;

use devsandbox_core::{Binding, EnvVar, Shell};

use crate::Tool;

pub struct MiseTool;

impl MiseTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MiseTool {
    fn default() -> Self {
        Self::new()
    }
}

impl Tool for MiseTool {
    fn name(&self) -> &'static str {
        "mise"
    }

    fn available(&self, _home: &Path) -> bool {
        which::which("mise").is_ok()
    }

    fn bindings(&self, home: &Path, _sandbox_home: &Path) -> Vec<Binding> {
        vec![
            Binding::ro(home.join(".local/share/mise")).optional(),
            Binding::ro(home.join(".config/mise")).optional(),
        ]
    }

    fn environment(&self, _home: &Path, _sandbox_home: &Path) -> Vec<EnvVar> {
        Vec::new()
    }

    fn shell_init(&self, shell: Shell) -> Option<String> {
        Some(format!("eval \"$(mise activate {})\"", shell.name()))
    }
}
