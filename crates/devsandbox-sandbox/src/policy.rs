//! Security defaults: host paths that are never visible inside the sandbox.
//!
//! These are hides, not deny rules — each existing path is replaced by
//! `/dev/null` (files) or an empty tmpfs (directories) so readers see an
//! empty artifact and writers get a permission error. The mount compiler
//! emits them after every binding that could otherwise re-expose them.

/// Credential directories under `$HOME`.
pub const SECRET_CREDENTIAL_DIRS: &[&str] = &[".ssh", ".aws", ".gnupg"];

/// Credential files under `$HOME`.
pub const SECRET_CREDENTIAL_FILES: &[&str] = &[".netrc", ".docker/config.json", ".kube/config"];

/// Browser profile directories — cookies, saved passwords, session tokens.
pub const BROWSER_PROFILE_DIRS: &[&str] = &[
    ".mozilla",
    ".config/google-chrome",
    ".config/chromium",
    ".config/BraveSoftware",
];

/// Password-manager data stores.
pub const PASSWORD_STORE_DIRS: &[&str] = &[
    ".password-store",
    ".config/keepassxc",
    ".local/share/keyrings",
];

/// Shell and REPL history files — often contain pasted secrets.
pub const SHELL_HISTORY_FILES: &[&str] = &[
    ".bash_history",
    ".zsh_history",
    ".local/share/fish/fish_history",
    ".python_history",
    ".node_repl_history",
];

/// Dotenv patterns hidden directly under the project directory.
pub const PROJECT_ENV_GLOBS: &[&str] = &[".env", ".env.*"];

/// All `$HOME`-relative paths the security defaults hide.
pub fn secret_home_paths() -> Vec<&'static str> {
    let mut paths = Vec::new();
    paths.extend(SECRET_CREDENTIAL_DIRS);
    paths.extend(SECRET_CREDENTIAL_FILES);
    paths.extend(BROWSER_PROFILE_DIRS);
    paths.extend(PASSWORD_STORE_DIRS);
    paths.extend(SHELL_HISTORY_FILES);
    paths
}
