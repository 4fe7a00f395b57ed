pub mod cancel;
pub mod config;
pub mod error;
pub mod model;
pub mod project;

pub use cancel::CancelToken;
pub use error::LauncherError;
pub use model::{Binding, EnvVar, MountMode, MountRule, Shell};
pub use project::SandboxIdentity;
