//! Name-keyed tool registry.
//!
//! Populated explicitly at program start; write-once, read-only thereafter.
//! The registry stores factories rather than instances so the orchestrator
//! owns the mutable tool set for a run while registration stays immutable.

use std::collections::BTreeMap;
use std::path::Path;

use crate::Tool;

type ToolFactory = fn() -> Box<dyn Tool>;

#[derive(Default)]
pub struct Registry {
    factories: BTreeMap<&'static str, ToolFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in tool set.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("docker", || Box::new(crate::docker::DockerTool::new()));
        registry.register("git", || Box::new(crate::git::GitTool::new()));
        registry.register("mise", || Box::new(crate::mise::MiseTool::new()));
        registry.register("portal", || Box::new(crate::portal::PortalTool::new()));
        registry
    }

    /// Register a tool factory. Double registration is a programmer error.
    pub fn register(&mut self, name: &'static str, factory: ToolFactory) {
        if self.factories.insert(name, factory).is_some() {
            panic!("tool `{name}` registered twice");
        }
    }

    /// Registered names, sorted lexicographically.
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    /// Instantiate every registered tool, sorted by name so composition is
    /// deterministic.
    pub fn all(&self) -> Vec<Box<dyn Tool>> {
        self.factories.values().map(|factory| factory()).collect()
    }

    /// Instantiate only the tools whose availability probe passes.
    pub fn available(&self, home: &Path) -> Vec<Box<dyn Tool>> {
        self.all()
            .into_iter()
            .filter(|tool| tool.available(home))
            .collect()
    }
}
