//! Mount policy compiler.
//!
//! Turns bindings (tool-contributed and user-defined) plus the security
//! defaults into one totally ordered sequence of filesystem and environment
//! operations for the bwrap runner. Guarantees, in order of importance:
//! secrets are never exposed, no operation conflicts with a later one in a
//! way the runner cannot resolve, and the output is deterministic for fixed
//! inputs.
//!
//! Precedence (strict): base system read-only binds, ephemeral tmp,
//! sandbox home at `$HOME`, tool bindings (by tool name, first declaration
//! wins across tools), the project bind, user mount rules in config order,
//! security-default hides, environment mutations. Operations whose
//! destination lies inside the project subtree are deferred until after
//! the project bind so the runner sees them in an applicable order.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use devsandbox_core::{Binding, EnvVar, LauncherError, MountMode, MountRule, SandboxIdentity};

use crate::policy;

/// Base system paths bound read-only when present. `/bin` and friends are
/// symlinks on merged-usr hosts and are recreated as symlinks instead.
const BASE_SYSTEM_PATHS: &[&str] = &[
    "/usr",
    "/bin",
    "/sbin",
    "/lib",
    "/lib32",
    "/lib64",
    "/etc/ssl",
    "/etc/resolv.conf",
    "/etc/hosts",
    "/etc/passwd",
    "/etc/group",
];

/// XDG base directories created inside the sandbox home.
const HOME_SKELETON_DIRS: &[&str] = &[".config", ".local/share", ".local/state", ".cache"];

/// One operation the sandbox runner executes. The sequence order is the
/// execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOp {
    BindRw { src: PathBuf, dst: PathBuf },
    BindRo { src: PathBuf, dst: PathBuf },
    Tmpfs { dst: PathBuf },
    TmpfsOverlay { src: PathBuf, dst: PathBuf },
    PersistentOverlay { src: PathBuf, dst: PathBuf, upper: PathBuf },
    DevNullOver { dst: PathBuf },
    Mkdir { dst: PathBuf },
    Symlink { target: PathBuf, dst: PathBuf },
    SetEnv { name: String, value: String },
    UnsetEnv { name: String },
}

impl MountOp {
    /// Destination this operation claims in the mount tree, if any.
    pub fn dest(&self) -> Option<&Path> {
        match self {
            MountOp::BindRw { dst, .. }
            | MountOp::BindRo { dst, .. }
            | MountOp::Tmpfs { dst }
            | MountOp::TmpfsOverlay { dst, .. }
            | MountOp::PersistentOverlay { dst, .. }
            | MountOp::DevNullOver { dst }
            | MountOp::Mkdir { dst }
            | MountOp::Symlink { dst, .. } => Some(dst),
            MountOp::SetEnv { .. } | MountOp::UnsetEnv { .. } => None,
        }
    }

    /// Short operation name, used in conflict diagnostics.
    pub fn intent(&self) -> &'static str {
        match self {
            MountOp::BindRw { .. } => "bind_rw",
            MountOp::BindRo { .. } => "bind_ro",
            MountOp::Tmpfs { .. } => "tmpfs",
            MountOp::TmpfsOverlay { .. } => "tmpfs_overlay",
            MountOp::PersistentOverlay { .. } => "persistent_overlay",
            MountOp::DevNullOver { .. } => "dev_null_over",
            MountOp::Mkdir { .. } => "mkdir",
            MountOp::Symlink { .. } => "symlink",
            MountOp::SetEnv { .. } => "set_env",
            MountOp::UnsetEnv { .. } => "unset_env",
        }
    }

    /// Whether this op replaces its destination with an empty artifact.
    fn is_hide(&self) -> bool {
        matches!(self, MountOp::DevNullOver { .. } | MountOp::Tmpfs { .. })
    }
}

impl fmt::Display for MountOp {
    /// Canonical one-line rendering; also the fingerprint input.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountOp::BindRw { src, dst } => {
                write!(f, "bind_rw({}, {})", src.display(), dst.display())
            }
            MountOp::BindRo { src, dst } => {
                write!(f, "bind_ro({}, {})", src.display(), dst.display())
            }
            MountOp::Tmpfs { dst } => write!(f, "tmpfs({})", dst.display()),
            MountOp::TmpfsOverlay { src, dst } => {
                write!(f, "tmpfs_overlay({}, {})", src.display(), dst.display())
            }
            MountOp::PersistentOverlay { src, dst, upper } => write!(
                f,
                "persistent_overlay({}, {}, {})",
                src.display(),
                dst.display(),
                upper.display()
            ),
            MountOp::DevNullOver { dst } => write!(f, "dev_null_over({})", dst.display()),
            MountOp::Mkdir { dst } => write!(f, "mkdir({})", dst.display()),
            MountOp::Symlink { target, dst } => {
                write!(f, "symlink({}, {})", target.display(), dst.display())
            }
            MountOp::SetEnv { name, value } => write!(f, "set_env({name}, {value})"),
            MountOp::UnsetEnv { name } => write!(f, "unset_env({name})"),
        }
    }
}

/// Compiler inputs for one run.
pub struct CompileRequest<'a> {
    pub identity: &'a SandboxIdentity,
    /// Host home directory; also the in-sandbox `$HOME`.
    pub home: &'a Path,
    /// `(tool name, bindings)` — sorted by tool name by the compiler.
    pub tool_bindings: &'a [(String, Vec<Binding>)],
    /// User mount rules, in configuration order.
    pub user_rules: &'a [MountRule],
    /// Environment injected after the default set, in order.
    pub env: &'a [EnvVar],
    /// Variables removed from the target environment.
    pub unset_env: &'a [String],
}

/// Compilation result: the ordered op sequence, non-fatal diagnostics, and
/// a stable fingerprint over the canonicalized sequence.
#[derive(Debug)]
pub struct CompileOutput {
    pub ops: Vec<MountOp>,
    pub warnings: Vec<String>,
    pub fingerprint: String,
}

pub fn compile(req: &CompileRequest<'_>) -> Result<CompileOutput, LauncherError> {
    let mut fs = HostFs::new();
    let mut sink = OpSink::new();
    let project = &req.identity.project_dir;

    // 1. Base system, read-only. Merged-usr directories (/bin -> usr/bin)
    // are recreated as symlinks; anything else that is a symlink on the
    // host (like /etc/resolv.conf on systemd-resolved hosts) is bound so
    // its content is visible.
    const MERGED_USR_DIRS: &[&str] = &["/bin", "/sbin", "/lib", "/lib32", "/lib64"];
    for path in BASE_SYSTEM_PATHS {
        let path = Path::new(path);
        match fs.kind(path) {
            Some(PathKind::Symlink(target))
                if MERGED_USR_DIRS.iter().any(|dir| Path::new(dir) == path) =>
            {
                sink.add_mount(MountOp::Symlink {
                    target,
                    dst: path.to_path_buf(),
                })
            }
            Some(_) => sink.add_mount(MountOp::BindRo {
                src: path.to_path_buf(),
                dst: path.to_path_buf(),
            }),
            None => {}
        }
    }

    // 2. Ephemeral scratch space. /dev, /proc and /sys are the runner's
    // own conventions and not part of the compiled sequence.
    sink.add_mount(MountOp::Tmpfs {
        dst: PathBuf::from("/tmp"),
    });
    sink.add_mount(MountOp::Tmpfs {
        dst: PathBuf::from("/var/tmp"),
    });

    // 3. The per-project home, plus its XDG skeleton.
    sink.add_mount(MountOp::BindRw {
        src: req.identity.sandbox_home.clone(),
        dst: req.home.to_path_buf(),
    });
    for dir in HOME_SKELETON_DIRS {
        sink.add_mount(MountOp::Mkdir {
            dst: req.home.join(dir),
        });
    }

    // 4. Tool bindings, by tool name; destinations inside the project
    // subtree are deferred behind the project bind (phase B).
    let mut tool_bindings: Vec<&(String, Vec<Binding>)> = req.tool_bindings.iter().collect();
    tool_bindings.sort_by(|a, b| a.0.cmp(&b.0));
    let mut deferred: Vec<MountOp> = Vec::new();
    for (tool, bindings) in tool_bindings {
        for binding in merge_tool_bindings(bindings) {
            if !fs.exists(&binding.source) {
                if !binding.optional {
                    sink.warnings.push(format!(
                        "tool {tool}: source {} does not exist, binding skipped",
                        binding.source.display()
                    ));
                }
                continue;
            }
            let op = binding_to_op(&binding, req.identity, &mut fs);
            if op.dest().is_some_and(|d| d.starts_with(project)) {
                deferred.push(op);
            } else {
                sink.add_mount(op);
            }
        }
    }

    // 5. The project directory itself, then the deferred project-subtree
    // operations in their original order.
    sink.add_mount(MountOp::BindRw {
        src: project.clone(),
        dst: project.clone(),
    });
    for op in deferred {
        sink.add_mount(op);
    }

    // 6. User mount rules, in configuration order.
    for rule in req.user_rules {
        for source in expand_rule(rule, req.home, &mut fs) {
            let binding = Binding::new(source, rule.mode);
            let op = binding_to_op(&binding, req.identity, &mut fs);
            sink.add_mount(op);
        }
    }

    // 7. Security-default hides. Emitted last among mounts so they sit
    // after anything that could have re-exposed them; an explicit binding
    // on one of these destinations is fatal, not droppable.
    for rel in policy::secret_home_paths() {
        let host = req.home.join(rel);
        let op = match fs.kind(&host) {
            None => continue,
            Some(PathKind::Dir) => MountOp::Tmpfs { dst: host },
            Some(_) => MountOp::DevNullOver { dst: host },
        };
        sink.add_hide(op)?;
    }
    for pattern in policy::PROJECT_ENV_GLOBS {
        for found in fs.glob(&project.join(pattern).to_string_lossy()) {
            let op = match fs.kind(&found) {
                Some(PathKind::Dir) => MountOp::Tmpfs { dst: found },
                Some(_) => MountOp::DevNullOver { dst: found },
                None => continue,
            };
            sink.add_hide(op)?;
        }
    }

    // 8. Environment. Defaults first, then callers' additions in order;
    // the runner applies them sequentially, so later wins.
    for op in default_env(req.home, project) {
        sink.ops.push(op);
    }
    for var in req.env {
        let value = match (&var.value, var.from_host) {
            (Some(v), _) => v.clone(),
            (None, true) => match std::env::var(&var.name) {
                Ok(v) => v,
                Err(_) => continue,
            },
            (None, false) => continue,
        };
        sink.ops.push(MountOp::SetEnv {
            name: var.name.clone(),
            value,
        });
    }
    for name in req.unset_env {
        sink.ops.push(MountOp::UnsetEnv { name: name.clone() });
    }

    let fingerprint = fingerprint(&sink.ops);
    Ok(CompileOutput {
        ops: sink.ops,
        warnings: sink.warnings,
        fingerprint,
    })
}

/// Default environment of every sandbox.
fn default_env(home: &Path, project: &Path) -> Vec<MountOp> {
    let set = |name: &str, value: String| MountOp::SetEnv {
        name: name.to_string(),
        value,
    };
    let mut ops = vec![
        set("HOME", home.display().to_string()),
        set("DEVSANDBOX", "1".to_string()),
        set("DEVSANDBOX_PROJECT", project.display().to_string()),
        set("XDG_CONFIG_HOME", home.join(".config").display().to_string()),
        set(
            "XDG_DATA_HOME",
            home.join(".local/share").display().to_string(),
        ),
        set(
            "XDG_STATE_HOME",
            home.join(".local/state").display().to_string(),
        ),
        set("XDG_CACHE_HOME", home.join(".cache").display().to_string()),
    ];
    for name in ["PATH", "TERM", "LANG", "USER", "LOGNAME", "SHELL"] {
        if let Ok(value) = std::env::var(name) {
            ops.push(set(name, value));
        }
    }
    ops
}

/// SHA-256 over the canonical rendering of the sequence.
fn fingerprint(ops: &[MountOp]) -> String {
    let mut hasher = Sha256::new();
    for op in ops {
        hasher.update(op.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Within one tool's own contributions, read-write wins over read-only for
/// the same destination; duplicates collapse to the first occurrence.
fn merge_tool_bindings(bindings: &[Binding]) -> Vec<Binding> {
    let mut merged: Vec<Binding> = Vec::with_capacity(bindings.len());
    for binding in bindings {
        if let Some(existing) = merged
            .iter_mut()
            .find(|b| b.dest_path() == binding.dest_path())
        {
            if existing.mode == MountMode::ReadOnly && binding.mode == MountMode::ReadWrite {
                *existing = binding.clone();
            }
            continue;
        }
        merged.push(binding.clone());
    }
    merged
}

fn binding_to_op(binding: &Binding, identity: &SandboxIdentity, fs: &mut HostFs) -> MountOp {
    let src = binding.source.clone();
    let dst = binding.dest_path().to_path_buf();
    match binding.mode {
        MountMode::ReadWrite => MountOp::BindRw { src, dst },
        MountMode::ReadOnly => MountOp::BindRo { src, dst },
        MountMode::TmpOverlay => MountOp::TmpfsOverlay { src, dst },
        MountMode::Overlay => {
            let upper = identity.overlay_upper_dir(&dst);
            MountOp::PersistentOverlay { src, dst, upper }
        }
        MountMode::Hidden => {
            if fs.is_dir(&binding.source) {
                MountOp::Tmpfs { dst }
            } else {
                MountOp::DevNullOver { dst }
            }
        }
    }
}

/// Materialize a user rule into zero or more source paths. A glob that
/// matches nothing contributes nothing, silently; a non-glob pattern whose
/// path does not exist is silently skipped.
fn expand_rule(rule: &MountRule, home: &Path, fs: &mut HostFs) -> Vec<PathBuf> {
    let pattern = if let Some(rest) = rule.pattern.strip_prefix("~/") {
        home.join(rest).to_string_lossy().into_owned()
    } else if rule.pattern == "~" {
        home.to_string_lossy().into_owned()
    } else {
        rule.pattern.clone()
    };

    if rule.is_glob() {
        fs.glob(&pattern)
    } else {
        let path = PathBuf::from(pattern);
        if fs.exists(&path) {
            vec![path]
        } else {
            Vec::new()
        }
    }
}

/// Ordered op accumulator with first-declaration-wins conflict handling.
struct OpSink {
    ops: Vec<MountOp>,
    warnings: Vec<String>,
    claimed: HashMap<PathBuf, usize>,
}

impl OpSink {
    fn new() -> Self {
        Self {
            ops: Vec::new(),
            warnings: Vec::new(),
            claimed: HashMap::new(),
        }
    }

    /// Add a mount-tree operation. On a destination conflict the earlier
    /// operation wins; an identical later operation is a silent no-op, a
    /// conflicting one is dropped with a warning.
    fn add_mount(&mut self, op: MountOp) {
        let Some(dest) = op.dest().map(Path::to_path_buf) else {
            self.ops.push(op);
            return;
        };
        if let Some(&index) = self.claimed.get(&dest) {
            let existing = &self.ops[index];
            if *existing == op {
                return;
            }
            self.warnings.push(format!(
                "mount conflict on {}: {} dropped ({} wins)",
                dest.display(),
                op.intent(),
                existing.intent()
            ));
            return;
        }
        self.claimed.insert(dest, self.ops.len());
        self.ops.push(op);
    }

    /// Add a security-default hide. A prior claim on the same destination
    /// cannot be resolved by dropping the hide — that is a fatal conflict.
    fn add_hide(&mut self, op: MountOp) -> Result<(), LauncherError> {
        debug_assert!(op.is_hide());
        let dest = op
            .dest()
            .map(Path::to_path_buf)
            .expect("hide ops always carry a destination");
        if let Some(&index) = self.claimed.get(&dest) {
            let existing = &self.ops[index];
            if *existing == op {
                return Ok(());
            }
            return Err(LauncherError::MountConflict {
                dest,
                detail: format!(
                    "{} conflicts with a security-default hide",
                    existing.intent()
                ),
            });
        }
        self.claimed.insert(dest, self.ops.len());
        self.ops.push(op);
        Ok(())
    }
}

/// Host filesystem view for one compile: each path is stat'ed at most once
/// so the compiler sees an immutable snapshot and the syscall count stays
/// bounded.
struct HostFs {
    cache: HashMap<PathBuf, Option<PathKind>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathKind {
    File,
    Dir,
    Symlink(PathBuf),
}

impl HostFs {
    fn new() -> Self {
        Self {
            cache: HashMap::new(),
        }
    }

    fn kind(&mut self, path: &Path) -> Option<PathKind> {
        if let Some(cached) = self.cache.get(path) {
            return cached.clone();
        }
        let kind = std::fs::symlink_metadata(path).ok().map(|meta| {
            if meta.file_type().is_symlink() {
                let target = std::fs::read_link(path).unwrap_or_else(|_| path.to_path_buf());
                PathKind::Symlink(target)
            } else if meta.is_dir() {
                PathKind::Dir
            } else {
                PathKind::File
            }
        });
        self.cache.insert(path.to_path_buf(), kind.clone());
        kind
    }

    fn exists(&mut self, path: &Path) -> bool {
        self.kind(path).is_some()
    }

    fn is_dir(&mut self, path: &Path) -> bool {
        matches!(self.kind(path), Some(PathKind::Dir))
    }

    /// Expand a glob against the host filesystem. Results are sorted for
    /// determinism; an invalid or empty pattern yields nothing.
    fn glob(&mut self, pattern: &str) -> Vec<PathBuf> {
        let Ok(paths) = glob::glob(pattern) else {
            return Vec::new();
        };
        let mut found: Vec<PathBuf> = paths.flatten().collect();
        found.sort();
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devsandbox_core::MountMode;
    use std::fs;

    struct Fixture {
        _tmp: tempfile::TempDir,
        identity: SandboxIdentity,
        home: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::TempDir::new().unwrap();
        let home = tmp.path().join("home");
        let project = tmp.path().join("home/dev/api");
        fs::create_dir_all(&project).unwrap();
        let identity = SandboxIdentity::resolve_in(&project, &tmp.path().join("data"));
        identity.ensure_layout().unwrap();
        Fixture {
            _tmp: tmp,
            identity,
            home,
        }
    }

    fn compile_with(
        fx: &Fixture,
        tool_bindings: &[(String, Vec<Binding>)],
        user_rules: &[MountRule],
    ) -> Result<CompileOutput, LauncherError> {
        compile(&CompileRequest {
            identity: &fx.identity,
            home: &fx.home,
            tool_bindings,
            user_rules,
            env: &[],
            unset_env: &[],
        })
    }

    fn index_of(ops: &[MountOp], pred: impl Fn(&MountOp) -> bool) -> usize {
        ops.iter().position(pred).expect("op not found")
    }

    #[test]
    fn base_order_holds() {
        let fx = fixture();
        let out = compile_with(&fx, &[], &[]).unwrap();

        let usr = index_of(&out.ops, |op| {
            matches!(op, MountOp::BindRo { dst, .. } if dst == Path::new("/usr"))
        });
        let tmp = index_of(&out.ops, |op| {
            matches!(op, MountOp::Tmpfs { dst } if dst == Path::new("/tmp"))
        });
        let home = index_of(&out.ops, |op| {
            matches!(op, MountOp::BindRw { dst, .. } if dst == &fx.home)
        });
        let project = index_of(&out.ops, |op| {
            matches!(op, MountOp::BindRw { dst, .. } if dst == &fx.identity.project_dir)
        });
        assert!(usr < tmp && tmp < home && home < project);

        // Environment mutations come after every mount operation.
        let first_env = index_of(&out.ops, |op| matches!(op, MountOp::SetEnv { .. }));
        assert!(out.ops[first_env..]
            .iter()
            .all(|op| matches!(op, MountOp::SetEnv { .. } | MountOp::UnsetEnv { .. })));
    }

    #[test]
    fn default_env_is_injected() {
        let fx = fixture();
        let out = compile_with(&fx, &[], &[]).unwrap();
        let has = |name: &str, want: &str| {
            out.ops.iter().any(|op| {
                matches!(op, MountOp::SetEnv { name: n, value } if n == name && value == want)
            })
        };
        assert!(has("DEVSANDBOX", "1"));
        assert!(has(
            "DEVSANDBOX_PROJECT",
            &fx.identity.project_dir.display().to_string()
        ));
        assert!(has(
            "XDG_CACHE_HOME",
            &fx.home.join(".cache").display().to_string()
        ));
    }

    #[test]
    fn tool_bindings_sorted_and_first_declaration_wins() {
        let fx = fixture();
        let shared = fx.home.join("shared");
        fs::create_dir_all(&shared).unwrap();

        let tools = vec![
            (
                "zig".to_string(),
                vec![Binding::rw(shared.clone())],
            ),
            (
                "ansible".to_string(),
                vec![Binding::ro(shared.clone())],
            ),
        ];
        let out = compile_with(&fx, &tools, &[]).unwrap();

        // ansible sorts first, so its read-only claim wins; zig's is
        // dropped with a diagnostic.
        assert!(out
            .ops
            .iter()
            .any(|op| matches!(op, MountOp::BindRo { dst, .. } if dst == &shared)));
        assert!(!out
            .ops
            .iter()
            .any(|op| matches!(op, MountOp::BindRw { dst, .. } if dst == &shared)));
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("bind_rw dropped"));
    }

    #[test]
    fn rw_wins_over_ro_within_one_tool() {
        let fx = fixture();
        let cache = fx.home.join("cache");
        fs::create_dir_all(&cache).unwrap();

        let tools = vec![(
            "cargo".to_string(),
            vec![Binding::ro(cache.clone()), Binding::rw(cache.clone())],
        )];
        let out = compile_with(&fx, &tools, &[]).unwrap();
        assert!(out
            .ops
            .iter()
            .any(|op| matches!(op, MountOp::BindRw { dst, .. } if dst == &cache)));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn project_internal_tool_binding_is_deferred() {
        let fx = fixture();
        let vendor = fx.identity.project_dir.join("vendor");
        fs::create_dir_all(&vendor).unwrap();

        let tools = vec![("composer".to_string(), vec![Binding::ro(vendor.clone())])];
        let out = compile_with(&fx, &tools, &[]).unwrap();

        let project = index_of(&out.ops, |op| {
            matches!(op, MountOp::BindRw { dst, .. } if dst == &fx.identity.project_dir)
        });
        let vendor_op = index_of(&out.ops, |op| {
            matches!(op, MountOp::BindRo { dst, .. } if dst == &vendor)
        });
        assert!(vendor_op > project, "phase B op must follow the project bind");
    }

    #[test]
    fn duplicate_user_rules_warn_and_first_wins() {
        let fx = fixture();
        let vendor = fx.identity.project_dir.join("vendor");
        fs::create_dir_all(&vendor).unwrap();
        let pattern = vendor.to_string_lossy().into_owned();

        let rules = vec![
            MountRule {
                pattern: pattern.clone(),
                mode: MountMode::ReadOnly,
            },
            MountRule {
                pattern,
                mode: MountMode::ReadWrite,
            },
        ];
        let out = compile_with(&fx, &[], &rules).unwrap();

        let claims: Vec<&MountOp> = out
            .ops
            .iter()
            .filter(|op| op.dest() == Some(vendor.as_path()))
            .collect();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].intent(), "bind_ro");
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains(&vendor.display().to_string()));
    }

    #[test]
    fn identical_duplicate_is_silent() {
        let fx = fixture();
        let vendor = fx.identity.project_dir.join("vendor");
        fs::create_dir_all(&vendor).unwrap();
        let pattern = vendor.to_string_lossy().into_owned();

        let rules = vec![
            MountRule {
                pattern: pattern.clone(),
                mode: MountMode::ReadOnly,
            },
            MountRule {
                pattern,
                mode: MountMode::ReadOnly,
            },
        ];
        let out = compile_with(&fx, &[], &rules).unwrap();
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn empty_glob_is_silent() {
        let fx = fixture();
        let rules = vec![MountRule {
            pattern: format!("{}/nothing-here-*", fx.identity.project_dir.display()),
            mode: MountMode::ReadOnly,
        }];
        let before = compile_with(&fx, &[], &[]).unwrap();
        let after = compile_with(&fx, &[], &rules).unwrap();
        assert_eq!(before.ops.len(), after.ops.len());
        assert!(after.warnings.is_empty());
    }

    #[test]
    fn missing_non_glob_rule_is_skipped() {
        let fx = fixture();
        let rules = vec![MountRule {
            pattern: format!("{}/does-not-exist", fx.identity.project_dir.display()),
            mode: MountMode::ReadWrite,
        }];
        let out = compile_with(&fx, &[], &rules).unwrap();
        assert!(out.warnings.is_empty());
        assert!(!out
            .ops
            .iter()
            .any(|op| op.dest().is_some_and(|d| d.ends_with("does-not-exist"))));
    }

    #[test]
    fn glob_rules_expand_and_stay_sorted() {
        let fx = fixture();
        for name in ["b-data", "a-data"] {
            fs::create_dir_all(fx.identity.project_dir.join(name)).unwrap();
        }
        let rules = vec![MountRule {
            pattern: format!("{}/[ab]-data", fx.identity.project_dir.display()),
            mode: MountMode::ReadOnly,
        }];
        let out = compile_with(&fx, &[], &rules).unwrap();
        let a = index_of(&out.ops, |op| {
            op.dest().is_some_and(|d| d.ends_with("a-data"))
        });
        let b = index_of(&out.ops, |op| {
            op.dest().is_some_and(|d| d.ends_with("b-data"))
        });
        assert!(a < b);
    }

    #[test]
    fn tilde_rules_resolve_against_home() {
        let fx = fixture();
        let notes = fx.home.join("notes");
        fs::create_dir_all(&notes).unwrap();
        let rules = vec![MountRule {
            pattern: "~/notes".into(),
            mode: MountMode::ReadOnly,
        }];
        let out = compile_with(&fx, &[], &rules).unwrap();
        assert!(out
            .ops
            .iter()
            .any(|op| matches!(op, MountOp::BindRo { dst, .. } if dst == &notes)));
    }

    #[test]
    fn overlay_modes_map_to_their_ops() {
        let fx = fixture();
        let node_modules = fx.identity.project_dir.join("node_modules");
        let target = fx.identity.project_dir.join("target");
        fs::create_dir_all(&node_modules).unwrap();
        fs::create_dir_all(&target).unwrap();

        let rules = vec![
            MountRule {
                pattern: node_modules.to_string_lossy().into_owned(),
                mode: MountMode::TmpOverlay,
            },
            MountRule {
                pattern: target.to_string_lossy().into_owned(),
                mode: MountMode::Overlay,
            },
        ];
        let out = compile_with(&fx, &[], &rules).unwrap();
        assert!(out
            .ops
            .iter()
            .any(|op| matches!(op, MountOp::TmpfsOverlay { dst, .. } if dst == &node_modules)));
        let upper = out
            .ops
            .iter()
            .find_map(|op| match op {
                MountOp::PersistentOverlay { dst, upper, .. } if dst == &target => Some(upper),
                _ => None,
            })
            .expect("persistent overlay op");
        assert!(upper.starts_with(fx.identity.overlays_dir()));
    }

    #[test]
    fn secret_hides_exist_and_terminate() {
        let fx = fixture();
        fs::create_dir_all(fx.home.join(".ssh")).unwrap();
        fs::create_dir_all(fx.home.join(".aws")).unwrap();
        fs::write(fx.home.join(".netrc"), "machine x login y").unwrap();

        let cache = fx.home.join("cache");
        fs::create_dir_all(&cache).unwrap();
        let tools = vec![("cargo".to_string(), vec![Binding::rw(cache)])];
        let out = compile_with(&fx, &tools, &[]).unwrap();

        let last_binding = out
            .ops
            .iter()
            .rposition(|op| matches!(op, MountOp::BindRw { .. } | MountOp::BindRo { .. }))
            .unwrap();
        let ssh = index_of(&out.ops, |op| {
            matches!(op, MountOp::Tmpfs { dst } if dst == &fx.home.join(".ssh"))
        });
        let netrc = index_of(&out.ops, |op| {
            matches!(op, MountOp::DevNullOver { dst } if dst == &fx.home.join(".netrc"))
        });
        assert!(ssh > last_binding);
        assert!(netrc > last_binding);

        // Secrets absent from the host contribute no op at all.
        assert!(!out
            .ops
            .iter()
            .any(|op| op.dest().is_some_and(|d| d.ends_with(".gnupg"))));
    }

    #[test]
    fn project_dotenv_files_are_hidden() {
        let fx = fixture();
        fs::write(fx.identity.project_dir.join(".env"), "SECRET=x").unwrap();
        fs::write(fx.identity.project_dir.join(".env.local"), "SECRET=y").unwrap();
        // Nested dotenv files are not "directly under the project".
        let nested = fx.identity.project_dir.join("sub");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join(".env"), "SECRET=z").unwrap();

        let out = compile_with(&fx, &[], &[]).unwrap();
        let project = index_of(&out.ops, |op| {
            matches!(op, MountOp::BindRw { dst, .. } if dst == &fx.identity.project_dir)
        });
        let env = index_of(&out.ops, |op| {
            matches!(op, MountOp::DevNullOver { dst } if dst == &fx.identity.project_dir.join(".env"))
        });
        let env_local = index_of(&out.ops, |op| {
            matches!(op, MountOp::DevNullOver { dst } if dst == &fx.identity.project_dir.join(".env.local"))
        });
        assert!(env > project && env_local > project);
        assert!(!out
            .ops
            .iter()
            .any(|op| op.dest() == Some(nested.join(".env").as_path())));
    }

    #[test]
    fn binding_over_a_secret_is_fatal() {
        let fx = fixture();
        fs::create_dir_all(fx.home.join(".ssh")).unwrap();
        let rules = vec![MountRule {
            pattern: "~/.ssh".into(),
            mode: MountMode::ReadWrite,
        }];
        let err = compile_with(&fx, &[], &rules).unwrap_err();
        match err {
            LauncherError::MountConflict { dest, .. } => {
                assert_eq!(dest, fx.home.join(".ssh"));
            }
            other => panic!("expected MountConflict, got {other:?}"),
        }
    }

    #[test]
    fn optional_missing_sources_skip_silently() {
        let fx = fixture();
        let tools = vec![(
            "mise".to_string(),
            vec![Binding::ro(fx.home.join(".local/share/mise")).optional()],
        )];
        let out = compile_with(&fx, &tools, &[]).unwrap();
        assert!(out.warnings.is_empty());

        let tools = vec![(
            "mise".to_string(),
            vec![Binding::ro(fx.home.join(".local/share/mise"))],
        )];
        let out = compile_with(&fx, &tools, &[]).unwrap();
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let fx = fixture();
        fs::create_dir_all(fx.home.join(".ssh")).unwrap();
        fs::write(fx.identity.project_dir.join(".env"), "SECRET=x").unwrap();
        let cache = fx.home.join("cache");
        fs::create_dir_all(&cache).unwrap();

        let tools = vec![("cargo".to_string(), vec![Binding::rw(cache)])];
        let rules = vec![MountRule {
            pattern: "~/.cargo/registry".into(),
            mode: MountMode::ReadOnly,
        }];
        let a = compile_with(&fx, &tools, &rules).unwrap();
        let b = compile_with(&fx, &tools, &rules).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.ops, b.ops);
    }

    #[test]
    fn extra_env_and_unsets_come_last() {
        let fx = fixture();
        let out = compile(&CompileRequest {
            identity: &fx.identity,
            home: &fx.home,
            tool_bindings: &[],
            user_rules: &[],
            env: &[
                EnvVar::set("HTTP_PROXY", "http://127.0.0.1:18889"),
                EnvVar::from_host("DEVSANDBOX_COMPILER_TEST_MISSING"),
            ],
            unset_env: &["SSH_AUTH_SOCK".to_string()],
        })
        .unwrap();

        assert!(out.ops.iter().any(|op| {
            matches!(op, MountOp::SetEnv { name, value }
                if name == "HTTP_PROXY" && value.contains(":18889"))
        }));
        // from_host with no launcher-process value contributes nothing.
        assert!(!out.ops.iter().any(|op| {
            matches!(op, MountOp::SetEnv { name, .. } if name == "DEVSANDBOX_COMPILER_TEST_MISSING")
        }));
        assert!(matches!(
            out.ops.last(),
            Some(MountOp::UnsetEnv { name }) if name == "SSH_AUTH_SOCK"
        ));
    }
}
