//! Build metadata embedded by `build.rs`

use std::fmt;

/// What was built, from which revision, and with what
#[derive(Debug, Clone, Copy)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
    /// Short commit hash, or "unknown" outside a git checkout
    pub git_hash: &'static str,
    dirty: &'static str,
    pub built_at: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
    pub rustc: &'static str,
}

/// This binary's build
pub const BUILD: BuildInfo = BuildInfo {
    name: env!("CARGO_PKG_NAME"),
    version: env!("CARGO_PKG_VERSION"),
    git_hash: env!("PDEXEC_GIT_HASH"),
    dirty: env!("PDEXEC_GIT_DIRTY"),
    built_at: env!("PDEXEC_BUILD_TIMESTAMP"),
    target: env!("PDEXEC_TARGET"),
    profile: env!("PDEXEC_PROFILE"),
    rustc: env!("PDEXEC_RUSTC_VERSION"),
};

impl BuildInfo {
    /// Uncommitted changes were present when this was built
    pub fn is_dirty(&self) -> bool {
        self.dirty == "true"
    }

    /// `<version>-<hash>`, with `-dirty` appended for unclean trees
    pub fn full_version(&self) -> String {
        let dirty = if self.is_dirty() { "-dirty" } else { "" };
        format!("{}-{}{}", self.version, self.git_hash, dirty)
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "Build Information:")?;
        writeln!(f, "  Git Hash:  {}", self.git_hash)?;
        writeln!(f, "  Built:     {}", self.built_at)?;
        writeln!(f, "  Profile:   {}", self.profile)?;
        writeln!(f, "  Target:    {}", self.target)?;
        write!(f, "  Compiler:  {}", self.rustc)
    }
}

/// Version string the server announces in `HELLO_ACK`
pub fn server_version() -> String {
    BUILD.full_version()
}
