use crate::backend::Arch;

/// How a stub reaches the shared general subtype routine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum SlowPathLinkage {
    /// Indirect tail jump through the slow-path slot of the thread block.
    #[default]
    ThreadSlot,
    /// Direct tail jump to the shared slow-path stub, patched at link time.
    PcRelative,
}

impl SlowPathLinkage {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "thread" | "thread-slot" => Some(Self::ThreadSlot),
            "pcrel" | "pc-relative" => Some(Self::PcRelative),
            _ => None,
        }
    }
}

impl std::fmt::Display for SlowPathLinkage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlowPathLinkage::ThreadSlot => f.write_str("thread"),
            SlowPathLinkage::PcRelative => f.write_str("pcrel"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StubConfig {
    /// When false every type is served by the shared slow-path stub.
    pub enabled: bool,
    pub arch: Arch,
    pub slow_path_linkage: SlowPathLinkage,
    pub max_type_arg_depth: usize,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            enabled: native_stubs_supported(),
            arch: Arch::host(),
            slow_path_linkage: SlowPathLinkage::ThreadSlot,
            max_type_arg_depth: 3,
        }
    }
}

impl StubConfig {
    /// Stubs can be executed only when they target the host.
    pub fn executable(&self) -> bool {
        self.enabled && native_stubs_supported() && self.arch == Arch::host()
    }
}

pub fn native_stubs_supported() -> bool {
    (cfg!(target_arch = "x86_64") && (cfg!(target_os = "linux") || cfg!(target_os = "windows")))
        || (cfg!(target_arch = "aarch64")
            && (cfg!(target_os = "linux") || cfg!(target_os = "macos")))
}
