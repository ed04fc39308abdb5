use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Distribution {
    Alpine,
    Debian,
    Ubuntu,
    Rhel,
    Centos,
    Fedora,
    Suse,
    Arch,
    Unknown,
}

impl Distribution {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alpine => "alpine",
            Self::Debian => "debian",
            Self::Ubuntu => "ubuntu",
            Self::Rhel => "rhel",
            Self::Centos => "centos",
            Self::Fedora => "fedora",
            Self::Suse => "suse",
            Self::Arch => "arch",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Order matters: ID_LIKE lines mention parent families, so the more specific
// names are probed first.
const OS_RELEASE_MARKERS: &[(&[&str], Distribution)] = &[
    (&["alpine"], Distribution::Alpine),
    (&["ubuntu"], Distribution::Ubuntu),
    (&["debian"], Distribution::Debian),
    (&["rhel", "red hat"], Distribution::Rhel),
    (&["centos"], Distribution::Centos),
    (&["fedora"], Distribution::Fedora),
    (&["suse", "opensuse"], Distribution::Suse),
    (&["arch"], Distribution::Arch),
];

/// Classify the host rooted at `root` (`/` in production).
///
/// Unreadable files are treated as absent; detection never fails.
pub fn detect_distribution(root: &Path) -> Distribution {
    let etc = root.join("etc");

    if etc.join("alpine-release").exists() {
        return Distribution::Alpine;
    }

    if let Ok(contents) = fs::read_to_string(etc.join("os-release")) {
        if let Some(distro) = classify_os_release(&contents) {
            return distro;
        }
    }

    if etc.join("debian_version").exists() {
        return Distribution::Debian;
    }

    if etc.join("redhat-release").exists() {
        return Distribution::Rhel;
    }

    Distribution::Unknown
}

fn classify_os_release(contents: &str) -> Option<Distribution> {
    let lowered = contents.to_lowercase();
    OS_RELEASE_MARKERS
        .iter()
        .find(|(needles, _)| needles.iter().any(|needle| lowered.contains(needle)))
        .map(|(_, distro)| *distro)
}
