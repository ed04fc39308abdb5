use crate::distro::Distribution;
use crate::jobs::Action;
use std::fmt;
use std::time::Duration;

/// Every program the planner can emit. The privileged executor refuses
/// anything else.
pub const ALLOWED_PROGRAMS: &[&str] = &[
    "apk",
    "apt-get",
    "dnf",
    "yum",
    "zypper",
    "pacman",
    "cloud-init",
    "reboot",
];

const ALPINE_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const PACKAGE_FAMILY_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostCommand {
    pub program: &'static str,
    pub args: Vec<&'static str>,
    pub timeout: Duration,
}

impl HostCommand {
    fn new(program: &'static str, args: &[&'static str], timeout: Duration) -> Self {
        Self {
            program,
            args: args.to_vec(),
            timeout,
        }
    }

    pub fn is_allowed(&self) -> bool {
        ALLOWED_PROGRAMS.contains(&self.program)
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum PlanError {
    #[error("unsupported distribution: {0}")]
    UnsupportedDistribution(Distribution),
}

impl PlanError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedDistribution(_) => "unsupported_distribution",
        }
    }
}

/// Package manager used for the RHEL family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RpmTool {
    Dnf,
    Yum,
}

impl RpmTool {
    /// Prefer dnf when it is on `PATH`.
    pub fn probe() -> Self {
        if which::which("dnf").is_ok() {
            Self::Dnf
        } else {
            Self::Yum
        }
    }

    fn program(self) -> &'static str {
        match self {
            Self::Dnf => "dnf",
            Self::Yum => "yum",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Planner {
    rpm_tool: RpmTool,
}

impl Planner {
    pub fn new(rpm_tool: RpmTool) -> Self {
        Self { rpm_tool }
    }

    pub fn plan(
        &self,
        distro: Distribution,
        action: Action,
    ) -> Result<Vec<HostCommand>, PlanError> {
        let base = base_timeout(distro);
        let upgrade = base * 2;

        match action {
            Action::Reboot => Ok(vec![HostCommand::new("reboot", &[], base)]),
            Action::Reinit => match distro {
                Distribution::Unknown => Err(PlanError::UnsupportedDistribution(distro)),
                _ => Ok(vec![HostCommand::new("cloud-init", &["init"], base)]),
            },
            Action::Update => match distro {
                Distribution::Alpine => Ok(vec![
                    HostCommand::new("apk", &["update"], base),
                    HostCommand::new("apk", &["upgrade"], upgrade),
                ]),
                Distribution::Debian | Distribution::Ubuntu => Ok(vec![
                    HostCommand::new("apt-get", &["update"], base),
                    HostCommand::new("apt-get", &["upgrade", "-y"], upgrade),
                ]),
                Distribution::Rhel | Distribution::Centos | Distribution::Fedora => Ok(vec![
                    HostCommand::new(self.rpm_tool.program(), &["update", "-y"], upgrade),
                ]),
                Distribution::Suse => Ok(vec![
                    HostCommand::new("zypper", &["refresh"], base),
                    HostCommand::new("zypper", &["update", "-y"], upgrade),
                ]),
                Distribution::Arch => Ok(vec![HostCommand::new(
                    "pacman",
                    &["-Syu", "--noconfirm"],
                    upgrade,
                )]),
                Distribution::Unknown => Err(PlanError::UnsupportedDistribution(distro)),
            },
        }
    }
}

fn base_timeout(distro: Distribution) -> Duration {
    match distro {
        Distribution::Alpine => ALPINE_TIMEOUT,
        Distribution::Debian
        | Distribution::Ubuntu
        | Distribution::Rhel
        | Distribution::Centos
        | Distribution::Fedora => PACKAGE_FAMILY_TIMEOUT,
        Distribution::Suse | Distribution::Arch | Distribution::Unknown => DEFAULT_TIMEOUT,
    }
}
