//! `--setup` / `--uninstall`: put the daemon under the host init system.

use crate::config::{
    DEFAULT_LOG_FILE, DEFAULT_PORT, ENV_LOG_FILE, ENV_LOG_LEVEL, ENV_PORT, ENV_SECRET,
    ENV_TLS_ENABLED, SERVICE_NAME,
};
use rust_embed::RustEmbed;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(RustEmbed)]
#[folder = "packaging/"]
struct UnitTemplates;

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("setup must run as root")]
    NotRoot,
    #[error("no supported init system found (systemd or OpenRC)")]
    NoInitSystem,
    #[error("cannot locate the running executable: {0}")]
    CurrentExe(io::Error),
    #[error("{}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("embedded unit template {0} is missing")]
    MissingTemplate(&'static str),
    #[error("`{command}` failed: {detail}")]
    ServiceCommand { command: String, detail: String },
}

impl InstallError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotRoot => "not_root",
            Self::NoInitSystem => "no_init_system",
            Self::CurrentExe(_) => "current_exe",
            Self::Io { .. } => "io",
            Self::MissingTemplate(_) => "missing_template",
            Self::ServiceCommand { .. } => "service_command_failed",
        }
    }
}

fn io_at(path: &Path) -> impl FnOnce(io::Error) -> InstallError + '_ {
    move |source| InstallError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitSystem {
    Systemd,
    OpenRc,
}

impl InitSystem {
    pub fn detect(root: &Path) -> Option<Self> {
        if root.join("run/systemd/system").is_dir() {
            Some(Self::Systemd)
        } else if root.join("sbin/openrc-run").exists() {
            Some(Self::OpenRc)
        } else {
            None
        }
    }

    fn template(self) -> &'static str {
        match self {
            Self::Systemd => "cloud-update.service",
            Self::OpenRc => "cloud-update.openrc",
        }
    }

    fn unit_mode(self) -> u32 {
        match self {
            Self::Systemd => 0o644,
            Self::OpenRc => 0o755,
        }
    }

    fn start_commands(self) -> Vec<Vec<&'static str>> {
        match self {
            Self::Systemd => vec![
                vec!["systemctl", "daemon-reload"],
                vec!["systemctl", "enable", SERVICE_NAME],
                vec!["systemctl", "restart", SERVICE_NAME],
            ],
            Self::OpenRc => vec![
                vec!["rc-update", "add", SERVICE_NAME, "default"],
                vec!["rc-service", SERVICE_NAME, "restart"],
            ],
        }
    }

    fn stop_commands(self) -> Vec<Vec<&'static str>> {
        match self {
            Self::Systemd => vec![
                vec!["systemctl", "stop", SERVICE_NAME],
                vec!["systemctl", "disable", SERVICE_NAME],
            ],
            Self::OpenRc => vec![
                vec!["rc-service", SERVICE_NAME, "stop"],
                vec!["rc-update", "del", SERVICE_NAME, "default"],
            ],
        }
    }
}

/// Filesystem layout of an installation, rooted at `/` outside tests.
#[derive(Clone, Debug)]
pub struct InstallPaths {
    root: PathBuf,
}

impl InstallPaths {
    pub fn system() -> Self {
        Self::under(PathBuf::from("/"))
    }

    pub fn under(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binary(&self) -> PathBuf {
        self.root.join("usr/local/bin").join(SERVICE_NAME)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("etc/cloud-update")
    }

    pub fn config_env(&self) -> PathBuf {
        self.config_dir().join("config.env")
    }

    pub fn tls_dir(&self) -> PathBuf {
        self.config_dir().join("tls")
    }

    pub fn log_dir(&self) -> PathBuf {
        let relative = Path::new(DEFAULT_LOG_FILE)
            .parent()
            .and_then(|dir| dir.strip_prefix("/").ok())
            .unwrap_or_else(|| Path::new("var/log/cloud-update"));
        self.root.join(relative)
    }

    pub fn unit(&self, init: InitSystem) -> PathBuf {
        match init {
            InitSystem::Systemd => self
                .root
                .join("etc/systemd/system")
                .join(format!("{SERVICE_NAME}.service")),
            InitSystem::OpenRc => self.root.join("etc/init.d").join(SERVICE_NAME),
        }
    }
}

/// Runs init-system commands (`systemctl`, `rc-service`, ...).
pub trait ServiceControl {
    fn run(&self, argv: &[&str]) -> Result<(), InstallError>;
}

pub struct SystemServiceControl;

impl ServiceControl for SystemServiceControl {
    fn run(&self, argv: &[&str]) -> Result<(), InstallError> {
        let rendered = argv.join(" ");
        let Some((program, args)) = argv.split_first() else {
            return Ok(());
        };
        let output = Command::new(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| InstallError::ServiceCommand {
                command: rendered.clone(),
                detail: err.to_string(),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".into(), |code| code.to_string());
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(InstallError::ServiceCommand {
            command: rendered,
            detail: format!("exit {code}: {stderr}"),
        })
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct SetupReport {
    pub init: InitSystem,
    pub secret_generated: bool,
}

/// `--setup` against the live system.
pub fn run_setup() -> Result<SetupReport, InstallError> {
    require_root()?;
    let paths = InstallPaths::system();
    let init = InitSystem::detect(paths.root()).ok_or(InstallError::NoInitSystem)?;
    let exe = std::env::current_exe().map_err(InstallError::CurrentExe)?;
    setup(&paths, init, &exe, &SystemServiceControl)
}

/// `--uninstall` against the live system.
pub fn run_uninstall() -> Result<(), InstallError> {
    require_root()?;
    let paths = InstallPaths::system();
    let init = InitSystem::detect(paths.root()).ok_or(InstallError::NoInitSystem)?;
    uninstall(&paths, init, &SystemServiceControl)
}

fn require_root() -> Result<(), InstallError> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    if unsafe { libc::geteuid() } == 0 {
        Ok(())
    } else {
        Err(InstallError::NotRoot)
    }
}

pub fn setup(
    paths: &InstallPaths,
    init: InitSystem,
    exe: &Path,
    control: &dyn ServiceControl,
) -> Result<SetupReport, InstallError> {
    install_binary(exe, &paths.binary())?;

    let config_dir = paths.config_dir();
    fs::create_dir_all(&config_dir).map_err(io_at(&config_dir))?;
    let secret_generated = write_config_env(&paths.config_env())?;

    for dir in [paths.tls_dir(), paths.log_dir()] {
        fs::create_dir_all(&dir).map_err(io_at(&dir))?;
    }
    let tls_dir = paths.tls_dir();
    fs::set_permissions(&tls_dir, fs::Permissions::from_mode(0o700)).map_err(io_at(&tls_dir))?;

    write_unit(paths, init)?;
    for argv in init.start_commands() {
        control.run(&argv)?;
    }

    info!(
        init = ?init,
        secret_generated,
        config = %paths.config_env().display(),
        "cloud-update installed"
    );
    Ok(SetupReport {
        init,
        secret_generated,
    })
}

pub fn uninstall(
    paths: &InstallPaths,
    init: InitSystem,
    control: &dyn ServiceControl,
) -> Result<(), InstallError> {
    for argv in init.stop_commands() {
        // The service may already be stopped or never enabled.
        if let Err(err) = control.run(&argv) {
            warn!(err = %err, "ignoring service command failure");
        }
    }

    for path in [paths.unit(init), paths.binary()] {
        match fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_at(&path)(err)),
        }
    }
    if init == InitSystem::Systemd {
        control.run(&["systemctl", "daemon-reload"])?;
    }

    info!(
        kept = %paths.config_dir().display(),
        "cloud-update uninstalled; configuration kept"
    );
    Ok(())
}

fn install_binary(exe: &Path, target: &Path) -> Result<(), InstallError> {
    if let (Ok(from), Ok(to)) = (exe.canonicalize(), target.canonicalize()) {
        if from == to {
            return Ok(());
        }
    }
    let dir = target.parent().unwrap_or_else(|| Path::new("/"));
    fs::create_dir_all(dir).map_err(io_at(dir))?;

    // Copy beside the target and rename so a running binary is replaced atomically.
    let staged = target.with_extension("new");
    fs::copy(exe, &staged).map_err(io_at(exe))?;
    fs::set_permissions(&staged, fs::Permissions::from_mode(0o755)).map_err(io_at(&staged))?;
    fs::rename(&staged, target).map_err(io_at(target))?;
    Ok(())
}

/// Returns whether a new file (and secret) was written.
fn write_config_env(path: &Path) -> Result<bool, InstallError> {
    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            info!(path = %path.display(), "keeping existing configuration");
            return Ok(false);
        }
        Err(err) => return Err(io_at(path)(err)),
    };
    file.write_all(render_config_env(&generate_secret()).as_bytes())
        .map_err(io_at(path))?;
    Ok(true)
}

fn generate_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn render_config_env(secret: &str) -> String {
    format!(
        "# cloud-update configuration\n\
         {ENV_PORT}={DEFAULT_PORT}\n\
         {ENV_SECRET}={secret}\n\
         {ENV_LOG_LEVEL}=info\n\
         {ENV_LOG_FILE}={DEFAULT_LOG_FILE}\n\
         {ENV_TLS_ENABLED}=false\n"
    )
}

fn write_unit(paths: &InstallPaths, init: InitSystem) -> Result<(), InstallError> {
    let name = init.template();
    let template = UnitTemplates::get(name).ok_or(InstallError::MissingTemplate(name))?;
    let unit = paths.unit(init);
    if let Some(dir) = unit.parent() {
        fs::create_dir_all(dir).map_err(io_at(dir))?;
    }
    fs::write(&unit, template.data.as_ref()).map_err(io_at(&unit))?;
    fs::set_permissions(&unit, fs::Permissions::from_mode(init.unit_mode())).map_err(io_at(&unit))?;
    Ok(())
}
