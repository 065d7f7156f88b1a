use crate::config::Config;
use crate::error::ProxyError;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Suffix of rendered fragment files, matched by the include glob
pub const FRAGMENT_SUFFIX: &str = ".conf";

/// Mode of every file written for the proxy
#[cfg(unix)]
const FILE_MODE: u32 = 0o644;

/// Lifecycle state of the proxy process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// No process has been started, or it was terminated on request
    NotStarted,
    /// The process is executing
    Running,
    /// The process exited on its own
    Exited,
}

/// Result of a liveness poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Nothing was started, so there is nothing to poll
    NotRunning,
    /// The process exited; `code` is `None` when it was killed by a signal
    Exited { code: Option<i32> },
}

#[derive(Debug, Clone, Copy)]
enum ProxySignal {
    Reload,
    Terminate,
}

/// Owns the proxy process and the files it includes.
///
/// # Reloads
///
/// Rendering a fragment only marks a reload as pending. The pending flag is
/// consumed at the next liveness poll, so any number of fragments written
/// between two polls cost one config test and one `SIGHUP`. The flag is
/// cleared when the attempt is made, whether or not it succeeds.
#[derive(Debug)]
pub struct ProxySupervisor {
    binary: String,
    main_config: PathBuf,
    config_dir: PathBuf,
    render_dir: PathBuf,
    include_file: String,
    child: Option<Child>,
    state: ProxyState,
    reload_pending: bool,
    reloads: u64,
    exit_code: Option<i32>,
}

impl ProxySupervisor {
    pub fn new(config: &Config) -> Self {
        Self {
            binary: config.proxy.binary.clone(),
            main_config: config.proxy.main_config.clone(),
            config_dir: config.paths.proxy_config_dir.clone(),
            render_dir: config.paths.render_dir.clone(),
            include_file: config.proxy.include_file.clone(),
            child: None,
            state: ProxyState::NotStarted,
            reload_pending: false,
            reloads: 0,
            exit_code: None,
        }
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn reload_pending(&self) -> bool {
        self.reload_pending
    }

    /// Number of reload signals delivered so far
    pub fn reload_count(&self) -> u64 {
        self.reloads
    }

    pub fn request_reload(&mut self) {
        self.reload_pending = true;
    }

    pub fn include_path(&self) -> PathBuf {
        self.config_dir.join(&self.include_file)
    }

    pub fn fragment_path(&self, name: &str) -> PathBuf {
        self.render_dir.join(format!("{}{}", name, FRAGMENT_SUFFIX))
    }

    /// Create the render and proxy configuration directories
    fn create_dirs(&self) -> Result<(), ProxyError> {
        for dir in [&self.render_dir, &self.config_dir] {
            std::fs::create_dir_all(dir).map_err(|source| ProxyError::Write {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Create the output directories and write the include file.
    ///
    /// The include globs every fragment, so it never has to change afterwards.
    /// Any failure here is fatal.
    pub fn prepare(&self) -> Result<PathBuf, ProxyError> {
        let path = self.include_path();
        let include_err = |source| ProxyError::IncludeFile {
            path: path.clone(),
            source: Box::new(source),
        };

        self.create_dirs().map_err(include_err)?;
        let pattern = self.render_dir.join(format!("*{}", FRAGMENT_SUFFIX));
        write_atomic(&path, format!("include {};\n", pattern.display()).as_bytes())
            .map_err(include_err)?;
        info!(path = %path.display(), include = %pattern.display(), "Include file written");
        Ok(path)
    }

    /// Write the fragment for `name` and mark a reload as pending
    pub fn save_fragment(&mut self, name: &str, body: &str) -> Result<PathBuf, ProxyError> {
        let path = self.fragment_path(name);
        write_atomic(&path, body.as_bytes())?;
        debug!(name, path = %path.display(), "Fragment written");
        self.request_reload();
        Ok(path)
    }

    /// Spawn the proxy in the foreground. Returns the process id.
    ///
    /// A fresh process reads the current fragments, so any pending reload
    /// is dropped.
    pub fn start(&mut self) -> Result<u32, ProxyError> {
        if self.state == ProxyState::Running {
            if let Some(pid) = self.pid() {
                debug!(pid, "Proxy already running");
                return Ok(pid);
            }
        }

        info!(binary = %self.binary, config = %self.main_config.display(), "Starting proxy");

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c")
            .arg(&self.main_config)
            .arg("-g")
            .arg("daemon off;")
            .stdin(Stdio::null());

        let child = cmd.spawn().map_err(|source| ProxyError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        info!(pid, "Proxy process spawned");

        self.child = Some(child);
        self.state = ProxyState::Running;
        self.exit_code = None;
        self.reload_pending = false;
        Ok(pid)
    }

    /// Poll the process. A live process gets its pending reload, if any.
    pub async fn check(&mut self) -> Liveness {
        let Some(child) = self.child.as_mut() else {
            return match self.state {
                ProxyState::Exited => Liveness::Exited {
                    code: self.exit_code,
                },
                _ => Liveness::NotRunning,
            };
        };

        match child.try_wait() {
            Ok(None) => {
                self.reload_if_needed().await;
                Liveness::Alive
            }
            Ok(Some(status)) => {
                let code = status.code();
                let clean = code.map(|c| c <= 0).unwrap_or(false);
                info!(code = ?code, clean, "Proxy exited");
                self.child = None;
                self.state = ProxyState::Exited;
                self.exit_code = code;
                Liveness::Exited { code }
            }
            Err(e) => {
                // Status unknown: never reload a process we cannot vouch for
                warn!(error = %e, "Failed to poll proxy process");
                Liveness::Alive
            }
        }
    }

    /// Reload if one is pending. Returns true if a reload signal was sent.
    pub async fn reload_if_needed(&mut self) -> bool {
        if !self.reload_pending {
            return false;
        }
        self.reload_pending = false;

        match self.reload().await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Proxy reload aborted");
                false
            }
        }
    }

    /// Test the full configuration, then signal the process to reload it.
    ///
    /// A failed test leaves the running configuration in place.
    pub async fn reload(&mut self) -> Result<(), ProxyError> {
        if self.pid().is_none() {
            return Err(ProxyError::NotRunning);
        }

        info!("Reloading proxy");
        self.validate().await?;
        self.send_signal(ProxySignal::Reload)?;
        self.reloads += 1;
        info!(reloads = self.reloads, "Proxy reload signalled");
        Ok(())
    }

    /// Run the proxy's own configuration test
    pub async fn validate(&self) -> Result<(), ProxyError> {
        let output = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.main_config)
            .arg("-t")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(ProxyError::ValidateSpawn)?;

        if output.status.success() {
            return Ok(());
        }

        Err(ProxyError::ValidationFailed {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Ask the process to stop. Does not wait for it to exit.
    pub fn terminate(&mut self) {
        if self.child.is_none() {
            return;
        }
        if let Err(e) = self.send_signal(ProxySignal::Terminate) {
            warn!(error = %e, "Failed to terminate proxy");
        }
        self.child = None;
        self.state = ProxyState::NotStarted;
    }

    fn send_signal(&mut self, signal: ProxySignal) -> Result<(), ProxyError> {
        let child = self.child.as_mut().ok_or(ProxyError::NotRunning)?;
        let pid = child.id().ok_or(ProxyError::NotRunning)?;

        #[cfg(unix)]
        {
            let signo = match signal {
                ProxySignal::Reload => libc::SIGHUP,
                ProxySignal::Terminate => libc::SIGTERM,
            };
            debug!(pid, ?signal, "Signalling proxy");
            let rc = unsafe { libc::kill(pid as i32, signo) };
            if rc != 0 {
                return Err(ProxyError::Signal(std::io::Error::last_os_error()));
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            debug!(pid, ?signal, "Signalling proxy");
            match signal {
                ProxySignal::Terminate => child.start_kill().map_err(ProxyError::Signal),
                ProxySignal::Reload => Err(ProxyError::Signal(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "live reload needs unix signals",
                ))),
            }
        }
    }
}

/// Write through a temp file in the same directory, then rename into place.
///
/// The temp file name never ends in the fragment suffix.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ProxyError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let write_err = |source| ProxyError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".ingressd")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(contents).map_err(write_err)?;
    // tempfile creates 0600; the proxy workers run as another user
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(FILE_MODE))
            .map_err(write_err)?;
    }
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|source| ProxyError::Persist {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}
