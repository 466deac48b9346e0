//! Session module - maps session names to daemons
//!
//! A session name resolves to its endpoint through a pure function of the
//! name, so independent clients converge on the same daemon without any
//! shared lookup table. Pid files in the socket directory only serve
//! listing.

pub mod endpoint;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;

use crate::core::config::{validate_session_name, EngineKind, Transport};
use crate::core::{BrowseError, Config, Result};

pub use endpoint::{BoxStream, Endpoint, Listener};

/// Hash salt for control endpoints
const CONTROL_SALT: &str = "session";
/// Hash salt for bridge endpoints
const BRIDGE_SALT: &str = "bridge";

const BACKOFF_START: Duration = Duration::from_millis(25);
const BACKOFF_MAX: Duration = Duration::from_millis(400);

/// A live session as listed to users
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub pid: Option<u32>,
    pub endpoint: String,
}

/// Resolves, spawns and lists session daemons
#[derive(Debug, Clone)]
pub struct Registry {
    config: Config,
}

impl Registry {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn use_tcp(&self) -> bool {
        !cfg!(unix) || self.config.daemon.transport == Transport::Tcp
    }

    fn resolve(&self, name: &str, salt: &str, suffix: &str) -> Result<Endpoint> {
        validate_session_name(name)?;
        if self.use_tcp() {
            self.tcp(name, salt)
        } else {
            self.local(name, salt, suffix)
        }
    }

    fn tcp(&self, name: &str, salt: &str) -> Result<Endpoint> {
        let daemon = &self.config.daemon;
        let port = endpoint::port_for(salt, name, daemon.port_base, daemon.port_span)?;
        Ok(endpoint::tcp_endpoint(port))
    }

    #[cfg(unix)]
    fn local(&self, name: &str, _salt: &str, suffix: &str) -> Result<Endpoint> {
        Ok(Endpoint::Unix(endpoint::socket_path(
            &self.config.socket_dir(),
            name,
            suffix,
        )))
    }

    #[cfg(not(unix))]
    fn local(&self, name: &str, salt: &str, _suffix: &str) -> Result<Endpoint> {
        self.tcp(name, salt)
    }

    /// Control endpoint of a session
    pub fn endpoint(&self, name: &str) -> Result<Endpoint> {
        self.resolve(name, CONTROL_SALT, "")
    }

    /// Endpoint bridge peers attach to
    pub fn bridge_endpoint(&self, name: &str) -> Result<Endpoint> {
        self.resolve(name, BRIDGE_SALT, ".bridge")
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.config.socket_dir().join(format!("{}.pid", name))
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.config.socket_dir().join(format!("{}.log", name))
    }

    /// Record the current process as the daemon of `name`
    pub fn write_pid(&self, name: &str) -> Result<()> {
        let path = self.pid_file(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(())
    }

    pub fn remove_pid(&self, name: &str) {
        if let Err(e) = endpoint::remove_if_exists(&self.pid_file(name)) {
            tracing::warn!(session = name, error = %e, "failed to remove pid file");
        }
    }

    /// Endpoint of a running daemon, spawning one if nothing answers.
    ///
    /// Waits with bounded backoff for a spawned daemon to accept
    /// connections. A failed spawn removes the session's pid file, so the
    /// next attempt starts clean.
    pub async fn ensure_running(&self, name: &str) -> Result<Endpoint> {
        let endpoint = self.endpoint(name)?;
        if endpoint.is_live().await {
            return Ok(endpoint);
        }

        tracing::info!(session = name, endpoint = %endpoint, "spawning daemon");
        let mut child = self.spawn(name)?;

        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.daemon.spawn_timeout_ms);
        let mut delay = BACKOFF_START;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if endpoint.is_live().await {
                tracing::debug!(session = name, attempts, "daemon is up");
                return Ok(endpoint);
            }
            if let Ok(Some(status)) = child.try_wait() {
                tracing::warn!(session = name, %status, "daemon exited during startup");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(BACKOFF_MAX);
        }

        self.remove_pid(name);
        Err(BrowseError::DaemonUnreachable {
            session: name.to_string(),
            attempts,
        })
    }

    /// Start `browsectl daemon` detached from this process.
    ///
    /// The child loads its own config, so every setting the endpoint or
    /// engine depends on is passed as a flag, which outranks the file.
    fn spawn(&self, name: &str) -> Result<std::process::Child> {
        let exe = std::env::current_exe()?;
        let dir = self.config.socket_dir();
        std::fs::create_dir_all(&dir)?;
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file(name))?;

        let mut command = std::process::Command::new(exe);
        command
            .args(daemon_args(&self.config, name))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        Ok(command.spawn()?)
    }

    /// Sessions with a pid file whose daemon still answers.
    ///
    /// Pid files of dead daemons are removed on the way.
    pub async fn list(&self) -> Result<Vec<SessionInfo>> {
        let dir = self.config.socket_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file = entry.file_name().to_string_lossy().to_string();
                file.strip_suffix(".pid").map(str::to_string)
            })
            .filter(|name| validate_session_name(name).is_ok())
            .collect();
        names.sort();

        let mut sessions = Vec::new();
        for name in names {
            let endpoint = self.endpoint(&name)?;
            if !endpoint.is_live().await {
                tracing::debug!(session = %name, "removing stale pid file");
                self.remove_pid(&name);
                continue;
            }
            let pid = std::fs::read_to_string(self.pid_file(&name))
                .ok()
                .and_then(|s| s.trim().parse().ok());
            sessions.push(SessionInfo {
                name,
                pid,
                endpoint: endpoint.to_string(),
            });
        }
        Ok(sessions)
    }
}

/// Command line for a daemon that serves `name` exactly as `config` resolves it
fn daemon_args(config: &Config, name: &str) -> Vec<std::ffi::OsString> {
    let mut args: Vec<std::ffi::OsString> = vec![
        "daemon".into(),
        "--session".into(),
        name.into(),
        "--socket-dir".into(),
        config.socket_dir().into_os_string(),
        "--engine".into(),
        match config.engine.kind {
            EngineKind::Bridge => "bridge",
            EngineKind::Memory => "memory",
        }
        .into(),
    ];
    if config.daemon.transport == Transport::Tcp {
        args.push("--tcp".into());
    }
    if let Some(fixtures) = &config.engine.fixtures {
        args.push("--fixtures".into());
        args.push(fixtures.clone().into_os_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &std::path::Path) -> Registry {
        let mut config = Config::default();
        config.daemon.socket_dir = Some(dir.to_path_buf());
        config.daemon.transport = Transport::Auto;
        Registry::new(config)
    }

    #[test]
    fn test_daemon_args_carry_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.daemon.socket_dir = Some(dir.path().to_path_buf());
        config.daemon.transport = Transport::Tcp;
        config.engine.kind = EngineKind::Memory;
        config.engine.fixtures = Some(dir.path().join("pages.json"));

        let args: Vec<String> = daemon_args(&config, "work")
            .into_iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        let fixtures = dir.path().join("pages.json").to_string_lossy().to_string();
        let dir = dir.path().to_string_lossy().to_string();
        assert_eq!(
            args,
            vec![
                "daemon",
                "--session",
                "work",
                "--socket-dir",
                dir.as_str(),
                "--engine",
                "memory",
                "--tcp",
                "--fixtures",
                fixtures.as_str(),
            ]
        );

        config.daemon.transport = Transport::Auto;
        config.engine.kind = EngineKind::Bridge;
        config.engine.fixtures = None;
        let args = daemon_args(&config, "work");
        assert!(!args.iter().any(|a| a == "--tcp"));
        assert!(args.iter().any(|a| a == "bridge"));
    }

    #[test]
    fn test_endpoints_are_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert_eq!(reg.endpoint("work").unwrap(), reg.endpoint("work").unwrap());
        assert_ne!(reg.endpoint("work").unwrap(), reg.endpoint("play").unwrap());
        assert_ne!(reg.endpoint("work").unwrap(), reg.bridge_endpoint("work").unwrap());
        assert!(reg.endpoint("../escape").is_err());
    }

    #[test]
    fn test_tcp_transport() {
        let mut config = Config::default();
        config.daemon.transport = Transport::Tcp;
        let reg = Registry::new(config);
        match reg.endpoint("work").unwrap() {
            Endpoint::Tcp(addr) => {
                assert!(addr.ip().is_loopback());
                assert!(addr.port() >= 49152);
            }
            #[cfg(unix)]
            other => panic!("expected tcp endpoint, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_list_drops_stale_pid_files() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        reg.write_pid("ghost").unwrap();
        assert!(reg.pid_file("ghost").exists());

        assert!(reg.list().await.unwrap().is_empty());
        assert!(!reg.pid_file("ghost").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_reports_live_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let listener = reg.endpoint("live").unwrap().bind().await.unwrap();
        reg.write_pid("live").unwrap();

        let sessions = reg.list().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "live");
        assert_eq!(sessions[0].pid, Some(std::process::id()));
        drop(listener);
    }
}
