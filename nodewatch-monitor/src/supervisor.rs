/**
 * SUPERVISOR - Lifecycle of the external agent processes
 *
 * ROLE:
 * Starts the local management service and the per-node overlay agents, waits until
 * each one is ready, and stops them (SIGTERM, grace period, then SIGKILL).
 *
 * INVARIANTS:
 * - exactly one handle per name: starting a name that is already running stops the
 *   previous process first
 * - a process that fails its readiness gate is stopped and deregistered before the
 *   error is returned
 * - every handle removed from the registry is terminated
 */

use futures::future::join_all;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("agent binary not found: {0}")]
    BinaryNotFound(PathBuf),
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} not ready after {timeout:?}")]
    StartupTimeout { name: String, timeout: Duration },
    #[error("{name} exited during startup")]
    ExitedEarly { name: String },
}

/// Registry name of the local management service.
pub const MANAGEMENT_SERVICE: &str = "management-service";

/// How to tell that a freshly spawned process is usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// `GET url` answers 2xx
    Http(String),
    /// the port accepts TCP connections
    Tcp { host: String, port: u16 },
    /// ready as soon as spawned
    None,
}

#[derive(Debug, Clone)]
pub struct AgentLaunch {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub rpc_port: Option<u16>,
    pub readiness: Readiness,
}

impl AgentLaunch {
    pub fn management_service(program: PathBuf, health_url: String) -> Self {
        Self {
            name: MANAGEMENT_SERVICE.to_string(),
            program,
            args: Vec::new(),
            rpc_port: None,
            readiness: Readiness::Http(health_url),
        }
    }

    /// Core agent joined to a node's network, control RPC on `rpc_host:rpc_port`.
    pub fn overlay_peer(
        name: &str,
        program: PathBuf,
        network: (&str, &str),
        peer: &str,
        rpc_host: &str,
        rpc_port: u16,
        extra_args: &[String],
    ) -> Self {
        let (network_name, network_secret) = network;
        let mut args = vec![
            "--network-name".to_string(),
            network_name.to_string(),
            "--network-secret".to_string(),
            network_secret.to_string(),
            "--peers".to_string(),
            peer.to_string(),
            "--rpc-portal".to_string(),
            format!("{rpc_host}:{rpc_port}"),
        ];
        args.extend(extra_args.iter().cloned());
        Self {
            name: name.to_string(),
            program,
            args,
            rpc_port: Some(rpc_port),
            readiness: Readiness::Tcp {
                host: rpc_host.to_string(),
                port: rpc_port,
            },
        }
    }
}

/// A supervised process. Owned by the supervisor registry only.
#[derive(Debug)]
pub struct AgentProcessHandle {
    pub name: String,
    pub instance_id: Uuid,
    pub rpc_port: Option<u16>,
    pub started_at: OffsetDateTime,
    child: Child,
}

impl AgentProcessHandle {
    fn info(&self) -> AgentInfo {
        AgentInfo {
            name: self.name.clone(),
            instance_id: self.instance_id,
            pid: self.child.id(),
            rpc_port: self.rpc_port,
            started_at: self.started_at,
        }
    }
}

/// Snapshot of a handle, safe to hand out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub name: String,
    pub instance_id: Uuid,
    pub pid: Option<u32>,
    pub rpc_port: Option<u16>,
    pub started_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub grace_period: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(5),
        }
    }
}

pub struct AgentSupervisor {
    handles: Mutex<HashMap<String, AgentProcessHandle>>,
    settings: SupervisorSettings,
    http: reqwest::Client,
}

impl AgentSupervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            settings,
            http: reqwest::Client::new(),
        }
    }

    /// Spawns `launch` and blocks until its readiness gate passes.
    pub async fn start(&self, launch: AgentLaunch) -> Result<AgentInfo, SupervisorError> {
        let previous = self.handles.lock().await.remove(&launch.name);
        if let Some(previous) = previous {
            info!(agent = %launch.name, "already running, restarting");
            terminate(previous, self.settings.grace_period).await;
        }

        let child = Command::new(&launch.program)
            .args(&launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::NotFound => SupervisorError::BinaryNotFound(launch.program.clone()),
                _ => SupervisorError::Spawn {
                    name: launch.name.clone(),
                    source,
                },
            })?;

        let handle = AgentProcessHandle {
            name: launch.name.clone(),
            instance_id: Uuid::new_v4(),
            rpc_port: launch.rpc_port,
            started_at: OffsetDateTime::now_utc(),
            child,
        };
        let info = handle.info();
        let stale = self.handles.lock().await.insert(launch.name.clone(), handle);
        if let Some(stale) = stale {
            terminate(stale, self.settings.grace_period).await;
        }
        debug!(agent = %launch.name, pid = ?info.pid, program = %launch.program.display(), "spawned");

        if let Err(e) = self.wait_ready(&launch.name, &launch.readiness).await {
            warn!(agent = %launch.name, error = %e, "startup failed, stopping");
            self.stop(&launch.name).await;
            return Err(e);
        }

        info!(agent = %launch.name, instance = %info.instance_id, rpc_port = ?info.rpc_port, "agent ready");
        Ok(info)
    }

    async fn wait_ready(&self, name: &str, readiness: &Readiness) -> Result<(), SupervisorError> {
        if *readiness == Readiness::None {
            return Ok(());
        }
        let deadline = Instant::now() + self.settings.startup_timeout;
        loop {
            if !self.is_running(name).await {
                return Err(SupervisorError::ExitedEarly { name: name.to_string() });
            }
            if self.probe_ready(readiness).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::StartupTimeout {
                    name: name.to_string(),
                    timeout: self.settings.startup_timeout,
                });
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    async fn probe_ready(&self, readiness: &Readiness) -> bool {
        let attempt = self.settings.poll_interval.max(Duration::from_millis(500));
        match readiness {
            Readiness::Http(url) => match self.http.get(url).timeout(attempt).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(_) => false,
            },
            Readiness::Tcp { host, port } => {
                matches!(timeout(attempt, TcpStream::connect((host.as_str(), *port))).await, Ok(Ok(_)))
            }
            Readiness::None => true,
        }
    }

    /// Stops and deregisters `name`. Returns false when nothing was registered under it.
    pub async fn stop(&self, name: &str) -> bool {
        let handle = self.handles.lock().await.remove(name);
        match handle {
            Some(handle) => {
                terminate(handle, self.settings.grace_period).await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.handles.lock().await.drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "stopping all agents");
        let grace = self.settings.grace_period;
        join_all(handles.into_iter().map(|h| terminate(h, grace))).await;
    }

    pub async fn list(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<_> = self.handles.lock().await.values().map(AgentProcessHandle::info).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// True while the process registered under `name` has not exited.
    pub async fn is_running(&self, name: &str) -> bool {
        let mut handles = self.handles.lock().await;
        match handles.get_mut(name) {
            Some(handle) => match handle.child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    debug!(agent = name, %status, "process exited");
                    false
                }
                Err(e) => {
                    warn!(agent = name, error = %e, "cannot query process state");
                    false
                }
            },
            None => false,
        }
    }
}

/// Graceful stop, then force kill once `grace` has elapsed.
async fn terminate(mut handle: AgentProcessHandle, grace: Duration) {
    if let Ok(Some(status)) = handle.child.try_wait() {
        debug!(agent = %handle.name, %status, "already exited");
        return;
    }

    request_shutdown(&mut handle);

    match timeout(grace, handle.child.wait()).await {
        Ok(Ok(status)) => info!(agent = %handle.name, %status, "agent stopped"),
        Ok(Err(e)) => warn!(agent = %handle.name, error = %e, "error waiting for agent"),
        Err(_) => {
            warn!(agent = %handle.name, ?grace, "grace period expired, force killing");
            if let Err(e) = handle.child.kill().await {
                warn!(agent = %handle.name, error = %e, "force kill failed");
            }
        }
    }
}

#[cfg(unix)]
fn request_shutdown(handle: &mut AgentProcessHandle) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = handle.child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(agent = %handle.name, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_shutdown(handle: &mut AgentProcessHandle) {
    if let Err(e) = handle.child.start_kill() {
        warn!(agent = %handle.name, error = %e, "failed to request shutdown");
    }
}

pub fn platform_suffix() -> &'static str {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "x86_64") => "linux-x64",
        ("windows", "x86_64") => "windows-x64",
        ("macos", "x86_64") => "macos-x64",
        ("macos", "aarch64") => "macos-arm64",
        _ => "unknown",
    }
}

/// `<bin_dir>/<platform>/<name>`, then `<bin_dir>/<name>`, else the bare name for a `PATH` lookup.
pub fn resolve_binary(bin_dir: &Path, name: &str) -> PathBuf {
    let file = if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    };
    [bin_dir.join(platform_suffix()).join(&file), bin_dir.join(&file)]
        .into_iter()
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(file))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn quick() -> AgentSupervisor {
        AgentSupervisor::new(SupervisorSettings {
            startup_timeout: Duration::from_millis(400),
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_millis(500),
        })
    }

    fn sleeper(name: &str) -> AgentLaunch {
        AgentLaunch {
            name: name.to_string(),
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            rpc_port: None,
            readiness: Readiness::None,
        }
    }

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_one_handle_per_name() {
        let sup = quick();
        let first = sup.start(sleeper("node-a")).await.unwrap();
        let second = sup.start(sleeper("node-a")).await.unwrap();
        sup.start(sleeper("node-b")).await.unwrap();

        let listed = sup.list().await;
        assert_eq!(listed.len(), 2);
        assert_ne!(first.instance_id, second.instance_id);
        assert_eq!(listed[0].instance_id, second.instance_id);

        sup.stop_all().await;
        assert!(sup.list().await.is_empty());
        assert!(!sup.stop("node-a").await);
    }

    #[tokio::test]
    async fn test_startup_timeout_deregisters() {
        let sup = quick();
        let mut launch = sleeper("late");
        launch.readiness = Readiness::Tcp { host: "127.0.0.1".into(), port: closed_port() };

        let err = sup.start(launch).await.unwrap_err();
        assert!(matches!(err, SupervisorError::StartupTimeout { .. }), "{err}");
        assert!(!sup.is_running("late").await);
        assert!(sup.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_exit_during_startup() {
        let sup = AgentSupervisor::new(SupervisorSettings {
            startup_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_millis(200),
        });
        let launch = AgentLaunch {
            name: "crashy".into(),
            program: PathBuf::from("true"),
            args: Vec::new(),
            rpc_port: None,
            readiness: Readiness::Tcp { host: "127.0.0.1".into(), port: closed_port() },
        };
        let err = sup.start(launch).await.unwrap_err();
        assert!(matches!(err, SupervisorError::ExitedEarly { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let mut launch = sleeper("ghost");
        launch.program = PathBuf::from("/nonexistent/nodewatch-agent");
        let err = quick().start(launch).await.unwrap_err();
        assert!(matches!(err, SupervisorError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_tcp_readiness() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut launch = sleeper("ready");
        launch.readiness = Readiness::Tcp { host: "127.0.0.1".into(), port };

        let sup = quick();
        sup.start(launch).await.unwrap();
        assert!(sup.is_running("ready").await);
        assert!(sup.stop("ready").await);
    }

    #[tokio::test]
    async fn test_force_kill_after_grace() {
        let sup = quick();
        let launch = AgentLaunch {
            name: "stubborn".into(),
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), "trap '' TERM; while true; do sleep 1; done".into()],
            rpc_port: None,
            readiness: Readiness::None,
        };
        sup.start(launch).await.unwrap();
        // let the shell install its trap
        sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        assert!(sup.stop("stubborn").await);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_overlay_peer_args() {
        let launch = AgentLaunch::overlay_peer(
            "hk-1",
            PathBuf::from("easytier-core"),
            ("net", "pw"),
            "tcp://10.0.0.1:11010",
            "127.0.0.1",
            15888,
            &["--no-tun".to_string()],
        );
        assert_eq!(
            launch.args,
            vec![
                "--network-name", "net", "--network-secret", "pw", "--peers",
                "tcp://10.0.0.1:11010", "--rpc-portal", "127.0.0.1:15888", "--no-tun"
            ]
        );
        assert_eq!(launch.readiness, Readiness::Tcp { host: "127.0.0.1".into(), port: 15888 });
    }

    #[test]
    fn test_resolve_binary_layout() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_binary(dir.path(), "easytier-core"), PathBuf::from("easytier-core"));

        let platform_dir = dir.path().join(platform_suffix());
        std::fs::create_dir_all(&platform_dir).unwrap();
        std::fs::write(platform_dir.join("easytier-core"), b"").unwrap();
        assert_eq!(
            resolve_binary(dir.path(), "easytier-core"),
            platform_dir.join("easytier-core")
        );
    }
}
