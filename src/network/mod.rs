//! User-mode networking through gvproxy.
//!
//! gvproxy forwards the guest's SSH port and API socket to the host. It is
//! started before the hypervisor helper and must have created its services
//! socket before the guest boots.

pub mod connections;
pub mod ssh_port;

pub use connections::{Connection, ConnectionRegistry};
pub use ssh_port::{ensure_ssh_port, reassign_ssh_port};

use crate::config::OvmConfig;
use crate::error::{Error, Result};
use crate::machine::MachineConfig;
use crate::process::{ProcessRegistry, ProcessRole, ProcessStatus};
use crate::provider::VmProvider;
use crate::retry::{retry_async, RetryPolicy};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Guest MTU passed to the proxy.
const MTU: u16 = 1500;

/// One socket forwarded from the guest to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    /// Host-side Unix socket.
    pub host_socket: PathBuf,
    /// Guest-side socket path.
    pub guest_socket: String,
    /// Guest user the forward logs in as.
    pub user: String,
    /// Private key for that user.
    pub identity: PathBuf,
}

/// gvproxy command line.
#[derive(Debug, Clone)]
pub struct GvproxyCommand {
    binary: PathBuf,
    ssh_port: u16,
    pid_file: PathBuf,
    log_file: PathBuf,
    services: Option<PathBuf>,
    listen_vfkit: Option<PathBuf>,
    forwards: Vec<Forward>,
}

impl GvproxyCommand {
    /// A command for `binary` forwarding `ssh_port`.
    pub fn new(binary: impl Into<PathBuf>, ssh_port: u16, pid_file: &Path, log_file: &Path) -> Self {
        Self {
            binary: binary.into(),
            ssh_port,
            pid_file: pid_file.to_path_buf(),
            log_file: log_file.to_path_buf(),
            services: None,
            listen_vfkit: None,
            forwards: Vec::new(),
        }
    }

    /// HTTP services endpoint; its appearance means the proxy is up.
    pub fn services(&mut self, socket: &Path) -> &mut Self {
        self.services = Some(socket.to_path_buf());
        self
    }

    /// Datagram socket shared with a vfkit-style helper.
    pub fn listen_vfkit(&mut self, socket: &Path) -> &mut Self {
        self.listen_vfkit = Some(socket.to_path_buf());
        self
    }

    /// Add a forwarding tuple.
    pub fn forward(&mut self, forward: Forward) -> &mut Self {
        self.forwards.push(forward);
        self
    }

    /// Rendered arguments.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-mtu".to_string(),
            MTU.to_string(),
            "-ssh-port".to_string(),
            self.ssh_port.to_string(),
            "-pid-file".to_string(),
            self.pid_file.display().to_string(),
            "-log-file".to_string(),
            self.log_file.display().to_string(),
        ];
        if let Some(sock) = &self.listen_vfkit {
            args.push("-listen-vfkit".into());
            args.push(format!("unixgram://{}", sock.display()));
        }
        if let Some(sock) = &self.services {
            args.push("-services".into());
            args.push(format!("unix://{}", sock.display()));
        }
        for f in &self.forwards {
            args.extend([
                "-forward-sock".to_string(),
                f.host_socket.display().to_string(),
                "-forward-dest".to_string(),
                f.guest_socket.clone(),
                "-forward-user".to_string(),
                f.user.clone(),
                "-forward-identity".to_string(),
                f.identity.display().to_string(),
            ]);
        }
        args
    }

    /// Detached process command.
    pub fn build(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        crate::provider::helper_detach(&mut cmd);
        cmd
    }
}

/// Runtime files of the proxy for a machine.
#[derive(Debug, Clone)]
pub struct ProxyFiles {
    /// Pid file gvproxy writes.
    pub pid_file: PathBuf,
    /// gvproxy log.
    pub log_file: PathBuf,
    /// Services socket.
    pub services_socket: PathBuf,
}

impl ProxyFiles {
    /// Paths for `mc`.
    pub fn for_machine(mc: &MachineConfig) -> Self {
        Self {
            pid_file: mc.runtime_file("gvproxy.pid").path().to_path_buf(),
            log_file: mc.runtime_file("gvproxy.log").path().to_path_buf(),
            services_socket: mc.runtime_file("gvproxy-api.sock").path().to_path_buf(),
        }
    }
}

/// Build the proxy command for `mc`, letting the provider add its arguments.
pub fn proxy_command(
    config: &OvmConfig,
    mc: &MachineConfig,
    provider: &dyn VmProvider,
) -> Result<GvproxyCommand> {
    let files = ProxyFiles::for_machine(mc);
    let mut cmd = GvproxyCommand::new(
        &config.gvproxy_binary,
        mc.ssh.port,
        &files.pid_file,
        &files.log_file,
    );
    cmd.services(&files.services_socket);
    cmd.forward(Forward {
        host_socket: mc.api_socket().path().to_path_buf(),
        guest_socket: mc.guest_api_socket(),
        user: mc.ssh.remote_username.clone(),
        identity: mc.ssh.identity_path.path().to_path_buf(),
    });
    provider.start_networking(mc, &mut cmd)?;
    Ok(cmd)
}

/// Start gvproxy for `mc` and wait for its services socket.
pub async fn start_network_proxy(
    config: &OvmConfig,
    mc: &MachineConfig,
    provider: &dyn VmProvider,
    registry: &ProcessRegistry,
) -> Result<u32> {
    let files = ProxyFiles::for_machine(mc);
    let api_socket = mc.api_socket();
    for stale in [
        files.pid_file.as_path(),
        files.services_socket.as_path(),
        api_socket.path(),
    ] {
        crate::vmfile::VmFile::new(stale).delete_if_exists()?;
    }

    let cmd = proxy_command(config, mc, provider)?;
    tracing::debug!(machine = %mc.name, args = ?cmd.args(), "starting network proxy");

    let child = cmd.build().spawn().map_err(|e| {
        Error::network(
            format!("spawn {}", config.gvproxy_binary.display()),
            e.to_string(),
        )
    })?;
    let pid = child.id();
    registry.register(ProcessRole::NetworkProxy, pid);
    tracing::info!(machine = %mc.name, pid, port = mc.ssh.port, "network proxy started");

    wait_for_socket(&files.services_socket, registry, ProcessRole::NetworkProxy).await?;
    Ok(pid)
}

/// Stop the proxy recorded in `mc`'s pid file. No pid file is fine.
pub fn stop_network_proxy(mc: &MachineConfig) -> Result<()> {
    let files = ProxyFiles::for_machine(mc);
    if let Some(pid) = crate::process::read_pid_file(&files.pid_file) {
        crate::process::stop_process(pid, crate::process::DEFAULT_STOP_TIMEOUT, true)?;
        tracing::info!(machine = %mc.name, pid, "network proxy stopped");
    }
    for file in [&files.pid_file, &files.services_socket] {
        crate::vmfile::VmFile::new(file).delete_if_exists()?;
    }
    Ok(())
}

/// Wait with backoff for `socket` to appear.
///
/// Fails early with [`Error::ProcessDied`] if the process that should
/// create it exits first.
pub async fn wait_for_socket(
    socket: &Path,
    registry: &ProcessRegistry,
    owner: ProcessRole,
) -> Result<()> {
    let policy = RetryPolicy::exponential(
        12,
        Duration::from_millis(50),
        Duration::from_secs(2),
    );

    let outcome = retry_async(policy, move |_| async move {
        if socket.exists() {
            return Ok(Ok(()));
        }
        if let Some(ProcessStatus::Exited(_)) = registry.check(owner) {
            let pid = registry.pid(owner).unwrap_or_default();
            return Ok(Err(Error::ProcessDied {
                role: owner.to_string(),
                pid,
            }));
        }
        Err(())
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(exhausted) => Err(Error::Timeout(format!(
            "waiting for {} after {} attempts",
            socket.display(),
            exhausted.attempts
        ))),
    }
}

/// Poll the guest API with `_ping` until it answers or `timeout` elapses.
#[cfg(unix)]
pub async fn wait_and_ping_api(mc: &MachineConfig, timeout: Duration) -> Result<()> {
    let socket = mc.api_socket().path().to_path_buf();
    let policy = RetryPolicy::until(timeout, Duration::from_millis(200));
    retry_async(policy, |_| ping_unix(&socket))
        .await
        .map_err(|e| {
            tracing::debug!(error = %e.last_error, "last ping failure");
            Error::Timeout(format!("waiting for the guest API on {}", socket.display()))
        })?;
    tracing::debug!(machine = %mc.name, "guest API answered ping");
    Ok(())
}

/// Without forwarded Unix sockets, wait for the SSH port to accept instead.
#[cfg(not(unix))]
pub async fn wait_and_ping_api(mc: &MachineConfig, timeout: Duration) -> Result<()> {
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], mc.ssh.port));
    let policy = RetryPolicy::until(timeout, Duration::from_millis(200));
    retry_async(policy, move |_| async move {
        tokio::net::TcpStream::connect(addr)
            .await
            .map(|_| ())
            .map_err(|e| Error::network("connect to guest", e.to_string()))
    })
    .await
    .map_err(|_| Error::Timeout(format!("waiting for the guest on {}", addr)))
}

/// One `GET /_ping` over a Unix socket.
#[cfg(unix)]
pub async fn ping_unix(socket: &Path) -> Result<()> {
    use http_body_util::Empty;
    use hyper::body::Bytes;
    use hyper::{Method, Request};
    use hyper_util::rt::TokioIo;

    let attempt = async {
        let stream = tokio::net::UnixStream::connect(socket)
            .await
            .map_err(|e| Error::network("connect to guest API", e.to_string()))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| Error::network("guest API handshake", e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::trace!(error = %e, "ping connection closed");
            }
        });

        let request = Request::builder()
            .method(Method::GET)
            .uri("http://d/_ping")
            .header("Host", "d")
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::network("build ping request", e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::network("ping guest API", e.to_string()))?;
        Ok::<_, Error>(response.status())
    };

    let status = tokio::time::timeout(Duration::from_secs(1), attempt)
        .await
        .map_err(|_| Error::Timeout("waiting for ping response".into()))??;

    if status.is_success() {
        Ok(())
    } else {
        Err(Error::network(
            "ping guest API",
            format!("unexpected status {}", status),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessRegistry;

    fn sample_command() -> GvproxyCommand {
        let mut cmd = GvproxyCommand::new(
            "gvproxy",
            40022,
            Path::new("/run/vm1-gvproxy.pid"),
            Path::new("/run/vm1-gvproxy.log"),
        );
        cmd.services(Path::new("/run/vm1-gvproxy-api.sock"))
            .listen_vfkit(Path::new("/run/vm1-gvproxy.sock"))
            .forward(Forward {
                host_socket: PathBuf::from("/run/vm1-api.sock"),
                guest_socket: "/run/user/501/ovm/ovm_guest.sock".into(),
                user: "root".into(),
                identity: PathBuf::from("/keys/vm1"),
            });
        cmd
    }

    fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.windows(2)
            .find(|w| w[0] == flag)
            .map(|w| w[1].as_str())
    }

    #[test]
    fn test_gvproxy_args() {
        let args = sample_command().args();
        assert_eq!(value_of(&args, "-ssh-port"), Some("40022"));
        assert_eq!(value_of(&args, "-pid-file"), Some("/run/vm1-gvproxy.pid"));
        assert_eq!(value_of(&args, "-log-file"), Some("/run/vm1-gvproxy.log"));
        assert_eq!(
            value_of(&args, "-services"),
            Some("unix:///run/vm1-gvproxy-api.sock")
        );
        assert_eq!(
            value_of(&args, "-listen-vfkit"),
            Some("unixgram:///run/vm1-gvproxy.sock")
        );
        assert_eq!(value_of(&args, "-forward-sock"), Some("/run/vm1-api.sock"));
        assert_eq!(
            value_of(&args, "-forward-dest"),
            Some("/run/user/501/ovm/ovm_guest.sock")
        );
        assert_eq!(value_of(&args, "-forward-user"), Some("root"));
        assert_eq!(value_of(&args, "-forward-identity"), Some("/keys/vm1"));
    }

    #[tokio::test]
    async fn test_wait_for_socket_appears() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("svc.sock");
        let writer = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(writer, b"").unwrap();
        });

        let registry = ProcessRegistry::new();
        wait_for_socket(&path, &registry, ProcessRole::NetworkProxy)
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_for_socket_owner_died() {
        let temp = tempfile::tempdir().unwrap();
        let child = std::process::Command::new("true").spawn().unwrap();
        let registry = ProcessRegistry::new();
        registry.register(ProcessRole::NetworkProxy, child.id());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = wait_for_socket(&temp.path().join("never"), &registry, ProcessRole::NetworkProxy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessDied { .. }), "got {err}");
    }

    /// Answer one request on `sock` with `response`, leaving the connection open.
    #[cfg(unix)]
    fn serve_once(sock: &Path, response: &'static [u8]) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::UnixListener::bind(sock).unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            let _ = conn.read(&mut buf).await.unwrap();
            conn.write_all(response).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ping_unix() {
        let temp = tempfile::tempdir().unwrap();
        let sock = temp.path().join("api.sock");
        serve_once(&sock, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK");

        ping_unix(&sock).await.unwrap();
        assert!(ping_unix(&temp.path().join("missing.sock")).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ping_unix_chunked_keep_alive() {
        let temp = tempfile::tempdir().unwrap();
        let sock = temp.path().join("api.sock");
        serve_once(
            &sock,
            b"HTTP/1.1 204 No Content\r\nConnection: keep-alive\r\n\r\n",
        );
        ping_unix(&sock).await.unwrap();

        let sock = temp.path().join("chunked.sock");
        serve_once(
            &sock,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nOK\r\n0\r\n\r\n",
        );
        ping_unix(&sock).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ping_unix_rejects_error_status() {
        let temp = tempfile::tempdir().unwrap();
        let sock = temp.path().join("api.sock");
        serve_once(
            &sock,
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
        );

        let err = ping_unix(&sock).await.unwrap_err();
        assert!(matches!(err, Error::Network { .. }), "got {err}");
    }
}
