//! Machine lifecycle orchestration.
//!
//! [`Orchestrator`] drives a machine through init, start, stop and set on
//! top of the active [`VmProvider`]. Every persisted mutation happens under
//! the machine's lock file; every external side effect of a multi-step
//! operation is paired with an undo action on a [`CleanupStack`].
//!
//! `start` runs for the lifetime of the machine: it returns when the guest
//! shuts down, when `stop` is called from another invocation, or with an
//! error when the supervising parent or a companion process dies.

use crate::api;
use crate::cleanup::CleanupStack;
use crate::config::OvmConfig;
use crate::error::{Error, Result};
use crate::host;
use crate::machine::config::machine_lock;
use crate::machine::disk::DataDisk;
use crate::machine::mounts::parse_volumes;
use crate::machine::{
    validate_name, InitOptions, MachineConfig, MachineState, SetOptions, StartOptions, VmType,
};
use crate::network::{self, ensure_ssh_port, ConnectionRegistry};
use crate::paths::{MachineDirs, OvmPaths};
use crate::ports::PortAllocator;
use crate::process::{self, ProcessRegistry, ProcessRole, ProcessStatus};
use crate::provider::{SharedProvider, VmProvider};
use crate::report::Reporter;
use crate::ssh::{self, SshTarget};
use crate::vmfile::VmFile;
use crate::watchdog::{Watchdog, WatchdogEvent};
use chrono::{DateTime, Utc};
use ovm_protocol::Stage;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Time companions get to exit after SIGTERM during teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle operations over one provider.
pub struct Orchestrator {
    provider: SharedProvider,
    config: OvmConfig,
    paths: OvmPaths,
    dirs: MachineDirs,
    ports: PortAllocator,
    connections: ConnectionRegistry,
    registry: Arc<ProcessRegistry>,
}

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineSummary {
    /// Machine name.
    pub name: String,
    /// Provider.
    pub vm_type: VmType,
    /// Observed state.
    pub state: MachineState,
    /// vCPUs.
    pub cpus: u32,
    /// Memory in MiB.
    pub memory: u64,
    /// Data disk size in GiB.
    pub disk_size: u64,
    /// Forwarded SSH port (0 until first start).
    pub ssh_port: u16,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last time the guest became ready.
    pub last_up: Option<DateTime<Utc>>,
}

impl Orchestrator {
    /// Orchestrator for `provider`. Helpers it starts are tracked in `registry`.
    pub fn new(
        provider: SharedProvider,
        config: OvmConfig,
        paths: OvmPaths,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        let dirs = paths.machine_dirs(provider.vm_type());
        Self {
            ports: PortAllocator::new(&paths),
            connections: ConnectionRegistry::new(&paths),
            provider,
            config,
            paths,
            dirs,
            registry,
        }
    }

    /// Active provider.
    pub fn provider(&self) -> &dyn VmProvider {
        self.provider.as_ref()
    }

    /// Directories of the active provider.
    pub fn dirs(&self) -> &MachineDirs {
        &self.dirs
    }

    /// Filesystem roots.
    pub fn paths(&self) -> &OvmPaths {
        &self.paths
    }

    /// Helper processes started through this orchestrator.
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// Create or re-initialise a machine.
    ///
    /// Validation happens before anything is written. Disks, keys and launch
    /// state created here are removed again if a later step fails or the
    /// future is dropped.
    pub async fn init(&self, opts: InitOptions) -> Result<MachineConfig> {
        let ppid = opts.ppid.unwrap_or_else(process::parent_pid);
        process::ensure_parent_alive(ppid)?;
        validate_name(&opts.name)?;

        if self.provider.exists(&opts.name)? {
            return Err(Error::AlreadyExists(opts.name.clone()));
        }

        host::check_memory(opts.memory)?;
        host::check_cpus(opts.cpus, self.provider.max_cpus())?;
        if opts.disk_size == 0 {
            return Err(Error::config("validate disk size", "disk size must be at least 1 GiB"));
        }
        let mounts = parse_volumes(&opts.volumes, self.provider.mount_type())?;

        self.dirs.create_all()?;
        let _lock = machine_lock(&self.dirs, &opts.name).acquire()?;

        let previous = match MachineConfig::load_by_name(&opts.name, &self.dirs) {
            Ok(mc) => Some(mc),
            Err(Error::NoSuchVm(_)) => None,
            Err(e @ Error::Incompatible { .. }) => {
                tracing::warn!(machine = %opts.name, error = %e, "replacing incompatible machine config");
                None
            }
            Err(e) => return Err(e),
        };

        let mut cleanup = CleanupStack::new();
        let identity = self.resolve_identity(&opts, previous.as_ref(), &mut cleanup)?;

        let hypervisor = self.provider.hypervisor_config(&opts.name, &self.dirs);
        let mut mc = MachineConfig::new(&opts, &self.dirs, hypervisor, identity, mounts);
        if let Some(prev) = &previous {
            mc.ssh.port = prev.ssh.port;
            mc.created = prev.created;
        }

        let boot_unchanged = previous.as_ref().is_some_and(|prev| {
            !opts.boot_version.is_empty() && prev.image.boot_version == opts.boot_version
        }) && mc.image_path.exists();
        if boot_unchanged {
            tracing::info!(machine = %mc.name, version = %opts.boot_version, "boot image unchanged, skipping fetch");
        } else {
            let image = mc.image_path.clone();
            cleanup.push("remove root image", move || image.delete_if_exists());

            let provider = self.provider.clone();
            let dirs = self.dirs.clone();
            let input = opts.boot_image.clone();
            let target = mc.clone();
            blocking(move || provider.get_disk(input.as_deref(), &dirs, &target)).await?;
            tracing::info!(machine = %mc.name, image = %mc.image_path, "root image in place");
        }
        mc.image.boot_version = opts.boot_version.clone();

        if self.provider.uses_data_disk() {
            let path = self.dirs.data_dir.append(format!("{}-data.raw", mc.name));
            let recreate = match &previous {
                Some(prev) => {
                    prev.image.data_version != opts.data_version
                        || prev.resources.disk_size != opts.disk_size
                        || !path.exists()
                }
                None => true,
            };
            if recreate {
                let disk_path = path.clone();
                cleanup.push("remove data disk", move || disk_path.delete_if_exists());
                let target = path.path().to_path_buf();
                let size = opts.disk_size;
                let disk = blocking(move || DataDisk::recreate(&target, size)).await?;
                tracing::info!(machine = %mc.name, size_gb = disk.size_gb(), "data disk created");
            }
            mc.image.data_disk_path = Some(path);
        }
        mc.image.data_version = opts.data_version.clone();

        let provider = self.provider.clone();
        let create_opts = opts.clone();
        let mc = blocking(move || {
            let mut mc = mc;
            provider.create_vm(&create_opts, &mut mc)?;
            Ok(mc)
        })
        .await?;

        mc.write()?;
        cleanup.disarm();
        tracing::info!(machine = %mc.name, vm_type = %mc.vm_type, "machine initialised");
        Ok(mc)
    }

    fn resolve_identity(
        &self,
        opts: &InitOptions,
        previous: Option<&MachineConfig>,
        cleanup: &mut CleanupStack,
    ) -> Result<VmFile> {
        if let Some(path) = &opts.identity_path {
            let key = VmFile::new(path);
            if !key.exists() {
                return Err(Error::config(
                    "resolve ssh identity",
                    format!("{} does not exist", key),
                ));
            }
            return Ok(key);
        }
        if let Some(prev) = previous.filter(|p| p.ssh.identity_path.exists()) {
            return Ok(prev.ssh.identity_path.clone());
        }

        let key = self.dirs.data_dir.append(&opts.name);
        if key.exists() {
            return Ok(key);
        }
        generate_ssh_key(key.path())?;
        let private = key.clone();
        cleanup.push("remove ssh key", move || {
            private.delete_if_exists()?;
            VmFile::new(format!("{}.pub", private)).delete_if_exists()
        });
        Ok(key)
    }

    /// Start a stopped machine and supervise it until it goes away.
    pub async fn start(&self, name: &str, opts: StartOptions) -> Result<()> {
        let reporter = Reporter::new(name, opts.report_url.as_deref());
        let result = self.run_machine(name, &opts, &reporter).await;
        match &result {
            Ok(()) => reporter.send(Stage::Exit, "").await,
            Err(e) => reporter.send(Stage::Error, e.to_string()).await,
        }
        result
    }

    async fn run_machine(&self, name: &str, opts: &StartOptions, reporter: &Reporter) -> Result<()> {
        validate_name(name)?;
        let ppid = opts.ppid.unwrap_or_else(process::parent_pid);
        process::ensure_parent_alive(ppid)?;

        let mut mc = {
            let _lock = machine_lock(&self.dirs, name).acquire()?;
            let mut mc = MachineConfig::load_by_name(name, &self.dirs)?;
            let state = self.provider.state(&mc)?;
            if state != MachineState::Stopped {
                return Err(Error::wrong_state(MachineState::Stopped.to_string(), state));
            }
            ensure_ssh_port(&mut mc, self.provider.as_ref(), &self.ports, &self.connections)?;
            mc.starting = true;
            mc.write()?;
            mc
        };

        let mut cleanup = CleanupStack::new();
        {
            let dirs = self.dirs.clone();
            let name = mc.name.clone();
            cleanup.push("clear starting flag", move || {
                let _lock = machine_lock(&dirs, &name).acquire()?;
                let mut mc = MachineConfig::load_by_name(&name, &dirs)?;
                if mc.starting {
                    mc.starting = false;
                    mc.write()?;
                }
                Ok(())
            });
            let registry = self.registry.clone();
            cleanup.push("stop companion processes", move || {
                registry.kill_all(TEARDOWN_TIMEOUT);
                Ok(())
            });
        }
        reporter.send(Stage::Starting, "").await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let listen = opts
            .api_listen
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));
        let listener = api::bind(listen).await?;
        let mut server_cancel = cancel_rx.clone();
        let mut server = tokio::spawn(api::serve(listener, api::control_router(), async move {
            let _ = server_cancel.wait_for(|cancelled| *cancelled).await;
        }));

        if !self.provider.use_provider_network_setup() {
            network::start_network_proxy(&self.config, &mc, self.provider.as_ref(), &self.registry)
                .await?;
            reporter.send(Stage::NetworkReady, "").await;
        }

        if opts.command_proxy {
            match self.spawn_command_proxy(&mc) {
                Ok(pid) => tracing::info!(machine = %mc.name, pid, "command proxy started"),
                Err(e) => tracing::warn!(machine = %mc.name, error = %e, "command proxy not started"),
            }
        }

        let ready = ReadySignal::bind(self.provider.ready_socket(&mc))?;
        let hypervisor_pid = self.provider.start_vm(&mc, &self.registry)?;
        reporter
            .send(Stage::VmLaunched, format!("pid {}", hypervisor_pid))
            .await;

        let mut watch_task = tokio::spawn(Watchdog::new(ppid, self.registry.clone()).run(cancel_rx));

        tokio::select! {
            ready = self.wait_ready(&mc, ready) => ready?,
            event = &mut watch_task => {
                let event = event.map_err(|e| Error::provider("watchdog", e.to_string()))?;
                return self.teardown(&mc, hypervisor_pid, event).await;
            }
        }

        {
            let _lock = mc.lock()?;
            mc.starting = false;
            mc.last_up = Some(Utc::now());
            mc.write()?;
        }
        tracing::info!(machine = %mc.name, port = mc.ssh.port, "machine running");
        reporter.send(Stage::Ready, "").await;

        if let Err(e) = ssh::sync_clock(&SshTarget::for_machine(&mc)).await {
            tracing::debug!(machine = %mc.name, error = %e, "guest clock sync skipped");
        }

        let event = tokio::select! {
            event = &mut watch_task => {
                event.map_err(|e| Error::provider("watchdog", e.to_string()))?
            }
            served = &mut server => {
                let _ = cancel_tx.send(true);
                let reason = match served {
                    Ok(Ok(())) => "stopped".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                };
                tracing::warn!(machine = %mc.name, reason = %reason, "control plane exited");
                let event = watch_task
                    .await
                    .map_err(|e| Error::provider("watchdog", e.to_string()))?;
                self.teardown(&mc, hypervisor_pid, event).await?;
                return Err(Error::network("serve control plane", reason));
            }
        };

        let result = self.teardown(&mc, hypervisor_pid, event).await;
        let _ = cancel_tx.send(true);
        if tokio::time::timeout(Duration::from_secs(5), server).await.is_err() {
            tracing::debug!("control plane did not shut down in time");
        }
        cleanup.run();
        result
    }

    async fn wait_ready(&self, mc: &MachineConfig, ready: ReadySignal) -> Result<()> {
        ready.wait(self.config.ready_timeout).await?;
        network::wait_and_ping_api(mc, self.config.api_ping_timeout).await
    }

    /// Stop what is left of a machine after the watchdog fired.
    async fn teardown(
        &self,
        mc: &MachineConfig,
        hypervisor_pid: u32,
        event: WatchdogEvent,
    ) -> Result<()> {
        let requested = matches!(
            event,
            WatchdogEvent::Died {
                role: ProcessRole::Hypervisor,
                ..
            }
        ) && process::read_pid_file(mc.hypervisor.pid_file().path()) != Some(hypervisor_pid);

        let result = if requested {
            tracing::info!(machine = %mc.name, "machine stopped");
            Ok(())
        } else {
            event.into_result()
        };

        if let Err(e) = &result {
            tracing::warn!(machine = %mc.name, error = %e, "stopping machine");
            if self.registry.check(ProcessRole::Hypervisor) == Some(ProcessStatus::Running) {
                if let Err(e) = ssh::sync_filesystems(&SshTarget::for_machine(mc)).await {
                    tracing::debug!(machine = %mc.name, error = %e, "guest sync failed");
                }
            }
        }

        if !requested {
            if let Err(e) = self.provider.stop_vm(mc, true) {
                tracing::warn!(machine = %mc.name, error = %e, "hypervisor stop failed");
            }
        }
        self.registry.kill_all(TEARDOWN_TIMEOUT);
        network::stop_network_proxy(mc)?;
        result
    }

    fn spawn_command_proxy(&self, mc: &MachineConfig) -> Result<u32> {
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(&exe);
        cmd.args(["machine", "cmd-proxy", mc.name.as_str(), "--ppid"])
            .arg(std::process::id().to_string())
            .arg("--port")
            .arg(self.config.cmd_proxy_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        crate::provider::helper_detach(&mut cmd);
        let child = cmd
            .spawn()
            .map_err(|e| Error::network("spawn command proxy", e.to_string()))?;
        let pid = child.id();
        self.registry.register(ProcessRole::CommandProxy, pid);
        Ok(pid)
    }

    /// Stop a machine. Stopping a stopped machine succeeds.
    ///
    /// The SSH port stays reserved.
    pub fn stop(&self, name: &str, hard_stop: bool) -> Result<()> {
        validate_name(name)?;
        let _lock = machine_lock(&self.dirs, name).acquire()?;
        let mut mc = MachineConfig::load_by_name(name, &self.dirs)?;

        match self.provider.state(&mc)? {
            MachineState::Stopped => {
                tracing::info!(machine = %name, "machine already stopped");
            }
            state => {
                tracing::debug!(machine = %name, %state, hard_stop, "stopping machine");
                self.provider.stop_vm(&mc, hard_stop)?;
            }
        }
        network::stop_network_proxy(&mc)?;

        if mc.starting {
            mc.starting = false;
            mc.write()?;
        }
        Ok(())
    }

    /// Change settings of a stopped machine.
    pub fn set(&self, name: &str, opts: SetOptions) -> Result<MachineConfig> {
        validate_name(name)?;
        let _lock = machine_lock(&self.dirs, name).acquire()?;
        let mut mc = MachineConfig::load_by_name(name, &self.dirs)?;

        let state = self.provider.state(&mc)?;
        if state != MachineState::Stopped {
            return Err(Error::wrong_state(MachineState::Stopped.to_string(), state));
        }

        if let Some(memory) = opts.memory {
            host::check_memory(memory)?;
        }
        if let Some(cpus) = opts.cpus {
            host::check_cpus(cpus, self.provider.max_cpus())?;
        }
        let mounts = opts
            .volumes
            .as_ref()
            .map(|specs| parse_volumes(specs, self.provider.mount_type()))
            .transpose()?;

        self.provider.set_provider_attributes(&mut mc, &opts)?;
        if let Some(mounts) = mounts {
            mc.mounts = mounts;
        }
        mc.write()?;
        tracing::info!(machine = %name, "machine updated");
        Ok(mc)
    }

    /// Every machine of the active provider with its live state.
    pub fn list(&self) -> Result<Vec<MachineSummary>> {
        let machines = MachineConfig::load_all_in_dir(&self.dirs)?;
        Ok(machines
            .into_values()
            .map(|mc| {
                let state = self.provider.state(&mc).unwrap_or_else(|e| {
                    tracing::warn!(machine = %mc.name, error = %e, "could not query state");
                    MachineState::Stopped
                });
                MachineSummary {
                    state,
                    vm_type: mc.vm_type,
                    cpus: mc.resources.cpus,
                    memory: mc.resources.memory,
                    disk_size: mc.resources.disk_size,
                    ssh_port: mc.ssh.port,
                    created: mc.created,
                    last_up: mc.last_up,
                    name: mc.name,
                }
            })
            .collect())
    }
}

/// Remove every machine of every provider, plus shared bookkeeping.
///
/// Keeps going after failures and returns all of them.
pub fn reset(providers: &[SharedProvider], paths: &OvmPaths) -> Result<()> {
    let mut errors = Vec::new();

    for provider in providers {
        let dirs = paths.machine_dirs(provider.vm_type());
        match MachineConfig::load_all_in_dir(&dirs) {
            Ok(machines) => {
                for mc in machines.values() {
                    if let Err(e) = stop_for_reset(provider.as_ref(), mc) {
                        errors.push(e);
                    }
                }
            }
            Err(e) => errors.push(e),
        }

        if let Err(e) = provider.remove_all() {
            errors.push(e);
        }

        for dir in [&dirs.config_dir, &dirs.data_dir, &dirs.runtime_dir] {
            if let Err(e) = crate::util::remove_dir_all_guarded(dir.path()) {
                errors.push(e);
            }
        }
    }

    for file in [
        paths.port_alloc_file(),
        paths.port_alloc_lock(),
        paths.connections_file(),
    ] {
        if let Err(e) = VmFile::new(file).delete_if_exists() {
            errors.push(e);
        }
    }

    tracing::info!(failures = errors.len(), "reset finished");
    Error::from_many(errors)
}

fn stop_for_reset(provider: &dyn VmProvider, mc: &MachineConfig) -> Result<()> {
    if provider.state(mc)? != MachineState::Stopped {
        provider.stop_vm(mc, true)?;
    }
    network::stop_network_proxy(mc)
}

/// Run blocking provider work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::provider("background task", e.to_string()))?
}

fn generate_ssh_key(path: &Path) -> Result<()> {
    tracing::info!(path = %path.display(), "generating ssh key");
    let output = Command::new("ssh-keygen")
        .args(["-t", "ed25519", "-N", "", "-q", "-C", "ovm", "-f"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::ssh("run ssh-keygen", e.to_string()))?;
    if !output.status.success() {
        return Err(Error::ssh(
            "generate key",
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}

/// Listener the guest connects to once booted.
struct ReadySignal {
    #[cfg(unix)]
    listener: Option<(tokio::net::UnixListener, VmFile)>,
}

impl ReadySignal {
    #[cfg(unix)]
    fn bind(socket: Option<VmFile>) -> Result<Self> {
        let Some(socket) = socket else {
            return Ok(Self { listener: None });
        };
        socket.delete_if_exists()?;
        let listener = tokio::net::UnixListener::bind(socket.path())
            .map_err(|e| Error::network(format!("bind {}", socket), e.to_string()))?;
        Ok(Self {
            listener: Some((listener, socket)),
        })
    }

    #[cfg(not(unix))]
    fn bind(_socket: Option<VmFile>) -> Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn wait(self, timeout: Duration) -> Result<()> {
        let Some((listener, socket)) = self.listener else {
            return Ok(());
        };
        let accepted = tokio::time::timeout(timeout, listener.accept())
            .await
            .map_err(|_| Error::Timeout(format!("waiting for the guest on {}", socket)))?
            .map_err(|e| Error::network("accept ready connection", e.to_string()));
        drop(listener);
        if let Err(e) = socket.delete_if_exists() {
            tracing::debug!(error = %e, "could not remove ready socket");
        }
        accepted?;
        tracing::debug!("guest signalled ready");
        Ok(())
    }

    #[cfg(not(unix))]
    async fn wait(self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}
