//! End-to-end lifecycle against a fake provider and a fake network proxy.
//!
//! The fake hypervisor is a `sleep` child that also answers `_ping` on the
//! machine's API socket. The fake gvproxy is a shell script honouring
//! `-pid-file` and `-services`.

#![cfg(unix)]

use ovm::config::OvmConfig;
use ovm::machine::shim::Orchestrator;
use ovm::machine::{
    HelperConfig, HypervisorConfig, InitOptions, MachineConfig, MachineState, SetOptions,
    StartOptions, VmType,
};
use ovm::network::GvproxyCommand;
use ovm::paths::{MachineDirs, OvmPaths};
use ovm::process::{self, ProcessRegistry, ProcessRole};
use ovm::provider::{SharedProvider, VmProvider};
use ovm::vmfile::VmFile;
use ovm::Error;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

const FAKE_GVPROXY: &str = r#"#!/bin/sh
pid_file=""
services=""
while [ $# -gt 0 ]; do
    case "$1" in
        -pid-file) pid_file="$2"; shift ;;
        -services) services="${2#unix://}"; shift ;;
    esac
    shift
done
echo $$ > "$pid_file"
touch "$services"
exec sleep 300
"#;

struct FakeProvider {
    dirs: MachineDirs,
}

impl FakeProvider {
    fn pid_file(mc: &MachineConfig) -> &VmFile {
        mc.hypervisor.pid_file()
    }
}

/// Answer every request on `socket` with 200.
fn serve_ping(socket: &Path) {
    let _ = std::fs::remove_file(socket);
    let listener = UnixListener::bind(socket).unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut buf = [0u8; 512];
            let _ = stream.read(&mut buf);
            let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        }
    });
}

impl VmProvider for FakeProvider {
    fn vm_type(&self) -> VmType {
        VmType::LibKrun
    }

    fn exists(&self, name: &str) -> ovm::Result<bool> {
        match MachineConfig::load_by_name(name, &self.dirs) {
            Ok(mc) => Ok(self.state(&mc)? != MachineState::Stopped),
            Err(Error::NoSuchVm(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn hypervisor_config(&self, name: &str, dirs: &MachineDirs) -> HypervisorConfig {
        let runtime = |suffix: &str| dirs.runtime_dir.append(format!("{}-{}", name, suffix));
        HypervisorConfig::LibKrun(HelperConfig {
            pid_file: runtime("helper.pid"),
            log_file: runtime("helper.log"),
            ready_socket: runtime("ready.sock"),
            network_socket: runtime("gvproxy.sock"),
            efi_variable_store: None,
        })
    }

    fn get_disk(
        &self,
        user_input: Option<&Path>,
        _dirs: &MachineDirs,
        mc: &MachineConfig,
    ) -> ovm::Result<()> {
        let src = user_input.ok_or_else(|| Error::storage("get disk", "no image"))?;
        std::fs::copy(src, mc.image_path.path())?;
        Ok(())
    }

    fn create_vm(&self, _opts: &InitOptions, _mc: &mut MachineConfig) -> ovm::Result<()> {
        Ok(())
    }

    fn start_vm(&self, mc: &MachineConfig, registry: &ProcessRegistry) -> ovm::Result<u32> {
        let child = Command::new("sleep")
            .arg("300")
            .stdin(Stdio::null())
            .spawn()?;
        let pid = child.id();
        process::write_pid_file(Self::pid_file(mc).path(), pid)?;
        registry.register(ProcessRole::Hypervisor, pid);
        serve_ping(mc.api_socket().path());
        Ok(pid)
    }

    fn stop_vm(&self, mc: &MachineConfig, _hard_stop: bool) -> ovm::Result<()> {
        let pid_file = Self::pid_file(mc);
        if let Some(pid) = process::read_pid_file(pid_file.path()) {
            pid_file.delete_if_exists()?;
            process::stop_process(pid, Duration::from_secs(2), true)?;
        }
        Ok(())
    }

    fn state(&self, mc: &MachineConfig) -> ovm::Result<MachineState> {
        Ok(match process::read_pid_file(Self::pid_file(mc).path()) {
            Some(pid) if process::is_alive(pid) => MachineState::Running,
            _ => MachineState::Stopped,
        })
    }

    fn start_networking(&self, _mc: &MachineConfig, _cmd: &mut GvproxyCommand) -> ovm::Result<()> {
        Ok(())
    }

    fn update_ssh_port(&self, _mc: &mut MachineConfig, _port: u16) -> ovm::Result<()> {
        Ok(())
    }

    fn set_provider_attributes(&self, mc: &mut MachineConfig, opts: &SetOptions) -> ovm::Result<()> {
        if let Some(cpus) = opts.cpus {
            mc.resources.cpus = cpus;
        }
        if let Some(memory) = opts.memory {
            mc.resources.memory = memory;
        }
        Ok(())
    }

    fn ready_socket(&self, _mc: &MachineConfig) -> Option<VmFile> {
        None
    }
}

fn setup(root: &Path) -> (Arc<Orchestrator>, Arc<ProcessRegistry>) {
    let script = root.join("fake-gvproxy");
    std::fs::write(&script, FAKE_GVPROXY).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let paths = OvmPaths::with_root(root.join("ovm"));
    let config = OvmConfig {
        gvproxy_binary: script,
        ready_timeout: Duration::from_secs(10),
        api_ping_timeout: Duration::from_secs(10),
        ..Default::default()
    };
    let registry = Arc::new(ProcessRegistry::new());
    let provider: SharedProvider = Arc::new(FakeProvider {
        dirs: paths.machine_dirs(VmType::LibKrun),
    });
    let orch = Orchestrator::new(provider, config, paths, registry.clone());
    (Arc::new(orch), registry)
}

fn init_options(root: &Path) -> InitOptions {
    let image = root.join("img.raw");
    std::fs::write(&image, b"rootfs").unwrap();
    let key = root.join("id_ed25519");
    std::fs::write(&key, b"not a real key").unwrap();
    InitOptions {
        name: "vm1".into(),
        ppid: Some(std::process::id()),
        boot_image: Some(image),
        boot_version: "1".into(),
        data_version: "1".into(),
        cpus: 2,
        memory: 1024,
        disk_size: 1,
        identity_path: Some(key),
        remote_username: "core".into(),
        ..Default::default()
    }
}

async fn wait_until_up(orch: &Orchestrator) -> MachineConfig {
    for _ in 0..200 {
        if let Ok(mc) = MachineConfig::load_by_name("vm1", orch.dirs()) {
            if mc.last_up.is_some() {
                return mc;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("machine never became ready");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_init_writes_expected_config() {
    let temp = tempfile::tempdir().unwrap();
    let (orch, _registry) = setup(temp.path());

    let mc = orch.init(init_options(temp.path())).await.unwrap();

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(mc.config_path.path()).unwrap()).unwrap();
    assert_eq!(raw["Name"], "vm1");
    assert_eq!(raw["Resources"]["CPUs"], 2);
    assert_eq!(raw["Resources"]["Memory"], 1024);
    assert_eq!(raw["SSH"]["Port"], 0);
    assert_eq!(raw["SSH"]["RemoteUsername"], "core");
    assert_eq!(raw["Image"]["BootVersion"], "1");
    assert_eq!(raw["Starting"], false);

    assert_eq!(std::fs::read(mc.image_path.path()).unwrap(), b"rootfs");
    assert!(matches!(
        orch.start("ghost", StartOptions::default()).await,
        Err(Error::NoSuchVm(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_until_network_proxy_dies() {
    let temp = tempfile::tempdir().unwrap();
    let (orch, registry) = setup(temp.path());
    orch.init(init_options(temp.path())).await.unwrap();

    let start = tokio::spawn({
        let orch = orch.clone();
        async move {
            orch.start(
                "vm1",
                StartOptions {
                    ppid: Some(std::process::id()),
                    ..Default::default()
                },
            )
            .await
        }
    });

    let mc = wait_until_up(&orch).await;
    assert_ne!(mc.ssh.port, 0);
    assert!(!mc.starting);
    assert_eq!(orch.provider().state(&mc).unwrap(), MachineState::Running);

    let connections = std::fs::read_to_string(orch.paths().connections_file()).unwrap();
    assert!(connections.contains(&format!("127.0.0.1:{}", mc.ssh.port)));

    let hypervisor = registry.pid(ProcessRole::Hypervisor).unwrap();
    let proxy = registry.pid(ProcessRole::NetworkProxy).unwrap();
    assert!(process::kill(proxy));

    let result = tokio::time::timeout(Duration::from_secs(60), start)
        .await
        .unwrap()
        .unwrap();
    match result {
        Err(Error::ProcessDied { role, pid }) => {
            assert_eq!(role, "network proxy");
            assert_eq!(pid, proxy);
        }
        other => panic!("expected ProcessDied, got {:?}", other),
    }

    assert!(!process::is_alive(hypervisor));
    let mc = MachineConfig::load_by_name("vm1", orch.dirs()).unwrap();
    assert!(!mc.starting);
    assert_eq!(orch.provider().state(&mc).unwrap(), MachineState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_from_outside_ends_start_cleanly() {
    let temp = tempfile::tempdir().unwrap();
    let (orch, registry) = setup(temp.path());
    orch.init(init_options(temp.path())).await.unwrap();

    let start = tokio::spawn({
        let orch = orch.clone();
        async move { orch.start("vm1", StartOptions::default()).await }
    });
    let mc = wait_until_up(&orch).await;
    let port = mc.ssh.port;

    assert!(matches!(
        orch.set("vm1", SetOptions::default()),
        Err(Error::WrongState { .. })
    ));

    // A second invocation, as `ovm machine stop` would run it.
    let (other, _) = setup(temp.path());
    other.stop("vm1", false).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(60), start)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok(), "{:?}", result);
    assert!(registry
        .pid(ProcessRole::NetworkProxy)
        .map_or(true, |pid| !process::is_alive(pid)));

    let mc = MachineConfig::load_by_name("vm1", orch.dirs()).unwrap();
    assert_eq!(mc.ssh.port, port);
    other.stop("vm1", false).unwrap();
}
