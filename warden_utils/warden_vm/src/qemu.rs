//! qemu driver: user-mode networking with a host-forwarded ssh port,
//! console on stdio captured by a background reader.

use crate::{
    kill_children, ssh, watch_exit, Instance, RunHandle, VmConfig, VmError,
};
use nix::unistd::setsid;
use serde::Deserialize;
use std::{
    collections::HashSet,
    os::unix::prelude::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Sender},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use warden_io::{thread::read_background, BackgroundIoHandle};

/// Address of the host as seen from inside the guest's user network.
const QEMU_HOST_IP: &str = "10.0.2.10";
/// Address the host uses to reach the guest's forwarded ssh port.
const QEMU_SSH_IP: &str = "127.0.0.1";

const BOOT_TOTAL_WAIT: Duration = Duration::from_secs(60 * 10);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QemuConfig {
    /// Path to the kernel image; booting the disk image's own kernel
    /// when absent.
    pub kernel_img: Option<String>,
    /// Path to the disk image to boot.
    pub disk_img: String,
    /// Path to the ssh secret key for the OS under test.
    pub ssh_key: String,
    /// Username inside the OS under test.
    pub ssh_user: String,
    pub qemu_smp: u32,
    /// Memory size in megabytes.
    pub qemu_mem: u32,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            kernel_img: Some("./bzImage".to_string()),
            disk_img: "./stretch.img".to_string(),
            ssh_key: "./stretch.id_rsa".to_string(),
            ssh_user: "root".to_string(),
            qemu_smp: 2,
            qemu_mem: 4096,
        }
    }
}

#[derive(Debug, Error)]
pub enum QemuConfigError {
    #[error("invalid image path: {0}")]
    InvalidPath(String),
    #[error("empty ssh username")]
    EmptySshUser,
    #[error("invalid memory size '{0}'M, should be in range [128-1048576]")]
    InvalidMemSize(u32),
    #[error("invalid smp '{0}', should be in range [1-1024]")]
    InvalidCpuNumber(u32),
}

impl QemuConfig {
    pub fn check(&self) -> Result<(), QemuConfigError> {
        if !PathBuf::from(&self.disk_img).is_file() {
            return Err(QemuConfigError::InvalidPath(self.disk_img.clone()));
        }
        if let Some(kernel_img) = self.kernel_img.as_ref() {
            if !PathBuf::from(kernel_img).is_file() {
                return Err(QemuConfigError::InvalidPath(kernel_img.clone()));
            }
        }
        if !PathBuf::from(&self.ssh_key).is_file() {
            return Err(QemuConfigError::InvalidPath(self.ssh_key.clone()));
        }
        if self.ssh_user.is_empty() {
            return Err(QemuConfigError::EmptySshUser);
        }
        if self.qemu_smp == 0 || self.qemu_smp > 1024 {
            return Err(QemuConfigError::InvalidCpuNumber(self.qemu_smp));
        }
        if self.qemu_mem <= 128 || self.qemu_mem > 1048576 {
            return Err(QemuConfigError::InvalidMemSize(self.qemu_mem));
        }
        Ok(())
    }
}

pub struct QemuInstance {
    name: String,
    cfg: QemuConfig,
    debug: bool,
    qemu: Option<Child>,
    console: Option<BackgroundIoHandle>,
    stderr: Option<BackgroundIoHandle>,
    ssh_port: Option<PortGuard>,
    /// Current subscriber to console output; the pump thread feeds the
    /// live run through this slot.
    console_slot: Arc<Mutex<Option<Sender<Vec<u8>>>>>,
    pump_alive: Arc<AtomicBool>,
    procs: Vec<Arc<Mutex<Child>>>,
}

impl QemuInstance {
    pub fn create(cfg: &VmConfig) -> Result<Self, VmError> {
        let mut inst = QemuInstance {
            name: cfg.name.clone(),
            cfg: cfg.qemu.clone(),
            debug: cfg.debug,
            qemu: None,
            console: None,
            stderr: None,
            ssh_port: None,
            console_slot: Arc::new(Mutex::new(None)),
            pump_alive: Arc::new(AtomicBool::new(false)),
            procs: Vec::new(),
        };
        let boot_duration = inst.boot()?;
        log::debug!(
            "{}: boot cost around {}s",
            inst.name,
            boot_duration.as_secs()
        );
        Ok(inst)
    }

    fn boot(&mut self) -> Result<Duration, VmError> {
        let ssh_port = alloc_free_port()
            .ok_or_else(|| VmError::Boot("no free port for ssh forwarding".to_string()))?;
        let mut qemu_cmd = build_qemu_command(&self.cfg, ssh_port.0);
        qemu_cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        unsafe {
            qemu_cmd.pre_exec(|| {
                let _ = setsid();
                Ok(())
            });
        }
        log::debug!("{}: qemu cmd: {:?}", self.name, qemu_cmd);

        let mut child = qemu_cmd.spawn()?;
        let console = read_background(child.stdout.take().unwrap(), self.debug);
        let stderr = read_background(child.stderr.take().unwrap(), false);
        self.qemu = Some(child);
        self.console = Some(console);
        self.stderr = Some(stderr);
        self.ssh_port = Some(ssh_port);

        let now = Instant::now();
        let mut wait_duration = Duration::from_millis(500);
        let min_wait_duration = Duration::from_millis(100);
        let delta = Duration::from_millis(100);
        let mut waited = Duration::from_millis(0);

        while waited < BOOT_TOTAL_WAIT {
            thread::sleep(wait_duration);
            if self.is_alive() {
                self.console.as_ref().unwrap().clear_current();
                self.start_console_pump();
                return Ok(now.elapsed());
            }
            // qemu may have already exited
            if let Some(status) = self.qemu.as_mut().unwrap().try_wait()? {
                let stderr = self.stderr.take().unwrap().wait_finish();
                let stderr = String::from_utf8_lossy(&stderr);
                self.kill_qemu();
                return Err(VmError::Boot(format!(
                    "qemu exited with {}: {}",
                    status,
                    stderr.trim()
                )));
            }
            waited += wait_duration;
            if wait_duration > min_wait_duration {
                wait_duration -= delta;
            }
        }

        self.kill_qemu();
        Err(VmError::Boot(format!(
            "failed to boot in {}s",
            waited.as_secs()
        )))
    }

    fn is_alive(&self) -> bool {
        let port = match self.ssh_port.as_ref() {
            Some(port) => port.0,
            None => return false,
        };
        let mut pwd = ssh::ssh_basic_cmd(QEMU_SSH_IP, port, &self.cfg.ssh_key, &self.cfg.ssh_user);
        pwd.arg("pwd")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        matches!(pwd.status(), Ok(status) if status.success())
    }

    /// Feed console output to whichever run currently subscribes. One
    /// pump per instance; started once the VM answers ssh.
    fn start_console_pump(&mut self) {
        let console = self.console.as_ref().unwrap().clone();
        let slot = Arc::clone(&self.console_slot);
        let alive = Arc::clone(&self.pump_alive);
        alive.store(true, Ordering::Relaxed);
        let alive1 = Arc::clone(&alive);
        thread::spawn(move || {
            while alive1.load(Ordering::Relaxed) {
                let data = console.current_data();
                if !data.is_empty() {
                    let mut slot = slot.lock().unwrap();
                    if let Some(tx) = slot.as_ref() {
                        if tx.send(data).is_err() {
                            *slot = None;
                        }
                    }
                }
                thread::sleep(Duration::from_millis(100));
            }
        });
    }

    /// Point the console at `tx` unless the previous subscriber is still
    /// alive (a probe send tells them apart).
    fn claim_console(&self, tx: Sender<Vec<u8>>) {
        let mut slot = self.console_slot.lock().unwrap();
        match slot.as_ref() {
            Some(old) if old.send(Vec::new()).is_ok() => {}
            _ => *slot = Some(tx),
        }
    }

    fn kill_qemu(&mut self) {
        self.pump_alive.store(false, Ordering::Relaxed);
        kill_children(&mut self.procs);
        if let Some(qemu) = self.qemu.as_mut() {
            let _ = qemu.kill();
            let _ = qemu.wait();
        }
        self.qemu = None;
        self.console = None;
        self.stderr = None;
        self.ssh_port = None;
    }

    fn ssh_port(&self) -> Result<u16, VmError> {
        self.ssh_port
            .as_ref()
            .map(|port| port.0)
            .ok_or_else(|| VmError::Boot("instance is down".to_string()))
    }
}

impl Instance for QemuInstance {
    fn forward(&mut self, port: u16) -> Result<String, VmError> {
        self.ssh_port()
            .map_err(|_| VmError::Forward("instance is down".to_string()))?;
        // user networking forwards any guest-to-host connection
        Ok(format!("{}:{}", QEMU_HOST_IP, port))
    }

    fn copy(&mut self, src: &Path) -> Result<PathBuf, VmError> {
        let port = self.ssh_port()?;
        let name = src
            .file_name()
            .ok_or_else(|| VmError::Copy(format!("bad path: {}", src.display())))?;
        let to = PathBuf::from("~").join(name);
        ssh::scp(
            QEMU_SSH_IP,
            port,
            &self.cfg.ssh_key,
            &self.cfg.ssh_user,
            src,
            &to,
        )?;
        Ok(to)
    }

    fn run(&mut self, timeout: Duration, cmd: &str) -> Result<RunHandle, VmError> {
        let port = self.ssh_port()?;
        let mut ssh_cmd =
            ssh::ssh_basic_cmd(QEMU_SSH_IP, port, &self.cfg.ssh_key, &self.cfg.ssh_user);
        ssh_cmd
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = ssh_cmd.spawn()?;

        let (out_tx, out_rx) = channel();
        warden_io::thread::stream_to(child.stdout.take().unwrap(), out_tx.clone());
        warden_io::thread::stream_to(child.stderr.take().unwrap(), out_tx.clone());
        self.claim_console(out_tx);

        let child = Arc::new(Mutex::new(child));
        self.procs.push(Arc::clone(&child));
        let (exit_tx, exit_rx) = channel();
        watch_exit(child, timeout, exit_tx);

        Ok(RunHandle {
            output: out_rx,
            exit: exit_rx,
        })
    }
}

impl Drop for QemuInstance {
    fn drop(&mut self) {
        self.kill_qemu();
    }
}

fn build_qemu_command(cfg: &QemuConfig, ssh_port: u16) -> Command {
    let mut cmd = Command::new("qemu-system-x86_64");
    cmd.args([
        "-display",
        "none",
        "-serial",
        "stdio",
        "-no-reboot",
        "-snapshot",
        "-enable-kvm",
        "-cpu",
        "host,migratable=off",
        "-device",
        "virtio-rng-pci",
    ]);
    cmd.arg("-m").arg(cfg.qemu_mem.to_string());
    cmd.arg("-smp").arg(cfg.qemu_smp.to_string());
    cmd.args(["-device", "e1000,netdev=net0"]);
    cmd.arg("-netdev").arg(format!(
        "user,id=net0,host={},hostfwd=tcp::{}-:22",
        QEMU_HOST_IP, ssh_port
    ));
    cmd.arg("-drive")
        .arg(format!("file={},index=0,media=disk", cfg.disk_img));
    if let Some(kernel_img) = cfg.kernel_img.as_ref() {
        cmd.arg("-kernel").arg(kernel_img);
        cmd.arg("-append").arg(QEMU_LINUX_APPEND.join(" "));
    }
    cmd
}

static QEMU_LINUX_APPEND: [&str; 11] = [
    "earlyprintk=serial",
    "oops=panic",
    "nmi_watchdog=panic",
    "panic_on_warn=1",
    "panic=1",
    "ftrace_dump_on_oops=orig_cpu",
    "vsyscall=native",
    "net.ifnames=0",
    "biosdevname=0",
    "root=/dev/sda",
    "console=ttyS0",
];

fn ports() -> &'static Mutex<HashSet<u16>> {
    static PORTS: OnceLock<Mutex<HashSet<u16>>> = OnceLock::new();
    PORTS.get_or_init(|| Mutex::new(HashSet::new()))
}

fn alloc_free_port() -> Option<PortGuard> {
    use std::net::{Ipv4Addr, TcpListener};
    let mut taken = ports().lock().unwrap();
    for port in 1025..65535 {
        if TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok() && taken.insert(port) {
            return Some(PortGuard(port));
        }
    }
    None
}

struct PortGuard(u16);

impl Drop for PortGuard {
    fn drop(&mut self) {
        let mut taken = ports().lock().unwrap();
        taken.remove(&self.0);
    }
}
