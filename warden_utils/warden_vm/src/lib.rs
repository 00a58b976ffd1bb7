//! Boot up and manage virtual machine instances.
//!
//! The manager is polymorphic over the small verb set every driver
//! provides: forward a host port into the VM, copy a file in, run a
//! command with a timeout, and release everything on drop.

use std::{
    path::{Path, PathBuf},
    process::Child,
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

pub mod crash;
pub mod local;
pub mod qemu;
pub mod ssh;

use qemu::QemuConfig;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("unsupported vm type: {0}")]
    UnsupportedType(String),
    #[error("boot: {0}")]
    Boot(String),
    #[error("port forward: {0}")]
    Forward(String),
    #[error("copy: {0}")]
    Copy(String),
    #[error("spawn: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Terminal state of one `run` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    /// The driver-enforced timeout elapsed. Not a failure: the caller
    /// rotates the instance.
    Timeout,
    /// The command finished on its own with the given exit code.
    Exited(Option<i32>),
    /// The driver lost track of the command.
    Failed(String),
}

/// Streams of one running command: raw output chunks and, exactly once,
/// the terminal state.
pub struct RunHandle {
    pub output: Receiver<Vec<u8>>,
    pub exit: Receiver<RunExit>,
}

#[derive(Debug)]
pub enum RunEvent {
    Output(Vec<u8>),
    Exit(RunExit),
}

impl RunHandle {
    /// Merge both streams into a single event channel for select-free
    /// monitoring. No ordering is guaranteed between the `Exit` event
    /// and output produced just before it.
    pub fn events(self) -> Receiver<RunEvent> {
        let (tx, rx) = channel();
        let RunHandle { output, exit } = self;
        let out_tx = tx.clone();
        thread::spawn(move || {
            while let Ok(chunk) = output.recv() {
                if out_tx.send(RunEvent::Output(chunk)).is_err() {
                    return;
                }
            }
        });
        thread::spawn(move || {
            if let Ok(status) = exit.recv() {
                let _ = tx.send(RunEvent::Exit(status));
            }
        });
        rx
    }
}

/// One live VM. Dropping the instance tears it down along with every
/// process it spawned.
pub trait Instance: Send {
    /// Address, as seen from inside the VM, that reaches `port` on the
    /// host.
    fn forward(&mut self, port: u16) -> Result<String, VmError>;

    /// Copy a host file into the VM; returns the in-VM path.
    fn copy(&mut self, src: &Path) -> Result<PathBuf, VmError>;

    /// Start `cmd` inside the VM. The command is killed after `timeout`
    /// and reported as `RunExit::Timeout`.
    fn run(&mut self, timeout: Duration, cmd: &str) -> Result<RunHandle, VmError>;
}

#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Instance name, used in logs and crash dossiers.
    pub name: String,
    /// Dump all console output to stdout.
    pub debug: bool,
    pub qemu: QemuConfig,
}

/// Driver factory, keyed by the configured type tag.
pub fn create(kind: &str, cfg: &VmConfig) -> Result<Box<dyn Instance>, VmError> {
    match kind {
        "qemu" => Ok(Box::new(qemu::QemuInstance::create(cfg)?)),
        "local" => Ok(Box::new(local::LocalInstance::new(cfg))),
        other => Err(VmError::UnsupportedType(other.to_string())),
    }
}

/// Watch `child` until it exits or `timeout` elapses, delivering the
/// terminal state on `tx`. On timeout the child is killed first.
pub(crate) fn watch_exit(child: Arc<Mutex<Child>>, timeout: Duration, tx: Sender<RunExit>) {
    thread::spawn(move || {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut child = child.lock().unwrap();
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let _ = tx.send(RunExit::Exited(status.code()));
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        let _ = tx.send(RunExit::Failed(err.to_string()));
                        return;
                    }
                }
            }
            if Instant::now() >= deadline {
                let mut child = child.lock().unwrap();
                let _ = child.kill();
                let _ = child.wait();
                let _ = tx.send(RunExit::Timeout);
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
    });
}

pub(crate) fn kill_children(children: &mut Vec<Arc<Mutex<Child>>>) {
    for child in children.drain(..) {
        let mut child = child.lock().unwrap();
        let _ = child.kill();
        let _ = child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_rejects_unknown_type() {
        let cfg = VmConfig {
            name: "vm-0".to_string(),
            debug: false,
            qemu: QemuConfig::default(),
        };
        assert!(matches!(
            create("adb", &cfg),
            Err(VmError::UnsupportedType(_))
        ));
    }

    #[test]
    fn run_timeout_is_a_sentinel() {
        let cfg = VmConfig {
            name: "vm-0".to_string(),
            debug: false,
            qemu: QemuConfig::default(),
        };
        let mut inst = local::LocalInstance::new(&cfg);
        let handle = inst.run(Duration::from_millis(200), "sleep 10").unwrap();
        assert_eq!(handle.exit.recv().unwrap(), RunExit::Timeout);
    }

    #[test]
    fn run_reports_exit_and_output() {
        let cfg = VmConfig {
            name: "vm-0".to_string(),
            debug: false,
            qemu: QemuConfig::default(),
        };
        let mut inst = local::LocalInstance::new(&cfg);
        let handle = inst
            .run(Duration::from_secs(10), "echo executing && exit 3")
            .unwrap();
        let mut output = Vec::new();
        let mut exit = None;
        // the channel closes once both streams are done
        for event in handle.events() {
            match event {
                RunEvent::Output(chunk) => output.extend(chunk),
                RunEvent::Exit(status) => exit = Some(status),
            }
        }
        assert_eq!(exit, Some(RunExit::Exited(Some(3))));
        assert_eq!(output, b"executing\n");
    }
}
