//! Local driver: commands run directly on the host. Meant for debugging
//! the manager itself; the silent-VM watchdogs do not apply here.

use crate::{kill_children, watch_exit, Instance, RunHandle, VmConfig, VmError};
use nix::unistd::setsid;
use std::{
    os::unix::prelude::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{mpsc::channel, Arc, Mutex},
    time::Duration,
};

pub struct LocalInstance {
    name: String,
    procs: Vec<Arc<Mutex<Child>>>,
}

impl LocalInstance {
    pub fn new(cfg: &VmConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            procs: Vec::new(),
        }
    }
}

impl Instance for LocalInstance {
    fn forward(&mut self, port: u16) -> Result<String, VmError> {
        Ok(format!("127.0.0.1:{}", port))
    }

    fn copy(&mut self, src: &Path) -> Result<PathBuf, VmError> {
        // everything already shares the host filesystem
        Ok(src.to_path_buf())
    }

    fn run(&mut self, timeout: Duration, cmd: &str) -> Result<RunHandle, VmError> {
        log::debug!("{}: run: {}", self.name, cmd);
        let mut shell = Command::new("sh");
        shell
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        unsafe {
            shell.pre_exec(|| {
                let _ = setsid();
                Ok(())
            });
        }
        let mut child = shell.spawn()?;

        let (out_tx, out_rx) = channel();
        warden_io::thread::stream_to(child.stdout.take().unwrap(), out_tx.clone());
        warden_io::thread::stream_to(child.stderr.take().unwrap(), out_tx);

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

impl Drop for LocalInstance {
    fn drop(&mut self) {
        kill_children(&mut self.procs);
    }
}
