//! ssh/scp command builders for talking to the OS under test.

use crate::VmError;
use std::{
    path::Path,
    process::{Command, Stdio},
};

/// Non-interactive ssh with host-key checking disabled; the target VM is
/// throwaway and its keys change on every boot.
pub fn ssh_basic_cmd(addr: &str, port: u16, key: &str, user: &str) -> Command {
    let mut ssh = Command::new("ssh");
    ssh.args(["-F", "/dev/null"])
        .args(["-o", "UserKnownHostsFile=/dev/null"])
        .args(["-o", "BatchMode=yes"])
        .args(["-o", "IdentitiesOnly=yes"])
        .args(["-o", "StrictHostKeyChecking=no"])
        .args(["-o", "ConnectTimeout=10"])
        .arg("-p")
        .arg(port.to_string())
        .args(["-i", key])
        .arg(format!("{}@{}", user, addr));
    ssh
}

/// Copy `from` on the host to `to` inside the VM.
pub fn scp(
    addr: &str,
    port: u16,
    key: &str,
    user: &str,
    from: &Path,
    to: &Path,
) -> Result<(), VmError> {
    let mut scp = Command::new("scp");
    scp.args(["-F", "/dev/null"])
        .args(["-o", "UserKnownHostsFile=/dev/null"])
        .args(["-o", "BatchMode=yes"])
        .args(["-o", "IdentitiesOnly=yes"])
        .args(["-o", "StrictHostKeyChecking=no"])
        .arg("-P")
        .arg(port.to_string())
        .args(["-i", key])
        .arg(from)
        .arg(format!("{}@{}:{}", user, addr, to.display()))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let output = scp.output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(VmError::Copy(format!(
            "scp {} failed: {}",
            from.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}
