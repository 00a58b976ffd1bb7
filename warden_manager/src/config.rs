use anyhow::Context;
use serde::Deserialize;
use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};
use warden_vm::{crash::Suppressions, qemu::QemuConfig};

/// Manager options, decoded from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Working directory; `corpus/` and `crashes/` live under it.
    pub workdir: PathBuf,
    /// RPC listen address the in-VM fuzzers are pointed at.
    #[serde(default = "default_rpc")]
    pub rpc: String,
    /// VM driver tag: "qemu" or "local".
    #[serde(rename = "type")]
    pub vm_type: String,
    /// Number of VM slots.
    pub count: usize,
    /// Parallel procs inside each fuzzer.
    #[serde(default = "default_procs")]
    pub procs: usize,
    /// Leak detection; only the first slot pays for it.
    #[serde(default)]
    pub leak: bool,
    /// Coverage-guided mode; without it the corpus is never minimized.
    #[serde(default = "default_true")]
    pub cover: bool,
    #[serde(default = "default_sandbox")]
    pub sandbox: String,
    /// Dump all VM output and run a single instance.
    #[serde(default)]
    pub debug: bool,
    /// Directory holding the warden-fuzzer and warden-executor binaries.
    pub bin_dir: PathBuf,
    /// Where the fuzzer reads crash output from: stdout or dmesg.
    #[serde(default = "default_output")]
    pub output: String,
    /// Syscalls the fuzzers may use; empty enables everything.
    #[serde(default)]
    pub enabled_syscalls: Vec<String>,
    /// Crash output matching any of these regexes is a known false
    /// positive.
    #[serde(default)]
    pub suppressions: Vec<String>,
    #[serde(default)]
    pub qemu: QemuConfig,
}

fn default_rpc() -> String {
    "127.0.0.1:0".to_string()
}

fn default_procs() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_sandbox() -> String {
    "none".to_string()
}

fn default_output() -> String {
    "stdout".to_string()
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let content = read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("malformed config {}", path.display()))?;
        Ok(config)
    }

    pub fn check(&mut self) -> anyhow::Result<()> {
        if self.count == 0 || self.count > 1000 {
            anyhow::bail!("bad count: {}", self.count);
        }
        match self.vm_type.as_str() {
            "qemu" | "local" => {}
            other => anyhow::bail!("unsupported vm type: {}", other),
        }
        for bin in ["warden-fuzzer", "warden-executor"] {
            let path = self.bin_dir.join(bin);
            if !path.is_file() {
                anyhow::bail!("{} not exists", path.display());
            }
        }
        match self.output.as_str() {
            "stdout" | "dmesg" | "file" => {}
            other => anyhow::bail!("unsupported output mode: {}", other),
        }
        if self.procs == 0 || self.procs > 32 {
            anyhow::bail!("bad procs: {}", self.procs);
        }
        Suppressions::new(&self.suppressions).context("bad suppression regex")?;
        if self.vm_type == "qemu" {
            self.qemu.check().context("qemu config error")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "workdir": "/tmp/warden",
                "type": "qemu",
                "count": 4,
                "bin_dir": "/opt/warden/bin"
            }"#,
        )
        .unwrap();
        assert_eq!(config.vm_type, "qemu");
        assert_eq!(config.count, 4);
        assert_eq!(config.procs, 1);
        assert!(config.cover);
        assert!(!config.leak);
        assert_eq!(config.rpc, "127.0.0.1:0");
        assert_eq!(config.output, "stdout");
        assert!(config.enabled_syscalls.is_empty());
    }

    #[test]
    fn check_rejects_bad_values() {
        let mut config: Config = serde_json::from_str(
            r#"{
                "workdir": "/tmp/warden",
                "type": "adb",
                "count": 0,
                "bin_dir": "/nonexistent"
            }"#,
        )
        .unwrap();
        assert!(config.check().is_err());
        config.count = 1;
        // still fails: unsupported type
        assert!(config.check().is_err());
    }
}
