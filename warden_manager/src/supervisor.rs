//! Per-slot VM supervision: boot an instance, run the fuzzer inside it,
//! watch the console for crashes and stalls, write crash dossiers,
//! restart.

use crate::{config::Config, engine::Manager, util::stop_soon};
use std::{
    fs::OpenOptions,
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::PathBuf,
    sync::{
        mpsc::{Receiver, RecvTimeoutError},
        Arc,
    },
    thread::sleep,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use warden_vm::{
    crash::{find_crash, Suppressions},
    Instance, RunEvent, RunExit, VmConfig,
};

/// The fuzzer is rotated after this long; a timeout is a healthy exit.
const FUZZER_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const AUX_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
/// A non-local VM producing no console output at all for this long is
/// declared dead.
const NO_OUTPUT_TIMEOUT: Duration = Duration::from_secs(60);
/// A non-local VM chattering on the console without executing programs
/// for this long is declared stuck.
const NO_PROGRESS_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// After a crash signature appears, keep reading this long so the full
/// report makes it into the dossier.
const POST_CRASH_DRAIN: Duration = Duration::from_secs(10);
const RESTART_BACKOFF: Duration = Duration::from_secs(10);

const EXECUTING_MARKER: &[u8] = b"executing program";

pub struct Supervisor {
    pub config: Arc<Config>,
    pub manager: Arc<Manager>,
    pub slot: usize,
    pub rpc_port: u16,
    pub crash_dir: PathBuf,
    pub suppressions: Arc<Suppressions>,
}

impl Supervisor {
    /// Own one VM slot forever: create, run, observe, tear down, back
    /// off on failure, until shutdown.
    pub fn run(self) {
        let first = self.slot == 0;
        let name = format!("vm-{}", self.slot);
        while !stop_soon() {
            let ok = self.run_instance(&name, first);
            if stop_soon() {
                break;
            }
            if !ok {
                sleep(RESTART_BACKOFF);
            }
        }
        log::debug!("{}: supervisor done", name);
    }

    fn run_instance(&self, name: &str, first: bool) -> bool {
        let vm_cfg = VmConfig {
            name: name.to_string(),
            debug: self.config.debug,
            qemu: self.config.qemu.clone(),
        };
        let mut inst = match warden_vm::create(&self.config.vm_type, &vm_cfg) {
            Ok(inst) => inst,
            Err(err) => {
                log::error!("{}: failed to create instance: {}", name, err);
                return false;
            }
        };

        let fwd_addr = match inst.forward(self.rpc_port) {
            Ok(addr) => addr,
            Err(err) => {
                log::error!("{}: failed to setup port forwarding: {}", name, err);
                return false;
            }
        };
        let fuzzer_bin = match inst.copy(&self.config.bin_dir.join("warden-fuzzer")) {
            Ok(path) => path,
            Err(err) => {
                log::error!("{}: failed to copy binary: {}", name, err);
                return false;
            }
        };
        let executor_bin = match inst.copy(&self.config.bin_dir.join("warden-executor")) {
            Ok(path) => path,
            Err(err) => {
                log::error!("{}: failed to copy binary: {}", name, err);
                return false;
            }
        };

        // best effort: exception traces are console noise
        run_command(inst.as_mut(), "echo -n 0 > /proc/sys/debug/exception-trace");

        // leak detection significantly slows fuzzing down, so only the
        // first slot pays for it
        let leak = first && self.config.leak;
        let cmd = format!(
            "{} -executor={} -name={} -manager={} -output={} -procs={} -leak={} -cover={} -sandbox={} -debug={}",
            fuzzer_bin.display(),
            executor_bin.display(),
            name,
            fwd_addr,
            self.config.output,
            self.config.procs,
            leak,
            self.config.cover,
            self.config.sandbox,
            self.config.debug,
        );
        let handle = match inst.run(FUZZER_TIMEOUT, &cmd) {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("{}: failed to run fuzzer: {}", name, err);
                return false;
            }
        };

        self.monitor(name, inst.as_mut(), handle.events())
    }

    fn monitor(&self, name: &str, inst: &mut dyn Instance, events: Receiver<RunEvent>) -> bool {
        let start_time = Instant::now();
        let mut buf = ConsoleBuffer::new();
        let mut crashes: Vec<String> = Vec::new();
        let mut last_execute = Instant::now();
        let mut last_event = Instant::now();
        let mut pending_exit: Option<RunExit> = None;
        let non_local = self.config.vm_type != "local";

        loop {
            if stop_soon() {
                return true;
            }
            let event = match pending_exit.take() {
                Some(exit) => Ok(RunEvent::Exit(exit)),
                None => events.recv_timeout(Duration::from_secs(1)),
            };
            match event {
                Ok(RunEvent::Exit(RunExit::Timeout)) => {
                    log::info!("{}: running long enough, restarting", name);
                    return true;
                }
                Ok(RunEvent::Exit(exit)) => {
                    log::info!("{}: lost connection: {:?}", name, exit);
                    self.save_crasher(name, "lost connection", buf.data(), start_time, &mut crashes);
                    return true;
                }
                Ok(RunEvent::Output(chunk)) => {
                    last_event = Instant::now();
                    buf.append(&chunk);
                    if contains(buf.unscanned(), EXECUTING_MARKER) {
                        last_execute = Instant::now();
                    }
                    if let Some(hit) = find_crash(buf.unscanned()) {
                        // let the kernel finish writing the report, then
                        // locate it again in the grown buffer
                        pending_exit = drain_output(&events, &mut buf, POST_CRASH_DRAIN);
                        let hit = find_crash(buf.unscanned()).unwrap_or(hit);
                        let window = buf.crash_window(hit.start, hit.end);
                        self.save_crasher(name, &hit.desc, window, start_time, &mut crashes);
                    }
                    buf.advance_scan();
                    if non_local && last_execute.elapsed() > NO_PROGRESS_TIMEOUT {
                        // the kernel keeps printing but nothing executes
                        dump_vm_state(inst, &events, &mut buf);
                        self.save_crasher(
                            name,
                            "not executing programs",
                            buf.data(),
                            start_time,
                            &mut crashes,
                        );
                        return true;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if last_event.elapsed() < NO_OUTPUT_TIMEOUT {
                        continue;
                    }
                    last_event = Instant::now();
                    if non_local {
                        dump_vm_state(inst, &events, &mut buf);
                        self.save_crasher(name, "no output", buf.data(), start_time, &mut crashes);
                        return true;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    log::info!("{}: lost connection", name);
                    self.save_crasher(name, "lost connection", buf.data(), start_time, &mut crashes);
                    return true;
                }
            }
        }
    }

    /// Write one crash dossier: the captured output window plus a footer
    /// with the elapsed time and this iteration's crash history.
    fn save_crasher(
        &self,
        name: &str,
        what: &str,
        output: &[u8],
        start_time: Instant,
        crashes: &mut Vec<String>,
    ) {
        if stop_soon() {
            // shutdown kills the VMs; the resulting "lost connection"
            // is not a bug
            return;
        }
        if let Some(re) = self.suppressions.matches(output) {
            log::debug!("{}: suppressing '{}' with '{}'", name, what, re);
            self.manager.bump("suppressed");
            return;
        }

        let mut footer = String::from("\n\n");
        if !crashes.is_empty() {
            footer.push_str("previous crashes:\n");
            for crash in crashes.iter() {
                footer.push_str(&format!("\t{}\n", crash));
            }
        }
        crashes.push(what.to_string());
        footer.push_str(&format!(
            "after running for {:?}:\n{}\n",
            start_time.elapsed(),
            what
        ));

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let filename = format!("crash-{}-{}", name, nanos);
        log::info!("{}: saving crash '{}' to {}", name, what, filename);
        if let Err(err) = write_dossier(&self.crash_dir.join(&filename), output, footer.as_bytes())
        {
            log::error!("{}: failed to write crash dossier: {}", name, err);
        }
        self.manager.bump("crashes");
    }
}

/// Run an aux command with best effort, waiting for it to finish.
fn run_command(inst: &mut dyn Instance, cmd: &str) {
    if let Ok(handle) = inst.run(AUX_COMMAND_TIMEOUT, cmd) {
        let _ = handle.exit.recv();
    }
}

/// sysrq triggers: held locks, per-cpu backtraces, task list. The
/// output lands on the console and is drained into the buffer.
fn dump_vm_state(inst: &mut dyn Instance, events: &Receiver<RunEvent>, buf: &mut ConsoleBuffer) {
    run_command(inst, "echo -n d > /proc/sysrq-trigger");
    run_command(inst, "echo -n l > /proc/sysrq-trigger");
    run_command(inst, "echo -n t > /proc/sysrq-trigger");
    let _ = drain_output(events, buf, Duration::from_secs(1));
}

/// Collect output for up to `dur`. An exit arriving meanwhile is handed
/// back to the caller for the next loop turn.
fn drain_output(
    events: &Receiver<RunEvent>,
    buf: &mut ConsoleBuffer,
    dur: Duration,
) -> Option<RunExit> {
    let deadline = Instant::now() + dur;
    let mut exit = None;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match events.recv_timeout(deadline - now) {
            Ok(RunEvent::Output(chunk)) => buf.append(&chunk),
            Ok(RunEvent::Exit(e)) => exit = Some(e),
            Err(_) => break,
        }
    }
    exit
}

fn write_dossier(path: &std::path::Path, output: &[u8], footer: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o660)
        .open(path)?;
    file.write_all(output)?;
    file.write_all(footer)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Captured console output window: at most 256 KiB of context before a
/// crash and 128 KiB after it.
const BEFORE_CONTEXT: usize = 256 << 10;
const AFTER_CONTEXT: usize = 128 << 10;
/// Successive scans overlap this much so a signature straddling a chunk
/// boundary is still seen whole.
const SCAN_OVERLAP: usize = 128;

struct ConsoleBuffer {
    data: Vec<u8>,
    /// How far crash scanning has advanced; `data[match_pos..]` is the
    /// window the next scan looks at.
    match_pos: usize,
}

impl ConsoleBuffer {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            match_pos: 0,
        }
    }

    fn append(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn unscanned(&self) -> &[u8] {
        &self.data[self.match_pos..]
    }

    /// Done scanning the current tail: slide the buffer down once it
    /// outgrows twice the pre-crash context, and move the scan cursor
    /// up, keeping the overlap. Runs after every output event whether or
    /// not anything matched; re-scanning a classified report is the
    /// price of never splitting one.
    fn advance_scan(&mut self) {
        if self.data.len() > 2 * BEFORE_CONTEXT {
            let cut = self.data.len() - BEFORE_CONTEXT;
            self.data.drain(..cut);
        }
        self.match_pos = self.data.len().saturating_sub(SCAN_OVERLAP);
    }

    /// Context window around a crash span (relative to the unscanned
    /// tail): up to BEFORE_CONTEXT before it, AFTER_CONTEXT after it.
    fn crash_window(&self, start: usize, end: usize) -> &[u8] {
        let start = (self.match_pos + start).saturating_sub(BEFORE_CONTEXT);
        let end = usize::min(self.match_pos + end + AFTER_CONTEXT, self.data.len());
        &self.data[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::{persist::PersistentSet, prog::Prog, syscall::SyscallTable};

    #[test]
    fn overlap_catches_signature_split_across_chunks() {
        let signature = b"BUG: kernel NULL pointer dereference at 0x0\n";
        // split inside the marker itself so the first half cannot match
        let (head, tail) = signature.split_at(2);

        let mut buf = ConsoleBuffer::new();
        let mut chunk = vec![b'.'; 4096];
        chunk.extend_from_slice(head);
        buf.append(&chunk);
        assert!(find_crash(buf.unscanned()).is_none());
        buf.advance_scan();

        buf.append(tail);
        let hit = find_crash(buf.unscanned()).unwrap();
        assert_eq!(hit.desc, "BUG: kernel NULL pointer dereference at 0x0");
    }

    #[test]
    fn buffer_slides_down_past_twice_before_context() {
        let mut buf = ConsoleBuffer::new();
        let mut chunk = vec![b'x'; 2 * BEFORE_CONTEXT];
        chunk.extend_from_slice(b"recent tail");
        buf.append(&chunk);
        buf.advance_scan();
        assert_eq!(buf.data().len(), BEFORE_CONTEXT);
        assert!(buf.data().ends_with(b"recent tail"));
        assert_eq!(buf.match_pos, buf.data().len() - SCAN_OVERLAP);

        // below the threshold nothing moves
        let before = buf.data().len();
        buf.append(b"more");
        buf.advance_scan();
        assert_eq!(buf.data().len(), before + 4);
    }

    #[test]
    fn crash_window_is_clamped() {
        let mut buf = ConsoleBuffer::new();
        buf.append(b"prefix noise\n");
        buf.advance_scan();
        buf.append(b"BUG: something\nmore trace\n");
        let hit = find_crash(buf.unscanned()).unwrap();
        let window = buf.crash_window(hit.start, hit.end);
        // small buffer: the window is everything
        assert_eq!(window, buf.data());
    }

    fn test_supervisor(dir: &std::path::Path, suppressions: &[String]) -> Supervisor {
        let table = std::sync::Arc::new(SyscallTable::builtin());
        let store = PersistentSet::open(&dir.join("corpus"), |data| {
            Prog::deserialize(&table, data).is_ok()
        })
        .unwrap();
        let enabled = table.resolve_enabled(&[]).unwrap();
        let engine = crate::engine::CorpusEngine::new(table, enabled, true, store);
        let config: Config = serde_json::from_str(
            &format!(
                r#"{{"workdir": "{}", "type": "local", "count": 1, "bin_dir": "/opt/warden/bin"}}"#,
                dir.display()
            ),
        )
        .unwrap();
        let crash_dir = dir.join("crashes");
        std::fs::create_dir_all(&crash_dir).unwrap();
        Supervisor {
            config: Arc::new(config),
            manager: Arc::new(Manager::new(engine)),
            slot: 0,
            rpc_port: 0,
            crash_dir,
            suppressions: Arc::new(Suppressions::new(suppressions).unwrap()),
        }
    }

    #[test]
    fn dossier_carries_output_and_footer() {
        let dir = tempfile::tempdir().unwrap();
        let sup = test_supervisor(dir.path(), &[]);
        let mut crashes = vec!["earlier crash".to_string()];
        sup.save_crasher(
            "vm-0",
            "BUG: something broke",
            b"console output here\n",
            Instant::now(),
            &mut crashes,
        );
        assert_eq!(sup.manager.stat("crashes"), 1);
        assert_eq!(crashes.len(), 2);

        let entries: Vec<_> = std::fs::read_dir(&sup.crash_dir)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().into_string().unwrap();
        assert!(name.starts_with("crash-vm-0-"));
        let content = std::fs::read_to_string(entries[0].path()).unwrap();
        assert!(content.starts_with("console output here\n"));
        assert!(content.contains("previous crashes:\n\tearlier crash\n"));
        assert!(content.contains("BUG: something broke\n"));
    }

    #[test]
    fn suppressed_crash_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sup = test_supervisor(dir.path(), &["qemu: terminating on signal".to_string()]);
        let mut crashes = Vec::new();
        sup.save_crasher(
            "vm-0",
            "lost connection",
            b"qemu: terminating on signal 2\n",
            Instant::now(),
            &mut crashes,
        );
        assert_eq!(sup.manager.stat("crashes"), 0);
        assert_eq!(sup.manager.stat("suppressed"), 1);
        assert!(crashes.is_empty());
        assert_eq!(std::fs::read_dir(&sup.crash_dir).unwrap().count(), 0);
    }
}
