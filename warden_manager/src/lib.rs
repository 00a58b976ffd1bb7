//! Warden: the long-lived coordinator of a syscall fuzzing fleet. It
//! supervises a pool of VM instances running fuzzer workers, serves the
//! RPC endpoint they exchange corpus and statistics over, and curates
//! the persistent coverage-minimized corpus.

pub mod config;
pub mod engine;
pub mod supervisor;
pub mod util;

use crate::{
    config::Config,
    engine::{CorpusEngine, Manager},
    supervisor::Supervisor,
    util::{stop_req, stop_soon},
};
use anyhow::Context;
use std::{
    net::TcpListener,
    os::unix::fs::DirBuilderExt,
    sync::Arc,
    thread,
    time::Duration,
};
use warden_core::{persist::PersistentSet, prog::Prog, syscall::SyscallTable};
use warden_vm::crash::Suppressions;

const STATS_PERIOD: Duration = Duration::from_secs(10);

pub fn boot(mut config: Config) -> anyhow::Result<()> {
    config.check().context("config error")?;
    let config = Arc::new(config);

    let crash_dir = config.workdir.join("crashes");
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&crash_dir)
        .with_context(|| format!("failed to create {}", crash_dir.display()))?;

    let table = Arc::new(SyscallTable::builtin());
    let enabled = table
        .resolve_enabled(&config.enabled_syscalls)
        .context("bad enabled_syscalls")?;
    log::debug!("enabled syscalls: {}/{}", enabled.len(), table.count());

    log::info!("loading corpus...");
    let corpus_dir = config.workdir.join("corpus");
    let validator_table = Arc::clone(&table);
    let store = PersistentSet::open(&corpus_dir, move |data| {
        match Prog::deserialize(&validator_table, data) {
            Ok(_) => true,
            Err(err) => {
                log::warn!("deleting broken program: {}", err);
                false
            }
        }
    })
    .context("failed to open corpus store")?;
    log::info!("loaded {} programs", store.len());

    let engine = CorpusEngine::new(Arc::clone(&table), enabled, config.cover, store);
    let manager = Arc::new(Manager::new(engine));

    let listener = TcpListener::bind(&config.rpc)
        .with_context(|| format!("failed to listen on {}", config.rpc))?;
    let rpc_addr = listener.local_addr().context("no rpc local addr")?;
    log::info!("serving rpc on tcp://{}", rpc_addr);
    let rpc_manager = Arc::clone(&manager);
    // the listener lives for the whole process
    thread::spawn(move || warden_rpc::serve(listener, rpc_manager));

    let suppressions =
        Arc::new(Suppressions::new(&config.suppressions).context("bad suppression regex")?);

    setup_signal_handler();

    let stats_manager = Arc::clone(&manager);
    thread::spawn(move || report_stats(stats_manager, STATS_PERIOD));

    let mut supervisors = Vec::with_capacity(config.count);
    for slot in 0..config.count {
        let supervisor = Supervisor {
            config: Arc::clone(&config),
            manager: Arc::clone(&manager),
            slot,
            rpc_port: rpc_addr.port(),
            crash_dir: crash_dir.clone(),
            suppressions: Arc::clone(&suppressions),
        };
        supervisors.push(thread::spawn(move || supervisor.run()));
    }

    for (slot, handle) in supervisors.into_iter().enumerate() {
        if handle.join().is_err() {
            log::error!("vm-{}: supervisor panicked", slot);
        }
    }
    log::info!("all done");
    Ok(())
}

fn report_stats(manager: Arc<Manager>, period: Duration) {
    while !stop_soon() {
        thread::sleep(period);
        log::info!(
            "executed programs: {}, crashes: {}",
            manager.stat("exec total"),
            manager.stat("crashes")
        );
    }
}

/// First SIGINT starts a graceful drain and quiets the expected VM
/// failures; the second one terminates immediately.
fn setup_signal_handler() {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    thread::spawn(move || {
        let mut signals = Signals::new([SIGINT, SIGTERM]).unwrap();
        let mut seen = 0;
        for signal in signals.forever() {
            seen += 1;
            if seen == 1 {
                log::info!("signal {} received, shutting down...", signal);
                stop_req();
                // the dying VMs are about to report lost connections
                log::set_max_level(log::LevelFilter::Error);
            } else {
                eprintln!("terminating");
                std::process::exit(1);
            }
        }
    });
}
