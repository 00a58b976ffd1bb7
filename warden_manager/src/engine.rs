//! The corpus engine: authoritative fuzzing state shared by every RPC
//! handler and supervisor, guarded by one coarse mutex.

use std::sync::{Arc, Mutex};
use warden_core::{
    cover::{self, Cover},
    persist::{content_key, PersistentSet},
    prog::{calculate_priorities, Prog},
    syscall::{SyscallId, SyscallTable},
    HashMap, HashSet,
};
use warden_rpc::{
    ConnectArgs, ConnectRes, CorpusInput, Handler, NewInputArgs, PollArgs, PollRes,
};

/// Corpus entries handed to one fuzzer per poll.
const MAX_NEW_INPUTS_PER_POLL: usize = 100;
/// Untriaged candidates handed to one fuzzer per poll.
const MAX_CANDIDATES_PER_POLL: usize = 10;

struct FuzzerSession {
    /// Position in the corpus vector up to which this fuzzer has been
    /// served. Valid until the next minimization; deliberately not reset
    /// when the corpus shrinks, so a stale cursor serves nothing until
    /// new entries append past it.
    cursor: usize,
}

pub struct CorpusEngine {
    table: Arc<SyscallTable>,
    enabled_calls: String,
    cover_enabled: bool,
    store: PersistentSet,
    /// Persisted programs awaiting re-triage by a fuzzer, drained LIFO.
    candidates: Vec<Vec<u8>>,
    /// Hashes of persisted programs using disabled syscalls; they are
    /// never executed but survive store minimization.
    disabled_hashes: Vec<String>,
    corpus: Vec<CorpusInput>,
    /// Cumulative cover per syscall id.
    corpus_cover: Vec<Cover>,
    prios: Vec<Vec<f32>>,
    stats: HashMap<String, u64>,
    fuzzers: HashMap<String, FuzzerSession>,
}

impl CorpusEngine {
    /// Build the engine from the freshly opened store: broken programs
    /// were already dropped by the store's validator, so every entry
    /// either becomes a candidate or is parked as a disabled hash.
    pub fn new(
        table: Arc<SyscallTable>,
        enabled: HashSet<SyscallId>,
        cover_enabled: bool,
        store: PersistentSet,
    ) -> Self {
        let mut ids: Vec<SyscallId> = enabled.iter().copied().collect();
        ids.sort_unstable();
        let enabled_calls = ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut candidates = Vec::new();
        let mut disabled_hashes = Vec::new();
        for (key, data) in store.entries() {
            let prog = Prog::deserialize(&table, data)
                .unwrap_or_else(|err| panic!("validated program failed to decode: {}", err));
            if prog.has_disabled_call(&enabled) {
                disabled_hashes.push(key.clone());
            } else {
                candidates.push(data.clone());
            }
        }

        let corpus_cover = vec![Cover::default(); table.count()];
        Self {
            table,
            enabled_calls,
            cover_enabled,
            store,
            candidates,
            disabled_hashes,
            corpus: Vec::new(),
            corpus_cover,
            prios: Vec::new(),
            stats: HashMap::default(),
            fuzzers: HashMap::default(),
        }
    }

    fn connect(&mut self, name: &str) -> (Vec<Vec<f32>>, String) {
        self.bump("vm restarts");
        self.minimize_corpus();
        self.fuzzers
            .insert(name.to_string(), FuzzerSession { cursor: 0 });
        (self.prios.clone(), self.enabled_calls.clone())
    }

    fn new_input(&mut self, input: CorpusInput) -> Result<(), String> {
        let call = self
            .table
            .id_of(&input.call)
            .ok_or_else(|| format!("unknown call: {}", input.call))?;
        if input.cover.difference(&self.corpus_cover[call]).is_empty() {
            // nothing new; accepted but not worth keeping
            return Ok(());
        }
        self.corpus_cover[call].merge(&input.cover);
        self.store.add(&input.prog);
        self.corpus.push(input);
        self.bump("manager new inputs");
        Ok(())
    }

    fn poll(
        &mut self,
        name: &str,
        stats: &HashMap<String, u64>,
    ) -> (Vec<CorpusInput>, Vec<Vec<u8>>) {
        for (key, delta) in stats {
            *self.stats.entry(key.clone()).or_default() += delta;
        }

        let fuzzer = match self.fuzzers.get_mut(name) {
            Some(fuzzer) => fuzzer,
            None => {
                // programmer error on the fuzzer side; not recoverable
                log::error!("poll from unconnected fuzzer {}", name);
                std::process::exit(1);
            }
        };

        let mut new_inputs = Vec::new();
        while new_inputs.len() < MAX_NEW_INPUTS_PER_POLL && fuzzer.cursor < self.corpus.len() {
            new_inputs.push(self.corpus[fuzzer.cursor].clone());
            fuzzer.cursor += 1;
        }

        let mut candidates = Vec::new();
        while candidates.len() < MAX_CANDIDATES_PER_POLL {
            match self.candidates.pop() {
                Some(candidate) => candidates.push(candidate),
                None => break,
            }
        }

        (new_inputs, candidates)
    }

    /// Replace the corpus with a per-call union-preserving subset,
    /// recompute priorities, and, once every persisted program has been
    /// re-triaged, shrink the store to match.
    fn minimize_corpus(&mut self) {
        if self.cover_enabled && !self.corpus.is_empty() {
            let mut calls: HashMap<String, (Vec<CorpusInput>, Vec<Cover>)> = HashMap::default();
            for input in self.corpus.drain(..) {
                let bucket = calls.entry(input.call.clone()).or_default();
                bucket.1.push(input.cover.clone());
                bucket.0.push(input);
            }
            let old_len: usize = calls.values().map(|(inputs, _)| inputs.len()).sum();
            let mut new_corpus = Vec::new();
            for (_, (inputs, covers)) in calls {
                for idx in cover::minimize(&covers) {
                    new_corpus.push(inputs[idx].clone());
                }
            }
            log::debug!("minimized corpus: {} -> {}", old_len, new_corpus.len());
            self.corpus = new_corpus;
        }

        let progs: Vec<Prog> = self
            .corpus
            .iter()
            .map(|input| {
                Prog::deserialize(&self.table, &input.prog)
                    .unwrap_or_else(|err| panic!("corrupt corpus entry: {}", err))
            })
            .collect();
        self.prios = calculate_priorities(&self.table, &progs);

        // don't shrink the store while fuzzers are still re-triaging it
        if self.candidates.is_empty() {
            let mut keep: HashSet<String> = self
                .corpus
                .iter()
                .map(|input| content_key(&input.prog))
                .collect();
            keep.extend(self.disabled_hashes.iter().cloned());
            self.store.minimize(&keep);
        }
    }

    fn bump(&mut self, key: &str) {
        *self.stats.entry(key.to_string()).or_default() += 1;
    }

    fn stat(&self, key: &str) -> u64 {
        self.stats.get(key).copied().unwrap_or(0)
    }
}

/// Shared handle: the engine behind its mutex. Every RPC handler and
/// every stat access goes through here.
pub struct Manager {
    engine: Mutex<CorpusEngine>,
}

impl Manager {
    pub fn new(engine: CorpusEngine) -> Self {
        Self {
            engine: Mutex::new(engine),
        }
    }

    pub fn bump(&self, key: &str) {
        self.engine.lock().unwrap().bump(key);
    }

    pub fn stat(&self, key: &str) -> u64 {
        self.engine.lock().unwrap().stat(key)
    }
}

impl Handler for Manager {
    fn connect(&self, args: ConnectArgs) -> Result<ConnectRes, String> {
        log::debug!("fuzzer {} connected", args.name);
        let mut engine = self.engine.lock().unwrap();
        let (prios, enabled_calls) = engine.connect(&args.name);
        Ok(ConnectRes {
            prios,
            enabled_calls,
        })
    }

    fn new_input(&self, args: NewInputArgs) -> Result<(), String> {
        log::trace!("new input from {} for call {}", args.name, args.input.call);
        self.engine.lock().unwrap().new_input(args.input)
    }

    fn poll(&self, args: PollArgs) -> Result<PollRes, String> {
        log::trace!("poll from {}", args.name);
        let mut engine = self.engine.lock().unwrap();
        let (new_inputs, candidates) = engine.poll(&args.name, &args.stats);
        Ok(PollRes {
            candidates,
            new_inputs,
        })
    }
}
