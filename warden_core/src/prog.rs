//! Serialized test programs.
//!
//! A program travels as opaque bytes; the manager only ever decodes the
//! call sequence to check enabled/disabled status and to weight call
//! pairs. Arguments are never inspected here.

use crate::{
    syscall::{SyscallId, SyscallTable},
    HashSet,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("program is not utf-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("program has no calls")]
    Empty,
    #[error("line {0}: missing '('")]
    MalformedCall(usize),
    #[error("line {0}: unknown call '{1}'")]
    UnknownCall(usize, String),
}

/// A decoded program: the original byte form plus the call-id sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prog {
    bytes: Vec<u8>,
    calls: Vec<SyscallId>,
}

impl Prog {
    /// Decode the textual form: one call per line, `name(args...)`, with
    /// an optional `res = ` result prefix. Blank lines and `#` comments
    /// are skipped.
    pub fn deserialize(table: &SyscallTable, bytes: &[u8]) -> Result<Prog, ParseError> {
        let text = std::str::from_utf8(bytes)?;
        let mut calls = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let call = match line.split_once(" = ") {
                Some((_, rhs)) => rhs,
                None => line,
            };
            let name = call
                .split_once('(')
                .map(|(name, _)| name.trim())
                .ok_or(ParseError::MalformedCall(i + 1))?;
            let id = table
                .id_of(name)
                .ok_or_else(|| ParseError::UnknownCall(i + 1, name.to_string()))?;
            calls.push(id);
        }
        if calls.is_empty() {
            return Err(ParseError::Empty);
        }
        Ok(Prog {
            bytes: bytes.to_vec(),
            calls,
        })
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn calls(&self) -> &[SyscallId] {
        &self.calls
    }

    /// True when any call of the program is outside `enabled`.
    pub fn has_disabled_call(&self, enabled: &HashSet<SyscallId>) -> bool {
        self.calls.iter().any(|id| !enabled.contains(id))
    }
}

const MIN_PRIO: f32 = 0.1;

/// Pairwise call priorities derived from the corpus: how often two calls
/// co-occur in one program, row-normalized into [MIN_PRIO, 1.0].
///
/// Pure function of its input; an empty corpus yields the uniform floor.
pub fn calculate_priorities(table: &SyscallTable, corpus: &[Prog]) -> Vec<Vec<f32>> {
    let n = table.count();
    let mut counts = vec![vec![0u64; n]; n];
    for prog in corpus {
        for &a in prog.calls() {
            for &b in prog.calls() {
                if a != b {
                    counts[a][b] += 1;
                }
            }
        }
    }

    let mut prios = vec![vec![MIN_PRIO; n]; n];
    for (row, count_row) in prios.iter_mut().zip(&counts) {
        let max = count_row.iter().copied().max().unwrap_or(0);
        if max == 0 {
            continue;
        }
        for (prio, &count) in row.iter_mut().zip(count_row) {
            *prio = MIN_PRIO + (1.0 - MIN_PRIO) * count as f32 / max as f32;
        }
    }
    prios
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_extracts_call_names() {
        let table = SyscallTable::builtin();
        let prog = Prog::deserialize(
            &table,
            b"r0 = open(&(0x7f0000000000)='./file0', 0x0)\nread(r0, 0x0, 0x10)\nclose(r0)\n",
        )
        .unwrap();
        let want = vec![
            table.id_of("open").unwrap(),
            table.id_of("read").unwrap(),
            table.id_of("close").unwrap(),
        ];
        assert_eq!(prog.calls(), &want[..]);
    }

    #[test]
    fn deserialize_rejects_garbage() {
        let table = SyscallTable::builtin();
        assert!(matches!(
            Prog::deserialize(&table, b"garbage"),
            Err(ParseError::MalformedCall(1))
        ));
        assert!(matches!(
            Prog::deserialize(&table, b"frobnicate(0x0)\n"),
            Err(ParseError::UnknownCall(1, _))
        ));
        assert!(matches!(
            Prog::deserialize(&table, b"# nothing\n\n"),
            Err(ParseError::Empty)
        ));
        assert!(Prog::deserialize(&table, &[0xff, 0xfe]).is_err());
    }

    #[test]
    fn disabled_call_detection() {
        let table = SyscallTable::builtin();
        let prog = Prog::deserialize(&table, b"open(0x0)\nread(0x0)\n").unwrap();
        let enabled = table
            .resolve_enabled(&["open".to_string(), "read".to_string()])
            .unwrap();
        assert!(!prog.has_disabled_call(&enabled));
        let only_open = table.resolve_enabled(&["open".to_string()]).unwrap();
        assert!(prog.has_disabled_call(&only_open));
    }

    #[test]
    fn priorities_favor_cooccurring_pairs() {
        let table = SyscallTable::builtin();
        let read = table.id_of("read").unwrap();
        let write = table.id_of("write").unwrap();
        let open = table.id_of("open").unwrap();

        let corpus = vec![
            Prog::deserialize(&table, b"open(0x0)\nread(0x0)\n").unwrap(),
            Prog::deserialize(&table, b"open(0x0)\nread(0x1)\n").unwrap(),
            Prog::deserialize(&table, b"open(0x0)\nwrite(0x0)\n").unwrap(),
        ];
        let prios = calculate_priorities(&table, &corpus);
        assert_eq!(prios.len(), table.count());
        assert!(prios[open][read] > prios[open][write]);
        assert!((prios[open][read] - 1.0).abs() < f32::EPSILON);
        assert!((prios[read][write] - MIN_PRIO).abs() < f32::EPSILON);

        // deterministic and pure
        assert_eq!(prios, calculate_priorities(&table, &corpus));
        assert_eq!(
            calculate_priorities(&table, &[])[0],
            vec![MIN_PRIO; table.count()]
        );
    }
}
