//! Kernel crash detection over raw console output.

use regex::bytes::Regex;
use std::sync::OnceLock;

/// One recognized kernel failure: a short description plus the byte span
/// of the matched report line within the scanned buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashMatch {
    pub desc: String,
    pub start: usize,
    pub end: usize,
}

const MAX_DESC_LEN: usize = 128;

// Console output is not guaranteed UTF-8, hence bytes regexes. Each
// pattern matches a single report line.
static CRASH_PATTERNS: &[&str] = &[
    r"BUG: [^\r\n]+",
    r"kernel BUG at [^\r\n]+",
    r"Kernel panic[^\r\n]*",
    r"WARNING:[^\r\n]+",
    r"Oops:[^\r\n]*",
    r"unable to handle kernel [^\r\n]+",
    r"general protection fault[^\r\n]*",
    r"divide error:[^\r\n]*",
    r"invalid opcode:[^\r\n]*",
    r"Call Trace:",
    r"INFO: possible [^\r\n]*lock[^\r\n]+",
    r"INFO: task hung[^\r\n]*",
    r"INFO: rcu_[a-z]+ detected stalls[^\r\n]*",
    r"watchdog: BUG: soft lockup[^\r\n]+",
    r"BUG: soft lockup[^\r\n]+",
    r"UBSAN:[^\r\n]+",
    r"unreferenced object 0x[0-9a-f]+[^\r\n]*",
];

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        CRASH_PATTERNS
            .iter()
            .map(|pattern| Regex::new(pattern).unwrap())
            .collect()
    })
}

/// Scan `output` for a kernel failure report. Returns the earliest
/// match; ties go to the pattern listed first.
pub fn find_crash(output: &[u8]) -> Option<CrashMatch> {
    let mut best: Option<(usize, usize)> = None; // (start, pattern index)
    for (i, re) in patterns().iter().enumerate() {
        if let Some(m) = re.find(output) {
            if best.map_or(true, |(start, _)| m.start() < start) {
                best = Some((m.start(), i));
            }
        }
    }
    let (_, i) = best?;
    let m = patterns()[i].find(output).unwrap();
    let mut desc = String::from_utf8_lossy(m.as_bytes()).into_owned();
    if let Some((idx, _)) = desc.char_indices().nth(MAX_DESC_LEN) {
        desc.truncate(idx);
    }
    Some(CrashMatch {
        desc,
        start: m.start(),
        end: m.end(),
    })
}

/// Ordered suppression list from configuration: crash output matching
/// any entry is discarded as a known false positive.
#[derive(Debug, Default)]
pub struct Suppressions(Vec<Regex>);

impl Suppressions {
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            compiled.push(Regex::new(pattern)?);
        }
        Ok(Self(compiled))
    }

    /// First suppression matching `output`, if any.
    pub fn matches(&self, output: &[u8]) -> Option<&str> {
        self.0
            .iter()
            .find(|re| re.is_match(output))
            .map(|re| re.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_null_deref_bug() {
        let output =
            b"[ 12.345] executing program\n[ 12.678] BUG: kernel NULL pointer dereference at 0x0\nsome trace\n";
        let m = find_crash(output).unwrap();
        assert_eq!(m.desc, "BUG: kernel NULL pointer dereference at 0x0");
        assert_eq!(&output[m.start..m.end], m.desc.as_bytes());
    }

    #[test]
    fn earliest_report_wins() {
        let output = b"Kernel panic - not syncing: fatal\nBUG: later report\n";
        let m = find_crash(output).unwrap();
        assert_eq!(m.desc, "Kernel panic - not syncing: fatal");
    }

    #[test]
    fn quiet_output_is_clean() {
        assert!(find_crash(b"booting...\nexecuting program\nall fine\n").is_none());
        assert!(find_crash(b"").is_none());
    }

    #[test]
    fn non_utf8_output_is_handled() {
        let mut output = vec![0xff, 0xfe, b'\n'];
        output.extend_from_slice(b"general protection fault: 0000 [#1] SMP\n");
        assert!(find_crash(&output).is_some());
    }

    #[test]
    fn suppressions_match_in_order() {
        let sup = Suppressions::new(&[
            "qemu: terminating on signal".to_string(),
            "WARNING: known false positive".to_string(),
        ])
        .unwrap();
        assert_eq!(
            sup.matches(b"noise\nqemu: terminating on signal 2\n"),
            Some("qemu: terminating on signal")
        );
        assert!(sup.matches(b"WARNING: real bug").is_none());
        assert!(Suppressions::new(&["(broken".to_string()]).is_err());
    }
}
