//! Evidence snippet hashing and verification against current file content.

use anyhow::Result;
use xxhash_rust::xxh3::xxh3_64;

use crate::memory::model::{EvidenceRef, Verification};
use crate::providers::FileSource;

/// Confidence multiplier applied when evidence no longer matches.
pub const MISMATCH_PENALTY: f64 = 0.5;

/// Hash of lines `start..=end` (1-based, trailing whitespace trimmed, joined
/// with `\n`). Whole file when `start` is absent. `None` if out of range.
pub fn snippet_hash(content: &str, start: Option<u32>, end: Option<u32>) -> Option<String> {
    let lines: Vec<&str> = content.lines().collect();
    let (from, to) = match start {
        None => (1usize, lines.len()),
        Some(s) => {
            let s = s.max(1) as usize;
            let e = end.map(|e| e as usize).unwrap_or(s).max(s);
            (s, e)
        }
    };
    if start.is_some() && (from > lines.len() || to > lines.len()) {
        return None;
    }
    let joined = lines
        .get(from.saturating_sub(1)..to.min(lines.len()))
        .unwrap_or_default()
        .iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    Some(format!("{:016x}", xxh3_64(joined.as_bytes())))
}

/// Build a hashed reference for a line range of `content`.
pub fn evidence_ref(file_path: &str, content: &str, start: u32, end: u32) -> EvidenceRef {
    EvidenceRef {
        file_path: file_path.to_string(),
        start_line: Some(start),
        end_line: Some(end),
        snippet_hash: snippet_hash(content, Some(start), Some(end)).unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceStatus {
    Matches,
    Mismatch,
    Missing,
    /// No hash recorded; nothing to compare.
    Unhashed,
}

pub fn check(files: &dyn FileSource, ev: &EvidenceRef) -> Result<EvidenceStatus> {
    let Some(content) = files.read_to_string(&ev.file_path)? else {
        return Ok(EvidenceStatus::Missing);
    };
    if ev.snippet_hash.is_empty() {
        return Ok(EvidenceStatus::Unhashed);
    }
    match snippet_hash(&content, ev.start_line, ev.end_line) {
        Some(h) if h == ev.snippet_hash => Ok(EvidenceStatus::Matches),
        _ => Ok(EvidenceStatus::Mismatch),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    pub kept: Vec<EvidenceRef>,
    pub dropped: usize,
    pub mismatched: usize,
    pub verification: Verification,
    pub confidence: f64,
}

/// Check every reference: missing files drop the ref, any mismatch marks the
/// claim unverified and halves its confidence.
pub fn verify(files: &dyn FileSource, evidence: &[EvidenceRef], confidence: f64) -> Result<VerifyOutcome> {
    let mut kept = Vec::new();
    let mut dropped = 0;
    let mut mismatched = 0;
    let mut matched = 0;
    for ev in evidence {
        match check(files, ev)? {
            EvidenceStatus::Missing => dropped += 1,
            EvidenceStatus::Mismatch => {
                mismatched += 1;
                kept.push(ev.clone());
            }
            EvidenceStatus::Matches => {
                matched += 1;
                kept.push(ev.clone());
            }
            EvidenceStatus::Unhashed => kept.push(ev.clone()),
        }
    }
    let (verification, confidence) = if mismatched > 0 {
        (Verification::Unverified, confidence * MISMATCH_PENALTY)
    } else if matched > 0 {
        (Verification::Verified, confidence)
    } else {
        (Verification::Unchecked, confidence)
    };
    Ok(VerifyOutcome {
        kept,
        dropped,
        mismatched,
        verification,
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::FsSource;
    use tempfile::TempDir;

    const FILE: &str = "one\ntwo  \nthree\nfour\n";

    #[test]
    fn hash_ignores_trailing_whitespace() {
        let a = snippet_hash(FILE, Some(2), Some(3)).unwrap();
        let b = snippet_hash("one\ntwo\nthree\t\nfour\n", Some(2), Some(3)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(snippet_hash(FILE, Some(3), Some(9)).is_none());
    }

    #[test]
    fn verify_classifies_refs() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/foo.rs"), FILE).unwrap();
        let files = FsSource::new(tmp.path());

        let good = evidence_ref("src/foo.rs", FILE, 1, 2);
        let mut stale = evidence_ref("src/foo.rs", FILE, 3, 4);
        stale.snippet_hash = "0000000000000000".into();
        let gone = evidence_ref("src/gone.rs", FILE, 1, 1);

        let ok = verify(&files, &[good.clone()], 0.9).unwrap();
        assert_eq!(ok.verification, Verification::Verified);
        assert_eq!(ok.confidence, 0.9);

        let bad = verify(&files, &[good, stale, gone], 0.8).unwrap();
        assert_eq!(bad.verification, Verification::Unverified);
        assert_eq!(bad.dropped, 1);
        assert_eq!(bad.kept.len(), 2);
        assert!((bad.confidence - 0.4).abs() < 1e-9);
    }

    #[test]
    fn no_evidence_is_unchecked() {
        let tmp = TempDir::new().unwrap();
        let out = verify(&FsSource::new(tmp.path()), &[], 1.0).unwrap();
        assert_eq!(out.verification, Verification::Unchecked);
    }
}
