/// Upload screening gate
///
/// Three independent checks over already-buffered bytes: binary signature,
/// declared size and a byte-level scan for patterns associated with code
/// execution primitives. The scan is a heuristic; the renderer is always
/// started with embedded script auto-execution disabled as well.
use crate::config::loader::ValidationConfig;
use crate::config::types::{CheckVerdict, ValidationError, ValidationReport};

/// Number of leading bytes echoed back in a signature rejection
const SIGNATURE_PREVIEW_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct Validator {
    magic: Vec<u8>,
    max_asset_bytes: u64,
    banned_patterns: Vec<Vec<u8>>,
}

impl Validator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            magic: config.magic.as_bytes().to_vec(),
            max_asset_bytes: config.max_asset_bytes,
            banned_patterns: config
                .banned_patterns
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| p.as_bytes().to_vec())
                .collect(),
        }
    }

    pub fn max_asset_bytes(&self) -> u64 {
        self.max_asset_bytes
    }

    /// Screen one asset. Pure inspection, no side effects.
    pub fn validate(&self, bytes: &[u8], declared_size: u64) -> ValidationReport {
        ValidationReport {
            signature: self.check_signature(bytes),
            size: self.check_size(declared_size),
            content: self.check_content(bytes),
        }
    }

    fn check_signature(&self, bytes: &[u8]) -> CheckVerdict {
        if bytes.starts_with(&self.magic) {
            return CheckVerdict::Pass;
        }
        let preview = &bytes[..bytes.len().min(SIGNATURE_PREVIEW_LEN)];
        CheckVerdict::Reject(ValidationError::BadSignature {
            expected: String::from_utf8_lossy(&self.magic).into_owned(),
            found: String::from_utf8_lossy(preview).into_owned(),
        })
    }

    fn check_size(&self, declared_size: u64) -> CheckVerdict {
        if declared_size <= self.max_asset_bytes {
            CheckVerdict::Pass
        } else {
            CheckVerdict::Reject(ValidationError::TooLarge {
                size: declared_size,
                max: self.max_asset_bytes,
            })
        }
    }

    fn check_content(&self, bytes: &[u8]) -> CheckVerdict {
        match self
            .banned_patterns
            .iter()
            .find(|pattern| contains_subslice(bytes, pattern))
        {
            Some(pattern) => CheckVerdict::Reject(ValidationError::SuspiciousContent {
                pattern: String::from_utf8_lossy(pattern).into_owned(),
            }),
            None => CheckVerdict::Pass,
        }
    }
}

/// Byte substring search, anchored on the first pattern byte
fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    let first = needle[0];
    let last_start = haystack.len() - needle.len();
    let mut start = 0;
    while start <= last_start {
        match haystack[start..=last_start].iter().position(|&b| b == first) {
            Some(offset) => {
                let idx = start + offset;
                if &haystack[idx..idx + needle.len()] == needle {
                    return true;
                }
                start = idx + 1;
            }
            None => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(max: u64) -> Validator {
        Validator::new(&ValidationConfig {
            max_asset_bytes: max,
            ..ValidationConfig::default()
        })
    }

    fn blend(body: &[u8]) -> Vec<u8> {
        let mut bytes = b"BLENDER-v300".to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn clean_asset_passes() {
        let bytes = blend(&vec![0u8; 10 * 1024]);
        let report = validator(1024 * 1024).validate(&bytes, bytes.len() as u64);
        assert!(report.is_pass());
        assert_eq!(report.reason(), None);
    }

    #[test]
    fn size_boundary_is_inclusive() {
        let v = validator(1000);
        let bytes = blend(b"");
        assert!(v.validate(&bytes, 1000).size.is_pass());
        assert_eq!(
            v.validate(&bytes, 1001).size,
            CheckVerdict::Reject(ValidationError::TooLarge { size: 1001, max: 1000 })
        );
    }

    #[test]
    fn missing_magic_is_rejected_regardless_of_content() {
        let v = validator(1024);
        for bytes in [
            b"".to_vec(),
            b"BLENDE".to_vec(),
            b"blender-v300".to_vec(),
            b"\x1f\x8b\x08BLENDER".to_vec(),
            b"xBLENDER-v300 harmless".to_vec(),
        ] {
            let report = v.validate(&bytes, bytes.len() as u64);
            assert!(!report.is_pass());
            assert!(matches!(
                report.rejection(),
                Some(ValidationError::BadSignature { .. })
            ));
        }
    }

    #[test]
    fn banned_pattern_anywhere_rejects() {
        let v = validator(1024 * 1024);
        let mut body = vec![0u8; 4096];
        body.extend_from_slice(b"import subprocess; subprocess.Popen(['sh'])");
        body.extend_from_slice(&[0u8; 64]);
        let bytes = blend(&body);

        let report = v.validate(&bytes, bytes.len() as u64);
        assert!(report.signature.is_pass());
        assert_eq!(
            report.content,
            CheckVerdict::Reject(ValidationError::SuspiciousContent {
                pattern: "subprocess".to_string()
            })
        );
    }

    #[test]
    fn pattern_at_the_very_end_is_found() {
        let v = validator(1024);
        let bytes = blend(b"...eval(");
        assert!(!v.validate(&bytes, bytes.len() as u64).content.is_pass());
    }

    #[test]
    fn every_check_is_reported() {
        let v = validator(4);
        let bytes = b"#!/bin/sh\nexec(".to_vec();
        let report = v.validate(&bytes, bytes.len() as u64);
        assert!(!report.signature.is_pass());
        assert!(!report.size.is_pass());
        assert!(!report.content.is_pass());
    }

    #[test]
    fn subslice_search_edges() {
        assert!(contains_subslice(b"abc", b"abc"));
        assert!(contains_subslice(b"aab", b"ab"));
        assert!(!contains_subslice(b"ab", b"abc"));
        assert!(!contains_subslice(b"abc", b""));
        assert!(!contains_subslice(b"aaaa", b"ab"));
    }
}
