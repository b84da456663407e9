//! Binary file heuristic.

/// Bytes inspected from the start of a file.
pub const SAMPLE_SIZE: usize = 4096;

/// Share of control bytes above which a sample counts as binary.
const CONTROL_RATIO: f64 = 0.3;

/// Classify a sample. Any NUL byte means binary; otherwise binary when more
/// than 30% of the bytes are control characters other than tab, LF and CR.
pub fn is_binary(sample: &[u8]) -> bool {
    if sample.is_empty() {
        return false;
    }
    if sample.contains(&0) {
        return true;
    }
    let control = sample
        .iter()
        .filter(|&&b| (b < 0x20 || b == 0x7f) && !matches!(b, b'\t' | b'\n' | b'\r'))
        .count();
    control as f64 / sample.len() as f64 > CONTROL_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nul_is_binary() {
        assert!(is_binary(b"plain text\0more text"));
    }

    #[test]
    fn test_text_is_not_binary() {
        assert!(!is_binary(b"line one\r\n\tline two\n"));
        assert!(!is_binary("unicode: caf\u{e9}".as_bytes()));
        assert!(!is_binary(b""));
    }

    #[test]
    fn test_control_ratio_boundary() {
        // 3 of 10 bytes are control: exactly 30%, not above it.
        let mut sample = vec![b'a'; 7];
        sample.extend([0x01, 0x02, 0x1b]);
        assert!(!is_binary(&sample));

        sample.push(0x03);
        assert!(is_binary(&sample));
    }
}
