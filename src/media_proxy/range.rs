//! Parsing for a single `Range: bytes=...` header value.

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

/// Parses `bytes=a-b`, `bytes=a-` and `bytes=-n` (suffix) forms against a
/// known total length. Multi-range requests are not supported and are
/// rejected with `unsatisfiable_range`, matching the single-range contract
/// the clip endpoint exposes.
pub fn parse_range(header: &str, total_len: u64) -> Result<ByteRange, AppError> {
    let spec = header
        .strip_prefix("bytes=")
        .ok_or_else(|| AppError::InvalidInput("unsupported range unit".to_string()))?;
    if spec.contains(',') {
        return Err(AppError::UnsatisfiableRange);
    }

    let (start_s, end_s) = spec.split_once('-').ok_or(AppError::UnsatisfiableRange)?;

    let range = if start_s.is_empty() {
        let suffix_len: u64 = end_s.parse().map_err(|_| AppError::UnsatisfiableRange)?;
        if suffix_len == 0 || total_len == 0 {
            return Err(AppError::UnsatisfiableRange);
        }
        let start = total_len.saturating_sub(suffix_len);
        ByteRange {
            start,
            end: total_len - 1,
        }
    } else {
        let start: u64 = start_s.parse().map_err(|_| AppError::UnsatisfiableRange)?;
        let end = if end_s.is_empty() {
            total_len.saturating_sub(1)
        } else {
            end_s.parse().map_err(|_| AppError::UnsatisfiableRange)?
        };
        ByteRange { start, end }
    };

    if range.start > range.end || range.end >= total_len || total_len == 0 {
        return Err(AppError::UnsatisfiableRange);
    }
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_range() {
        let r = parse_range("bytes=0-0", 10_000).unwrap();
        assert_eq!(r, ByteRange { start: 0, end: 0 });
    }

    #[test]
    fn open_ended_range() {
        let r = parse_range("bytes=5000-", 10_000).unwrap();
        assert_eq!(r, ByteRange { start: 5000, end: 9999 });
    }

    #[test]
    fn bounded_range() {
        let r = parse_range("bytes=0-4999", 10_000).unwrap();
        assert_eq!(r, ByteRange { start: 0, end: 4999 });
    }

    #[test]
    fn out_of_bounds_start_is_unsatisfiable() {
        let result = parse_range("bytes=999999999-", 10);
        assert!(matches!(result, Err(AppError::UnsatisfiableRange)));
    }

    #[test]
    fn suffix_range() {
        let r = parse_range("bytes=-500", 10_000).unwrap();
        assert_eq!(r, ByteRange { start: 9500, end: 9999 });
    }

    #[test]
    fn sequential_ranges_cover_full_clip() {
        let total = 10_000u64;
        let a = parse_range("bytes=0-4999", total).unwrap();
        let b = parse_range("bytes=5000-", total).unwrap();
        assert_eq!(a.end - a.start + 1 + (b.end - b.start + 1), total);
    }
}
