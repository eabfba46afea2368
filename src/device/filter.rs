//! Interlaced mode filtering logic

/// Filter for excluding interlaced display modes
///
/// Driver mode names carry an `i` for interlaced scanning ("1080i50"). Any
/// lowercase `i` in the name is taken as the marker, so a progressive mode whose
/// name happens to contain one is dropped too, and an interlaced mode named
/// without one ("NTSC") is kept.
pub struct InterlaceFilter;

impl InterlaceFilter {
    /// Check if a mode name indicates interlaced scanning
    pub fn is_interlaced(name: &str) -> bool {
        name.contains('i')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interlace_detection() {
        assert!(InterlaceFilter::is_interlaced("1080i50"));
        assert!(InterlaceFilter::is_interlaced("1080i59.94"));
        assert!(!InterlaceFilter::is_interlaced("1080p50"));
        assert!(!InterlaceFilter::is_interlaced("2160p23.98"));
    }

    #[test]
    fn test_heuristic_limits() {
        // false positive: progressive, but "Cinema" contains an i
        assert!(InterlaceFilter::is_interlaced("1080p24 Cinema"));
        // false negative: interlaced, no marker
        assert!(!InterlaceFilter::is_interlaced("NTSC"));
        // only lowercase counts
        assert!(!InterlaceFilter::is_interlaced("1080I50"));
    }
}
