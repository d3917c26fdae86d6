//! Inclusive byte ranges such as `0-3`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use super::{ManifestError, ManifestResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Parses `start-end` (both inclusive) into a start offset and length.
    pub fn parse(range: &str) -> ManifestResult<Self> {
        let invalid = || ManifestError::InvalidByteRange(range.to_string());

        let (start, end) = range.split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end: u64 = end.trim().parse().map_err(|_| invalid())?;

        if start > end {
            return Err(invalid());
        }

        let length = (end - start).checked_add(1).ok_or_else(invalid)?;
        Ok(Self { start, length })
    }

    /// Reads the range from a file. Returns fewer bytes when the file ends
    /// before the range does.
    pub fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut file = File::open(path)?;
        let available = file.metadata()?.len().saturating_sub(self.start);
        file.seek(SeekFrom::Start(self.start))?;

        let mut buffer = Vec::with_capacity(available.min(self.length) as usize);
        file.take(self.length).read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}

impl std::str::FromStr for ByteRange {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_parse() {
        assert_eq!(ByteRange::parse("1-10").unwrap(), ByteRange::new(1, 10));
        assert_eq!(ByteRange::parse("0-0").unwrap(), ByteRange::new(0, 1));
        assert_eq!("5-9".parse::<ByteRange>().unwrap().length, 5);
    }

    #[test]
    fn test_parse_rejects_invalid_ranges() {
        for range in ["2-1", "foo-bar", "10", "-1-5", "1-", ""] {
            assert!(
                matches!(ByteRange::parse(range), Err(ManifestError::InvalidByteRange(_))),
                "{range} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_full_u64_span() {
        let max = u64::MAX;
        assert!(matches!(
            ByteRange::parse(&format!("0-{max}")),
            Err(ManifestError::InvalidByteRange(_))
        ));
        assert_eq!(
            ByteRange::parse(&format!("1-{max}")).unwrap(),
            ByteRange::new(1, max)
        );
    }

    #[test]
    fn test_read_huge_range_stops_at_end_of_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.bin");
        fs::write(&path, b"0123456789").unwrap();

        let range = ByteRange::parse(&format!("4-{}", u64::MAX)).unwrap();
        assert_eq!(range.read(&path).unwrap(), b"456789");
        assert!(ByteRange::parse("20-30").unwrap().read(&path).unwrap().is_empty());
    }

    #[test]
    fn test_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.bin");
        fs::write(&path, b"0123456789").unwrap();

        assert_eq!(ByteRange::parse("2-4").unwrap().read(&path).unwrap(), b"234");
        assert_eq!(ByteRange::parse("8-20").unwrap().read(&path).unwrap(), b"89");
    }
}
