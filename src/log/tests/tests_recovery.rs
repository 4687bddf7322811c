//! Head file recovery tests.
//!
//! A crash can leave a partially written record at the end of
//! `head.log`. Reopening must cut it off and keep every complete record.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::Write;

    use crate::error::ChangelogError;
    use crate::log::tests::helpers::*;
    use crate::log::RepositionableCursor;
    use tempfile::TempDir;

    fn append_raw(path: &std::path::Path, bytes: &[u8]) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(bytes).unwrap();
        file.sync_all().unwrap();
    }

    /// # Scenario
    /// Garbage after the last record is truncated on reopen.
    ///
    /// # Starting environment
    /// Head file holding keys 1..=20 with 64-byte blocks, followed by a
    /// partial record: a length prefix of 50 and only 3 payload bytes.
    ///
    /// # Actions
    /// 1. Reopen the log.
    /// 2. Scan it and append key 21.
    ///
    /// # Expected behavior
    /// Keys 1..=20 are readable, the file is truncated back to its size
    /// before the garbage, and 21 is appended after 20.
    #[test]
    fn recovery__truncates_partial_trailing_record() {
        let tmp = TempDir::new().unwrap();
        let head = tmp.path().join("head.log");
        {
            let log = open_log(tmp.path(), small_options(u64::MAX));
            append_all(&log, 1..=20);
        }
        let clean_size = std::fs::metadata(&head).unwrap().len();
        let mut garbage = 50u32.to_le_bytes().to_vec();
        garbage.extend_from_slice(b"abc");
        append_raw(&head, &garbage);

        let log = open_log(tmp.path(), small_options(u64::MAX));
        assert_eq!(std::fs::metadata(&head).unwrap().len(), clean_size);
        assert_eq!(*log.newest_record().unwrap().unwrap().key(), 20);

        assert!(log.append(record(21)).unwrap());
        let mut cursor = log.cursor().unwrap();
        assert_eq!(collect_keys(&mut cursor), (1..=21).collect::<Vec<_>>());
    }

    /// # Scenario
    /// A record whose checksum does not match is cut off.
    ///
    /// # Starting environment
    /// Head file holding keys 1..=3, followed by a well-framed record
    /// carrying a wrong CRC.
    ///
    /// # Actions
    /// 1. Reopen the log.
    ///
    /// # Expected behavior
    /// Exactly keys 1..=3 remain.
    #[test]
    fn recovery__truncates_record_with_bad_checksum() {
        let tmp = TempDir::new().unwrap();
        let head = tmp.path().join("head.log");
        {
            let log = open_log(tmp.path(), no_rotation_options());
            append_all(&log, 1..=3);
        }
        let mut bad = 4u32.to_le_bytes().to_vec();
        bad.extend_from_slice(b"oops");
        bad.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        append_raw(&head, &bad);

        let log = open_log(tmp.path(), no_rotation_options());
        assert_eq!(log.number_of_records().unwrap(), 3);
    }

    /// # Scenario
    /// A head file shorter than its header is reinitialised.
    ///
    /// # Starting environment
    /// `head.log` containing 5 bytes.
    ///
    /// # Actions
    /// 1. Open the log and append key 1.
    ///
    /// # Expected behavior
    /// Open succeeds with an empty log and the append works.
    #[test]
    fn recovery__short_header_is_reinitialised() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("head.log"), b"RCLG\x01").unwrap();

        let log = open_log(tmp.path(), no_rotation_options());
        assert!(log.oldest_record().unwrap().is_none());
        assert!(log.append(record(1)).unwrap());
    }

    /// # Scenario
    /// A header with a wrong magic is a corruption error.
    ///
    /// # Starting environment
    /// `head.log` holding 16 bytes of zeros.
    ///
    /// # Actions
    /// 1. Open the log.
    ///
    /// # Expected behavior
    /// Open fails with `Corrupted`.
    #[test]
    fn recovery__bad_header_fails_open() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("head.log"), [0u8; 16]).unwrap();

        let err = crate::log::Log::open(tmp.path(), parser(), no_rotation_options()).unwrap_err();
        assert!(matches!(err, ChangelogError::Corrupted { .. }), "{err}");
    }

    /// # Scenario
    /// A file keeps the block size it was written with.
    ///
    /// # Starting environment
    /// Log written with 64-byte blocks, keys 1..=50.
    ///
    /// # Actions
    /// 1. Reopen it configured with 4 KiB blocks.
    /// 2. Seek to key 30 and append key 51.
    ///
    /// # Expected behavior
    /// The seek lands on 30 and the scan from there ends with 51.
    #[test]
    fn recovery__block_size_comes_from_header() {
        let tmp = TempDir::new().unwrap();
        {
            let log = open_log(tmp.path(), small_options(u64::MAX));
            append_all(&log, 1..=50);
        }

        let log = open_log(tmp.path(), no_rotation_options());
        assert!(log.append(record(51)).unwrap());
        let mut cursor = log.cursor_at(&30).unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(*cursor.record().unwrap().key(), 30);
        assert_eq!(collect_keys(&mut cursor), (31..=51).collect::<Vec<_>>());
    }
}
