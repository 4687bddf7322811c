//! Cursor positioning tests.
//!
//! Covers every (matching, positioning) combination, over one file and
//! across rotated files, with small blocks so that seeks go through the
//! block index.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::log::tests::helpers::*;
    use crate::log::{KeyMatchingStrategy as M, PositionStrategy as P, RepositionableCursor};
    use tempfile::TempDir;

    fn first_key_after(log: &crate::log::Log<u64, String>, key: u64, m: M, p: P) -> Option<u64> {
        let mut cursor = log.cursor_from(Some(&key), m, p).unwrap();
        assert!(cursor.record().is_none(), "positioned cursor must not expose a record");
        if cursor.next().unwrap() {
            Some(*cursor.record().unwrap().key())
        } else {
            None
        }
    }

    /// # Scenario
    /// Seek through the block index lands exactly on the target.
    ///
    /// # Starting environment
    /// Log with 64-byte blocks holding 200 small records, keys 1..=200.
    ///
    /// # Actions
    /// 1. Open a cursor at key 150 with LessThanOrEqualToKey/OnMatchingKey.
    ///
    /// # Expected behavior
    /// The first record is exactly key 150 and the scan continues to 200.
    #[test]
    fn cursor__small_blocks_seek_to_150th_record() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), small_options(u64::MAX));
        append_all(&log, 1..=200);

        let mut cursor = log
            .cursor_from(Some(&150), M::LessThanOrEqualToKey, P::OnMatchingKey)
            .unwrap();
        assert_eq!(collect_keys(&mut cursor), (150..=200).collect::<Vec<_>>());
    }

    /// # Scenario
    /// Every strategy combination on present and absent keys in one file.
    ///
    /// # Starting environment
    /// Log with 64-byte blocks holding even keys 2..=100.
    ///
    /// # Actions
    /// 1. Position on key 50 (present) and key 51 (absent) with every
    ///    combination.
    ///
    /// # Expected behavior
    /// The first record returned follows the strategy definitions.
    #[test]
    fn cursor__strategies_within_one_file() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), small_options(u64::MAX));
        append_all(&log, (1..=50).map(|i| i * 2));

        assert_eq!(first_key_after(&log, 50, M::EqualToKey, P::OnMatchingKey), Some(50));
        assert_eq!(first_key_after(&log, 50, M::EqualToKey, P::AfterMatchingKey), Some(52));
        assert_eq!(first_key_after(&log, 50, M::LessThanOrEqualToKey, P::OnMatchingKey), Some(50));
        assert_eq!(first_key_after(&log, 50, M::GreaterThanOrEqualToKey, P::AfterMatchingKey), Some(52));

        assert_eq!(first_key_after(&log, 51, M::EqualToKey, P::OnMatchingKey), None);
        assert_eq!(first_key_after(&log, 51, M::LessThanOrEqualToKey, P::OnMatchingKey), Some(50));
        assert_eq!(first_key_after(&log, 51, M::LessThanOrEqualToKey, P::AfterMatchingKey), Some(52));
        assert_eq!(first_key_after(&log, 51, M::GreaterThanOrEqualToKey, P::OnMatchingKey), Some(52));
        assert_eq!(first_key_after(&log, 51, M::GreaterThanOrEqualToKey, P::AfterMatchingKey), Some(52));
    }

    /// # Scenario
    /// The same strategies work when the key sits in a rotated file or
    /// between two files.
    ///
    /// # Starting environment
    /// Three files: [10..=19], [30..=39] and the head [50..=59].
    ///
    /// # Actions
    /// 1. Position on keys in, before, between and after the files.
    ///
    /// # Expected behavior
    /// Results match a single-file log holding the same keys.
    #[test]
    fn cursor__strategies_across_files() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), small_options(u64::MAX));
        append_all(&log, 10..=19);
        log.rotate_if_not_empty().unwrap();
        append_all(&log, 30..=39);
        log.rotate_if_not_empty().unwrap();
        append_all(&log, 50..=59);
        assert_eq!(log.number_of_files().unwrap(), 3);

        assert_eq!(first_key_after(&log, 35, M::EqualToKey, P::OnMatchingKey), Some(35));
        assert_eq!(first_key_after(&log, 39, M::EqualToKey, P::AfterMatchingKey), Some(50));
        assert_eq!(first_key_after(&log, 25, M::LessThanOrEqualToKey, P::OnMatchingKey), Some(19));
        assert_eq!(first_key_after(&log, 25, M::LessThanOrEqualToKey, P::AfterMatchingKey), Some(30));
        assert_eq!(first_key_after(&log, 45, M::GreaterThanOrEqualToKey, P::OnMatchingKey), Some(50));
        assert_eq!(first_key_after(&log, 5, M::GreaterThanOrEqualToKey, P::OnMatchingKey), Some(10));
        assert_eq!(first_key_after(&log, 99, M::LessThanOrEqualToKey, P::OnMatchingKey), Some(59));
        assert_eq!(first_key_after(&log, 25, M::EqualToKey, P::OnMatchingKey), None);
    }

    /// # Scenario
    /// LessThanOrEqualToKey below the first record starts at the beginning.
    ///
    /// # Starting environment
    /// Log holding keys 10..=20.
    ///
    /// # Actions
    /// 1. Open a cursor at key 3 with LessThanOrEqualToKey.
    ///
    /// # Expected behavior
    /// The cursor yields the whole log.
    #[test]
    fn cursor__less_or_equal_before_first_record_starts_at_beginning() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), no_rotation_options());
        append_all(&log, 10..=20);

        let mut cursor = log
            .cursor_from(Some(&3), M::LessThanOrEqualToKey, P::AfterMatchingKey)
            .unwrap();
        assert_eq!(collect_keys(&mut cursor), (10..=20).collect::<Vec<_>>());
    }

    /// # Scenario
    /// A missing key with EqualToKey gives a permanently empty cursor.
    ///
    /// # Starting environment
    /// Log holding keys 1..=5.
    ///
    /// # Actions
    /// 1. Open a cursor at key 42.
    /// 2. Append keys 42 and 43, then call `next()`.
    ///
    /// # Expected behavior
    /// The cursor never returns a record, even after 42 is appended.
    #[test]
    fn cursor__equal_to_missing_key_is_permanently_empty() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), no_rotation_options());
        append_all(&log, 1..=5);

        let mut cursor = log.cursor_at(&42).unwrap();
        append_all(&log, [42, 43]);

        assert!(!cursor.next().unwrap());
        assert!(cursor.record().is_none());
    }

    /// # Scenario
    /// A cursor positioned at the end returns records appended later.
    ///
    /// # Starting environment
    /// Log holding keys 1..=5.
    ///
    /// # Actions
    /// 1. Open a cursor at key 100 with GreaterThanOrEqualToKey.
    /// 2. Append 100 and 101.
    ///
    /// # Expected behavior
    /// `next()` returns false first, then 100 and 101 once appended.
    #[test]
    fn cursor__greater_or_equal_past_end_sees_later_appends() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), no_rotation_options());
        append_all(&log, 1..=5);

        let mut cursor = log
            .cursor_from(Some(&100), M::GreaterThanOrEqualToKey, P::OnMatchingKey)
            .unwrap();
        assert!(!cursor.next().unwrap());

        append_all(&log, [100, 101]);
        assert_eq!(collect_keys(&mut cursor), vec![100, 101]);
    }

    /// # Scenario
    /// An exhausted cursor resumes when new records are appended.
    ///
    /// # Starting environment
    /// Log holding keys 1..=3, cursor read to the end.
    ///
    /// # Actions
    /// 1. Append 4 and 5 and keep reading.
    ///
    /// # Expected behavior
    /// The cursor returns 4 and 5.
    #[test]
    fn cursor__exhausted_cursor_resumes_after_append() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), no_rotation_options());
        append_all(&log, 1..=3);
        let mut cursor = log.cursor().unwrap();
        assert_eq!(collect_keys(&mut cursor), vec![1, 2, 3]);

        append_all(&log, [4, 5]);
        assert_eq!(collect_keys(&mut cursor), vec![4, 5]);
    }

    /// # Scenario
    /// `position_to` moves an existing cursor anywhere, including back to
    /// the start.
    ///
    /// # Starting environment
    /// Log holding keys 1..=50 over two files.
    ///
    /// # Actions
    /// 1. Read a few records, reposition to 40, then to `None`.
    ///
    /// # Expected behavior
    /// Each repositioning clears the current record and the next `next()`
    /// yields the targeted record.
    #[test]
    fn cursor__position_to_moves_existing_cursor() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), no_rotation_options());
        append_all(&log, 1..=25);
        log.rotate_if_not_empty().unwrap();
        append_all(&log, 26..=50);

        let mut cursor = log.cursor().unwrap();
        assert!(cursor.next().unwrap());
        assert!(cursor.next().unwrap());

        assert!(cursor.position_to(Some(&40), M::EqualToKey, P::OnMatchingKey).unwrap());
        assert!(cursor.record().is_none());
        assert!(cursor.next().unwrap());
        assert_eq!(*cursor.record().unwrap().key(), 40);

        assert!(cursor.position_to(None, M::EqualToKey, P::OnMatchingKey).unwrap());
        assert_eq!(collect_keys(&mut cursor), (1..=50).collect::<Vec<_>>());
    }

    /// # Scenario
    /// Closing a cursor stops it and unregisters it from the log.
    ///
    /// # Starting environment
    /// Log holding keys 1..=3.
    ///
    /// # Actions
    /// 1. Open a cursor, close it, call `next()`.
    ///
    /// # Expected behavior
    /// `next()` returns false, and closing the log afterwards reports no
    /// open cursor.
    #[test]
    fn cursor__close_stops_cursor() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), no_rotation_options());
        append_all(&log, 1..=3);

        let mut cursor = log.cursor().unwrap();
        cursor.close();
        assert!(!cursor.next().unwrap());
        log.close().unwrap();
    }

    /// # Scenario
    /// Cursors on a closed log are empty.
    ///
    /// # Starting environment
    /// Log holding keys 1..=3 with one cursor open, then closed.
    ///
    /// # Actions
    /// 1. Drop the last log handle while the cursor is open.
    /// 2. Call `next()` on the cursor.
    ///
    /// # Expected behavior
    /// The cursor returns false instead of reading a closed log.
    #[test]
    fn cursor__log_close_closes_open_cursors() {
        let tmp = TempDir::new().unwrap();
        let log = open_log(tmp.path(), no_rotation_options());
        append_all(&log, 1..=3);
        let mut cursor = log.cursor().unwrap();

        drop(log);
        assert!(!cursor.next().unwrap());
    }
}
