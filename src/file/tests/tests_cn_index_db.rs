//! Change-number index database tests.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::sync::Arc;

    use crate::error::ChangelogError;
    use crate::file::tests::helpers::*;
    use crate::log::{LogCursor, RepositionableCursor};
    use crate::replication::ChangeNumberIndexRecord;
    use tempfile::TempDir;

    fn change_numbers(cursor: &mut LogCursor<u64, ChangeNumberIndexRecord>) -> Vec<u64> {
        let mut out = Vec::new();
        while cursor.next().unwrap() {
            let record = cursor.record().unwrap();
            assert_eq!(*record.key(), record.value().change_number);
            out.push(*record.key());
        }
        out
    }

    /// # Scenario
    /// Change numbers are dense, start at 1 and survive a restart.
    ///
    /// # Starting environment
    /// Empty changelog directory.
    ///
    /// # Actions
    /// 1. Add three records, drop the db.
    /// 2. Reopen and add one more.
    ///
    /// # Expected behavior
    /// Numbers 1, 2, 3 then 4, and the newest record carries the last CSN.
    #[test]
    fn cn_index__numbering_survives_restart() {
        let tmp = TempDir::new().unwrap();
        let env = open_env(tmp.path());
        {
            let db = open_cn_index_db(&env, Arc::new(RecordingRegistrar::default()));
            assert_eq!(db.add_record(&dn("dc=a"), csn(1, 1)).unwrap(), 1);
            assert_eq!(db.add_record(&dn("dc=b"), csn(2, 2)).unwrap(), 2);
            assert_eq!(db.add_record(&dn("dc=a"), csn(3, 1)).unwrap(), 3);
        }

        let db = open_cn_index_db(&env, Arc::new(RecordingRegistrar::default()));
        assert_eq!(db.oldest_change_number().unwrap(), Some(1));
        assert_eq!(db.newest_change_number().unwrap(), Some(3));
        assert_eq!(db.add_record(&dn("dc=b"), csn(4, 2)).unwrap(), 4);

        let newest = db.newest_record().unwrap().unwrap();
        assert_eq!(newest, ChangeNumberIndexRecord::new(4, dn("dc=b"), csn(4, 2)));
        assert_eq!(db.oldest_record().unwrap().unwrap().csn, csn(1, 1));
    }

    /// # Scenario
    /// Cursors start at the requested change number.
    ///
    /// # Starting environment
    /// Index holding 1..=5.
    ///
    /// # Actions
    /// 1. Cursor from 3.
    /// 2. Cursor from 9.
    ///
    /// # Expected behavior
    /// 3, 4, 5, then nothing until 6 is added.
    #[test]
    fn cn_index__cursor_from_change_number() {
        let tmp = TempDir::new().unwrap();
        let env = open_env(tmp.path());
        let db = open_cn_index_db(&env, Arc::new(RecordingRegistrar::default()));
        for t in 1..=5 {
            db.add_record(&dn("dc=a"), csn(t, 1)).unwrap();
        }

        let mut from_three = db.cursor_from(3).unwrap();
        assert_eq!(change_numbers(&mut from_three), vec![3, 4, 5]);

        let mut past_end = db.cursor_from(6).unwrap();
        assert!(!past_end.next().unwrap());
        db.add_record(&dn("dc=a"), csn(6, 1)).unwrap();
        assert_eq!(change_numbers(&mut past_end), vec![6]);
    }

    /// # Scenario
    /// Purge by CSN keeps the file holding the boundary entry.
    ///
    /// # Starting environment
    /// Files [1..=10], [11..=20], head [21..=25], change number `n`
    /// carrying CSN t=`n`.
    ///
    /// # Actions
    /// 1. `purge_up_to(t=15)`.
    /// 2. `purge_up_to(t=0)`.
    ///
    /// # Expected behavior
    /// Step 1 leaves 11 as the oldest change number, step 2 changes nothing.
    #[test]
    fn cn_index__purge_by_csn() {
        let tmp = TempDir::new().unwrap();
        let env = open_env(tmp.path());
        let db = open_cn_index_db(&env, Arc::new(RecordingRegistrar::default()));
        for t in 1..=25 {
            db.add_record(&dn("dc=a"), csn(t, 1)).unwrap();
            if t % 10 == 0 {
                db.log().rotate_if_not_empty().unwrap();
            }
        }

        assert_eq!(db.purge_up_to(&csn(15, 1)).unwrap(), Some(11));
        assert_eq!(db.number_of_records().unwrap(), 15);
        assert_eq!(db.purge_up_to(&csn(0, 1)).unwrap(), Some(11));
        assert_eq!(db.number_of_records().unwrap(), 15);

        let mut cursor = db.cursor_from(1).unwrap();
        assert_eq!(change_numbers(&mut cursor), (11..=25).collect::<Vec<_>>());
    }

    /// # Scenario
    /// Clear restarts numbering, shutdown rejects writes.
    ///
    /// # Starting environment
    /// Index holding 1..=3 with a recording registrar.
    ///
    /// # Actions
    /// 1. Check monitor data.
    /// 2. `clear()` and add a record.
    /// 3. `shutdown()` and add a record.
    ///
    /// # Expected behavior
    /// Monitor reports 1..3, numbering restarts at 1, and the final add
    /// fails with `ShuttingDown` after the monitor is withdrawn.
    #[test]
    fn cn_index__clear_and_shutdown() {
        let tmp = TempDir::new().unwrap();
        let env = open_env(tmp.path());
        let registrar = Arc::new(RecordingRegistrar::default());
        let db = open_cn_index_db(&env, registrar.clone());
        for t in 1..=3 {
            db.add_record(&dn("dc=a"), csn(t, 1)).unwrap();
        }

        let data = registrar.data("change-number-index-db");
        assert_eq!(data["first-change-number"], "1");
        assert_eq!(data["last-change-number"], "3");
        assert_eq!(data["record-count"], "3");

        db.clear().unwrap();
        assert!(db.is_empty().unwrap());
        assert_eq!(db.add_record(&dn("dc=a"), csn(9, 1)).unwrap(), 1);

        db.shutdown();
        assert!(registrar.names().is_empty());
        assert!(matches!(
            db.add_record(&dn("dc=a"), csn(10, 1)),
            Err(ChangelogError::ShuttingDown)
        ));
    }
}
