//! Changelog directory layout tests.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use std::fs;

    use crate::error::ChangelogError;
    use crate::file::ReplicationEnvironment;
    use crate::file::tests::helpers::*;
    use tempfile::TempDir;

    /// # Scenario
    /// Replica logs are laid out per domain and found again on reopen.
    ///
    /// # Starting environment
    /// Empty root.
    ///
    /// # Actions
    /// 1. Open replicas 1 and 2 of `dc=a` and replica 3 of `dc=b`.
    /// 2. Reopen the environment.
    ///
    /// # Expected behavior
    /// `domains.state` lists both domains, each replica has its
    /// directory, and the reopened state knows every replica.
    #[test]
    fn environment__layout_and_reload() {
        let tmp = TempDir::new().unwrap();
        {
            let env = open_env(tmp.path());
            let _a1 = plain_replica_db(&env, &dn("dc=a"), 1);
            let _a2 = plain_replica_db(&env, &dn("dc=a"), 2);
            let _b3 = plain_replica_db(&env, &dn("dc=b"), 3);
        }

        let domains = fs::read_to_string(tmp.path().join("domains.state")).unwrap();
        assert_eq!(domains, "1:dc=a\n2:dc=b\n");
        assert!(tmp.path().join("1.dom/1.server/head.log").is_file());
        assert!(tmp.path().join("1.dom/2.server/head.log").is_file());
        assert!(tmp.path().join("2.dom/3.server/head.log").is_file());

        let env = open_env(tmp.path());
        let state = env.changelog_state().unwrap();
        assert_eq!(state.domains().cloned().collect::<Vec<_>>(), vec![dn("dc=a"), dn("dc=b")]);
        assert_eq!(state.replica_ids(&dn("dc=a")).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(state.replica_ids(&dn("dc=b")).collect::<Vec<_>>(), vec![3]);
        assert!(state.offline_replicas().is_empty());
    }

    /// # Scenario
    /// Offline state is persisted and removed when the replica is back.
    ///
    /// # Starting environment
    /// Replica 1 of `dc=a`.
    ///
    /// # Actions
    /// 1. Notify offline at t=5 and reopen.
    /// 2. Notify online and reopen.
    ///
    /// # Expected behavior
    /// `offline.state` holds the CSN and is reloaded, then disappears.
    #[test]
    fn environment__offline_state() {
        let tmp = TempDir::new().unwrap();
        let base_dn = dn("dc=a");
        {
            let env = open_env(tmp.path());
            let _db = plain_replica_db(&env, &base_dn, 1);
            env.notify_replica_offline(&base_dn, csn(5, 1)).unwrap();
        }
        let offline_file = tmp.path().join("1.dom/1.server/offline.state");
        assert_eq!(fs::read_to_string(&offline_file).unwrap(), csn(5, 1).to_string());

        {
            let env = open_env(tmp.path());
            let state = env.changelog_state().unwrap();
            assert_eq!(state.offline_replicas().get_csn(&base_dn, 1), Some(csn(5, 1)));

            assert!(env.notify_replica_online(&base_dn, 1).unwrap());
            assert!(!env.notify_replica_online(&base_dn, 1).unwrap());
        }
        assert!(!offline_file.exists());

        let env = open_env(tmp.path());
        assert!(env.changelog_state().unwrap().offline_replicas().is_empty());
    }

    /// # Scenario
    /// Only the latest generation id file is kept.
    ///
    /// # Starting environment
    /// Empty root.
    ///
    /// # Actions
    /// 1. Set generation 42, then 43, on `dc=a`.
    /// 2. Reopen.
    ///
    /// # Expected behavior
    /// Only `generation43.id` exists and the reopened state reports 43.
    #[test]
    fn environment__generation_id() {
        let tmp = TempDir::new().unwrap();
        {
            let env = open_env(tmp.path());
            assert_eq!(env.set_generation_id(&dn("dc=a"), 42).unwrap(), None);
            assert_eq!(env.set_generation_id(&dn("dc=a"), 43).unwrap(), Some(42));
            assert_eq!(env.set_generation_id(&dn("dc=a"), 43).unwrap(), Some(43));
        }
        let domain_dir = tmp.path().join("1.dom");
        assert!(!domain_dir.join("generation42.id").exists());
        assert!(domain_dir.join("generation43.id").is_file());

        let env = open_env(tmp.path());
        assert_eq!(env.changelog_state().unwrap().generation_id(&dn("dc=a")), Some(43));
    }

    /// # Scenario
    /// Removing a domain deletes its directory but not its id.
    ///
    /// # Starting environment
    /// Replicas in `dc=a` and `dc=b`.
    ///
    /// # Actions
    /// 1. Remove `dc=a`.
    /// 2. Open replica 1 of `dc=a` again, then a replica of `dc=c`.
    ///
    /// # Expected behavior
    /// `1.dom` is deleted then recreated under the same id, and `dc=c`
    /// gets id 3.
    #[test]
    fn environment__remove_domain_keeps_id_reserved() {
        let tmp = TempDir::new().unwrap();
        let env = open_env(tmp.path());
        drop(plain_replica_db(&env, &dn("dc=a"), 1));
        drop(plain_replica_db(&env, &dn("dc=b"), 2));

        env.remove_domain(&dn("dc=a")).unwrap();
        assert!(!tmp.path().join("1.dom").exists());
        let state = env.changelog_state().unwrap();
        assert_eq!(state.domains().cloned().collect::<Vec<_>>(), vec![dn("dc=b")]);

        drop(plain_replica_db(&env, &dn("dc=a"), 1));
        drop(plain_replica_db(&env, &dn("dc=c"), 4));
        assert!(tmp.path().join("1.dom/1.server").is_dir());
        assert!(tmp.path().join("3.dom/4.server").is_dir());
        let domains = fs::read_to_string(tmp.path().join("domains.state")).unwrap();
        assert_eq!(domains, "1:dc=a\n2:dc=b\n3:dc=c\n");
    }

    /// # Scenario
    /// A damaged `domains.state` is reported, not ignored.
    ///
    /// # Starting environment
    /// Root whose `domains.state` holds a line without an id.
    ///
    /// # Actions
    /// 1. Open the environment.
    ///
    /// # Expected behavior
    /// Fails with `Corrupted`.
    #[test]
    fn environment__corrupted_domains_state() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("domains.state"), "1:dc=a\nnot a domain line\n").unwrap();

        let result = ReplicationEnvironment::open(tmp.path());
        assert!(matches!(result, Err(ChangelogError::Corrupted { offset: 7, .. })));
    }
}
