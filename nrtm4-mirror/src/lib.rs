//! An NRTM4 mirror client
//!
//! Keeps local replicas of remote routing registry sources current by
//! bootstrapping them from a snapshot and then applying deltas, as announced by
//! the source's update notification file.

pub mod client;
pub mod clock;
pub mod config;
pub mod delta;
pub mod error;
pub mod fetch;
pub mod jsonseq;
pub mod metrics;
pub mod model;
pub mod pool;
pub mod protocol;
pub mod rpsl;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod updater;
pub mod validate;

#[cfg(test)]
mod test_utils;

pub use self::{
    error::{ErrorKind, SyncError},
    store::{Repository, ReplicaStore},
    sync::{Processor, SyncOutcome, SyncState},
    updater::AutoUpdater,
};

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::{Duration, UNIX_EPOCH},
    };

    use data_encoding::BASE64URL_NOPAD;
    use serde_json::json;
    use testresult::TestResult;
    use tracing_test::traced_test;

    use crate::{
        config::{FailurePolicy, UpdaterConfig},
        error::{ErrorKind, SyncError},
        fetch::FetchError,
        jsonseq::RecordError,
        model::SourceId,
        snapshot::SnapshotProgress,
        store::Repository,
        sync::SyncState,
        test_utils::*,
        updater::AutoUpdater,
        validate::{DeltaSequenceError, HeaderError},
    };

    const ROUTE_KEY: &str = "192.0.2.0/24AS65530";

    #[tokio::test]
    #[traced_test]
    async fn cold_start_bootstraps_from_snapshot() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(3, &[ROUTE, PERSON, MNTNER]);
        remote.publish_notification(3);
        let processor = processor(&remote, &dir)?;

        let outcome = processor.sync(&Remote::url(), "").await?;
        assert_eq!(outcome.state, SyncState::NoLocalState);
        assert_eq!(outcome.previous_version, None);
        assert_eq!(outcome.source.name, SOURCE);
        assert_eq!(outcome.source.session_id, SESSION);
        assert_eq!(outcome.source.version, 3);

        let repo = processor.repository();
        let sources = repo.get_sources()?;
        assert_eq!(sources, vec![outcome.source.clone()]);
        let objects = repo.get_current_objects(outcome.source.id)?;
        assert_eq!(objects.len(), 3);
        assert!(
            objects
                .iter()
                .all(|row| row.from_version == 3 && row.to_version == 0)
        );
        let mut keys: Vec<_> = objects.iter().map(|row| row.primary_key.as_str()).collect();
        keys.sort();
        assert_eq!(keys, [ROUTE_KEY, "EXAMPLE-MNT", "JD1-EXAMPLE"]);

        let history = repo.get_notification_history(outcome.source.id, 0, u64::MAX)?;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, 3);
        assert_eq!(processor.metrics().bootstraps.get(), 1);
        assert_eq!(processor.metrics().snapshot_objects.get(), 3);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn up_to_date_replica_is_left_alone() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(3, &[ROUTE]);
        remote.publish_notification(3);
        let processor = processor(&remote, &dir)?;

        processor.sync(&Remote::url(), "").await?;
        let outcome = processor.sync(&Remote::url(), "").await?;
        assert_eq!(outcome.state, SyncState::UpToDate);
        assert_eq!(outcome.previous_version, Some(3));
        assert_eq!(outcome.source.version, 3);
        assert_eq!(remote.client.requests("update-notification-file.json"), 2);
        assert_eq!(remote.client.requests("snapshot-3.jsonseq"), 1);
        assert_eq!(processor.metrics().sync_noop.get(), 1);
        assert_eq!(processor.metrics().sync_success.get(), 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn hash_mismatch_creates_no_source() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        let snapshot = remote.publish_snapshot(3, &[ROUTE]);
        remote.publish_notification(3);
        // the served file no longer matches the published hash
        remote.client.serve(
            Remote::url().join(&snapshot.url)?.as_str(),
            remote.snapshot_body(3, &[ROUTE, PERSON]),
        );
        let processor = processor(&remote, &dir)?;

        let res = processor.sync(&Remote::url(), "").await;
        let err = res.expect_err("expected hash mismatch");
        assert!(matches!(
            err,
            SyncError::Fetch {
                source: FetchError::HashMismatch { .. },
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(processor.repository().get_sources()?.is_empty());
        assert_eq!(processor.metrics().sync_failures.get(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn interrupted_snapshot_leaves_nothing_behind() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        let mut body = json_seq(&[
            remote.header("snapshot", 3),
            json!({ "object": ROUTE }),
            json!({ "object": PERSON }),
        ]);
        body.extend_from_slice(b"\x1e\n");
        body.extend(json_seq(&[json!({ "object": MNTNER })]));
        remote.publish_snapshot_body("snapshot-3.jsonseq", 3, body);
        remote.publish_notification(3);
        let processor = processor(&remote, &dir)?;

        let res = processor.sync(&Remote::url(), "").await;
        let err = res.expect_err("expected a record error");
        assert!(matches!(
            err,
            SyncError::Records {
                source: RecordError::EmptyPayload { index: 3, .. },
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        let repo = processor.repository();
        assert!(repo.get_sources()?.is_empty());
        // the id reserved for the bootstrap
        assert!(repo.get_current_objects(SourceId(1))?.is_empty());

        // a fixed snapshot is picked up by the next attempt
        remote.publish_snapshot(3, &[ROUTE, PERSON, MNTNER]);
        remote.publish_notification(3);
        let outcome = processor.sync(&Remote::url(), "").await?;
        assert_eq!(outcome.source.version, 3);
        assert_eq!(repo.get_current_objects(outcome.source.id)?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unparseable_snapshot_objects_are_skipped() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(2, &[ROUTE, "route: 198.51.100.0/24\nsource: EXAMPLE", PERSON]);
        remote.publish_notification(2);
        let processor = processor(&remote, &dir)?;

        let outcome = processor.sync(&Remote::url(), "").await?;
        let objects = processor
            .repository()
            .get_current_objects(outcome.source.id)?;
        assert_eq!(objects.len(), 2);
        assert_eq!(processor.metrics().snapshot_parse_failures.get(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn gzip_snapshot_is_decompressed() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_gzip_snapshot(2, &[ROUTE, PERSON]);
        remote.publish_notification(2);
        let processor = processor(&remote, &dir)?;

        let outcome = processor.sync(&Remote::url(), "").await?;
        assert_eq!(outcome.source.version, 2);
        let objects = processor
            .repository()
            .get_current_objects(outcome.source.id)?;
        assert_eq!(objects.len(), 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn signed_notification_is_accepted() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(1, &[ROUTE]);
        let payload = BASE64URL_NOPAD.encode(remote.notification(1).to_string().as_bytes());
        let jws = format!("eyJhbGciOiJFUzI1NiJ9.{payload}.c2lnbmF0dXJl");
        remote.client.serve(NOTIFICATION_URL, jws.into_bytes());
        let processor = processor(&remote, &dir)?;

        let outcome = processor.sync(&Remote::url(), "").await?;
        assert_eq!(outcome.source.version, 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn invalid_notification_fetches_nothing() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(1, &[ROUTE]);
        let mut notification = remote.notification(0);
        notification["session_id"] = json!("short");
        remote
            .client
            .serve(NOTIFICATION_URL, notification.to_string().into_bytes());
        let processor = processor(&remote, &dir)?;

        let err = processor
            .sync(&Remote::url(), "")
            .await
            .expect_err("expected validation failures");
        match err {
            SyncError::InvalidNotification { failures, .. } => assert_eq!(failures.len(), 2),
            err => panic!("unexpected error {err:?}"),
        }
        assert_eq!(remote.client.requests("snapshot-1.jsonseq"), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn deltas_are_applied_in_order() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(1, &[ROUTE, MNTNER]);
        remote.publish_notification(1);
        let processor = processor(&remote, &dir)?;
        let first = processor.sync(&Remote::url(), "").await?;

        remote.publish_delta(2, vec![add_modify(PERSON)]);
        remote.publish_delta(3, vec![delete("mntner", "example-mnt")]);
        remote.publish_notification(3);
        let outcome = processor.sync(&Remote::url(), "").await?;
        assert_eq!(outcome.state, SyncState::StaleNeedsDelta);
        assert_eq!(outcome.previous_version, Some(1));
        assert_eq!(outcome.source.id, first.source.id);
        assert_eq!(outcome.source.version, 3);

        let repo = processor.repository();
        let mut current: Vec<_> = repo
            .get_current_objects(outcome.source.id)?
            .into_iter()
            .map(|row| (row.object_type, row.from_version))
            .collect();
        current.sort();
        assert_eq!(
            current,
            [("person".to_string(), 2), ("route".to_string(), 1)]
        );
        let mntner = repo.get_object_history(outcome.source.id, "mntner", "EXAMPLE-MNT")?;
        assert_eq!(mntner.len(), 1);
        assert_eq!((mntner[0].from_version, mntner[0].to_version), (1, 3));

        let history = repo.get_notification_history(outcome.source.id, 0, u64::MAX)?;
        let versions: Vec<_> = history.iter().map(|record| record.version).collect();
        assert_eq!(versions, [1, 2, 3]);
        assert_eq!(processor.metrics().delta_files.get(), 2);
        assert_eq!(remote.client.requests("snapshot-1.jsonseq"), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn delete_then_add_in_one_file() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(1, &[ROUTE, MNTNER]);
        remote.publish_notification(1);
        let processor = processor(&remote, &dir)?;
        processor.sync(&Remote::url(), "").await?;

        let updated = format!("{ROUTE}\ndescr: moved");
        remote.publish_delta(2, vec![delete("route", ROUTE_KEY), add_modify(&updated)]);
        remote.publish_notification(2);
        let outcome = processor.sync(&Remote::url(), "").await?;
        assert_eq!(outcome.source.version, 2);

        let repo = processor.repository();
        let history = repo.get_object_history(outcome.source.id, "route", ROUTE_KEY)?;
        assert_eq!(history.len(), 2);
        assert_eq!((history[0].from_version, history[0].to_version), (1, 2));
        assert_eq!((history[1].from_version, history[1].to_version), (2, 0));
        let current: Vec<_> = repo
            .get_current_objects(outcome.source.id)?
            .into_iter()
            .filter(|row| row.object_type == "route")
            .collect();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].payload, updated);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn delete_of_unknown_object_is_not_fatal() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(1, &[ROUTE]);
        remote.publish_notification(1);
        let processor = processor(&remote, &dir)?;
        processor.sync(&Remote::url(), "").await?;

        remote.publish_delta(2, vec![delete("person", "NOBODY-EXAMPLE")]);
        remote.publish_notification(2);
        let outcome = processor.sync(&Remote::url(), "").await?;
        assert_eq!(outcome.source.version, 2);
        assert_eq!(processor.metrics().delta_delete_missing.get(), 1);
        assert!(logs_contain("not in the replica"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn broken_delta_sequence_changes_nothing() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(1, &[ROUTE]);
        remote.publish_notification(1);
        let processor = processor(&remote, &dir)?;
        processor.sync(&Remote::url(), "").await?;

        remote.publish_delta(2, vec![add_modify(PERSON)]);
        remote.publish_delta(4, vec![add_modify(MNTNER)]);
        remote.publish_notification(4);
        let res = processor.sync(&Remote::url(), "").await;
        let err = res.expect_err("expected a broken sequence");
        assert!(matches!(
            err,
            SyncError::DeltaSequence {
                source: DeltaSequenceError::DeltaSequenceBroken {
                    expected: 3,
                    found: 4,
                    ..
                },
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        let sources = processor.repository().get_sources()?;
        assert_eq!(sources[0].version, 1);
        assert_eq!(remote.client.requests("delta-2.jsonseq"), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn version_is_bumped_before_records() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(1, &[ROUTE]);
        remote.publish_notification(1);
        let processor = processor(&remote, &dir)?;
        processor.sync(&Remote::url(), "").await?;

        remote.publish_delta(
            2,
            vec![add_modify(PERSON), add_modify("mntner: BROKEN-MNT")],
        );
        remote.publish_notification(2);
        let res = processor.sync(&Remote::url(), "").await;
        let err = res.expect_err("expected an invalid object");
        assert!(matches!(err, SyncError::InvalidDeltaObject { .. }));
        assert_eq!(err.kind(), ErrorKind::Integrity);
        let sources = processor.repository().get_sources()?;
        assert_eq!(sources[0].version, 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn session_reset_bootstraps_again() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(5, &[ROUTE, MNTNER]);
        remote.publish_notification(5);
        let processor = processor(&remote, &dir)?;
        let old = processor.sync(&Remote::url(), "").await?.source;

        remote.reset_session(OTHER_SESSION);
        remote.publish_snapshot(2, &[PERSON]);
        remote.publish_notification(2);
        let outcome = processor.sync(&Remote::url(), "").await?;
        assert_eq!(outcome.state, SyncState::StaleNeedsBootstrap);
        assert_ne!(outcome.source.id, old.id);
        assert_eq!(outcome.source.session_id, OTHER_SESSION);
        assert_eq!(outcome.source.version, 2);

        let repo = processor.repository();
        assert_eq!(repo.get_sources()?, vec![outcome.source.clone()]);
        assert!(repo.get_current_objects(old.id)?.is_empty());
        let objects = repo.get_current_objects(outcome.source.id)?;
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].object_type, "person");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn operator_commands() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(1, &[ROUTE]);
        remote.publish_notification(1);
        let processor = processor(&remote, &dir)?;

        let first = processor.connect(&Remote::url(), "").await?;
        let res = processor.connect(&Remote::url(), "").await;
        assert!(matches!(res, Err(SyncError::SourceExists { .. })));
        let res = processor.connect(&Remote::url(), "not valid").await;
        assert!(matches!(res, Err(SyncError::InvalidLabel { .. })));
        let second = processor.connect(&Remote::url(), "backup").await?;
        assert_ne!(first.id, second.id);
        // the verified snapshot is reused for the second replica
        assert_eq!(remote.client.requests("snapshot-1.jsonseq"), 1);

        let res = processor.update(SOURCE, "missing").await;
        let err = res.expect_err("expected an unknown source");
        assert!(matches!(err, SyncError::SourceNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::Operator);

        let res = processor.replace_label(SOURCE, "backup", "").await;
        assert!(matches!(res, Err(SyncError::SourceExists { .. })));
        let renamed = processor.replace_label(SOURCE, "backup", "old").await?;
        assert_eq!(renamed.id, second.id);
        assert_eq!(renamed.label, "old");
        assert_eq!(renamed.version, 1);

        let summaries = processor.list_sources().await?;
        assert_eq!(summaries.len(), 2);
        let expected = UNIX_EPOCH + Duration::from_millis(1_700_000_000_000);
        assert!(
            summaries
                .iter()
                .all(|summary| summary.last_notification == Some(expected))
        );

        processor.remove_source(SOURCE, "old").await?;
        let res = processor.remove_source(SOURCE, "old").await;
        assert!(matches!(res, Err(SyncError::SourceNotFound { .. })));
        let sources = processor.repository().get_sources()?;
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].id, first.id);
        assert!(
            processor
                .repository()
                .get_current_objects(second.id)?
                .is_empty()
        );

        let outcome = processor.update(SOURCE, "").await?;
        assert_eq!(outcome.state, SyncState::UpToDate);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn snapshot_version_mismatch_creates_no_source() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        let body = remote.snapshot_body(4, &[ROUTE]);
        remote.publish_snapshot_body("snapshot-3.jsonseq", 3, body);
        remote.publish_notification(3);
        let processor = processor(&remote, &dir)?;

        let res = processor.sync(&Remote::url(), "").await;
        let err = res.expect_err("expected a header mismatch");
        assert!(matches!(
            err,
            SyncError::Header {
                source: HeaderError::FileVersionMismatch {
                    expected: 3,
                    found: 4,
                    ..
                },
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        let repo = processor.repository();
        assert!(repo.get_sources()?.is_empty());
        assert!(repo.get_current_objects(SourceId(1))?.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_delta_action_is_rejected() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(1, &[ROUTE]);
        remote.publish_notification(1);
        let processor = processor(&remote, &dir)?;
        let source = processor.sync(&Remote::url(), "").await?.source;

        remote.publish_delta(2, vec![json!({ "action": "upsert", "object": PERSON })]);
        remote.publish_notification(2);
        let res = processor.sync(&Remote::url(), "").await;
        let err = res.expect_err("expected an unknown action");
        match &err {
            SyncError::UnknownDeltaAction { action, .. } => assert_eq!(action, "upsert"),
            err => panic!("unexpected error {err:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::Protocol);
        // the header was valid, so the version is already bumped
        assert_eq!(processor.repository().get_sources()?[0].version, 2);
        let objects = processor.repository().get_current_objects(source.id)?;
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].object_type, "route");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn delta_header_mismatches_change_nothing() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(1, &[ROUTE]);
        remote.publish_notification(1);
        let processor = processor(&remote, &dir)?;
        let source = processor.sync(&Remote::url(), "").await?.source;

        let mut wrong_session = remote.header("delta", 2);
        wrong_session["session_id"] = json!(OTHER_SESSION);
        let mut wrong_source = remote.header("delta", 2);
        wrong_source["source"] = json!("OTHER");
        let wrong_version = remote.header("delta", 5);
        for (name, header) in [
            ("session.jsonseq", wrong_session),
            ("source.jsonseq", wrong_source),
            ("version.jsonseq", wrong_version),
        ] {
            remote.drop_deltas(&[2]);
            remote.publish_delta_file(name, 2, header, vec![add_modify(PERSON)]);
            remote.publish_notification(2);
            let res = processor.sync(&Remote::url(), "").await;
            let err = res.expect_err("expected a header mismatch");
            let SyncError::Header { source: header_err, .. } = &err else {
                panic!("unexpected error for {name}: {err:?}");
            };
            match name {
                "session.jsonseq" => {
                    assert!(matches!(header_err, HeaderError::SessionMismatch { .. }))
                }
                "source.jsonseq" => {
                    assert!(matches!(header_err, HeaderError::SourceMismatch { .. }))
                }
                _ => assert!(matches!(
                    header_err,
                    HeaderError::FileVersionMismatch {
                        expected: 2,
                        found: 5,
                        ..
                    }
                )),
            }
            assert_eq!(err.kind(), ErrorKind::Protocol);
            assert_eq!(processor.repository().get_sources()?, vec![source.clone()]);
        }
        assert_eq!(processor.repository().get_current_objects(source.id)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn progress_observer_sees_final_counts() -> TestResult {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(2, &[ROUTE, PERSON, "not rpsl", MNTNER]);
        remote.publish_notification(2);
        let observer = Arc::new(RecordProgress::default());
        let processor = processor_with(&remote, &dir, snapshot_config(Duration::from_millis(10)))?
            .with_progress_observer(observer.clone());

        processor.sync(&Remote::url(), "").await?;
        let reports = observer.reports.lock();
        let (source, last) = reports.last().cloned().expect("at least the final report");
        assert_eq!(source, SOURCE);
        assert_eq!(
            last,
            SnapshotProgress {
                parsed: 3,
                failed: 1,
                stored: 3,
            }
        );
        assert!(reports.iter().all(|(_, p)| p.stored <= last.stored));
        Ok(())
    }

    async fn stale_replica(
        on_failure: FailurePolicy,
    ) -> TestResult<(tempfile::TempDir, Remote, AutoUpdater, crate::Processor)> {
        let dir = tempfile::tempdir()?;
        let mut remote = Remote::new();
        remote.publish_snapshot(1, &[ROUTE]);
        remote.publish_notification(1);
        let processor = processor(&remote, &dir)?;
        processor.sync(&Remote::url(), "").await?;

        // delta 2 has aged out by the time the replica is updated
        remote.publish_delta(2, vec![add_modify(PERSON)]);
        remote.publish_delta(3, vec![add_modify(MNTNER)]);
        remote.drop_deltas(&[2]);
        remote.publish_snapshot(3, &[ROUTE, PERSON, MNTNER]);
        remote.publish_notification(3);

        let config = UpdaterConfig {
            on_failure,
            ..Default::default()
        };
        let updater = AutoUpdater::new(processor.clone(), config);
        Ok((dir, remote, updater, processor))
    }

    #[tokio::test]
    #[traced_test]
    async fn updater_retries_by_default() -> TestResult {
        let (_dir, _remote, updater, processor) = stale_replica(FailurePolicy::Retry).await?;
        let source = processor.repository().get_sources()?.remove(0);

        let res = updater.update_source(&source).await;
        let err = res.expect_err("expected a missing delta");
        assert!(matches!(
            err,
            SyncError::DeltaSequence {
                source: DeltaSequenceError::NextDeltaUnavailable { local: 1, first: 3, .. },
                ..
            }
        ));
        assert_eq!(processor.repository().get_sources()?, vec![source]);
        assert_eq!(processor.metrics().updater_recoveries.get(), 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn updater_replaces_failed_replica() -> TestResult {
        let (_dir, _remote, updater, processor) = stale_replica(FailurePolicy::Replace).await?;
        let source = processor.repository().get_sources()?.remove(0);

        assert!(updater.update_source(&source).await.is_err());
        let sources = processor.repository().get_sources()?;
        assert_eq!(sources.len(), 1);
        assert_ne!(sources[0].id, source.id);
        assert_eq!(sources[0].label, "");
        assert_eq!(sources[0].version, 3);
        assert_eq!(processor.metrics().updater_recoveries.get(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn updater_preserves_failed_replica() -> TestResult {
        let (_dir, _remote, updater, processor) = stale_replica(FailurePolicy::Preserve).await?;
        let source = processor.repository().get_sources()?.remove(0);

        assert!(updater.update_source(&source).await.is_err());
        let mut sources = processor.repository().get_sources()?;
        sources.sort_by(|a, b| a.label.cmp(&b.label));
        let labels: Vec<_> = sources.iter().map(|s| (s.label.as_str(), s.version)).collect();
        assert_eq!(labels, [("", 3), ("auto-1", 1)]);
        assert_eq!(sources[1].id, source.id);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_replace_keeps_old_replica() -> TestResult {
        let (_dir, mut remote, updater, processor) = stale_replica(FailurePolicy::Replace).await?;
        remote.announce_missing_snapshot(3);
        remote.publish_notification(3);
        let source = processor.repository().get_sources()?.remove(0);

        assert!(updater.update_source(&source).await.is_err());
        assert_eq!(remote.client.requests("missing-snapshot-3.jsonseq"), 1);
        assert_eq!(processor.repository().get_sources()?, vec![source.clone()]);
        assert_eq!(processor.repository().get_current_objects(source.id)?.len(), 1);
        assert_eq!(processor.metrics().updater_recoveries.get(), 0);
        assert!(logs_contain("failed to recover source"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_preserve_restores_label() -> TestResult {
        let (_dir, mut remote, updater, processor) = stale_replica(FailurePolicy::Preserve).await?;
        remote.announce_missing_snapshot(3);
        remote.publish_notification(3);
        let source = processor.repository().get_sources()?.remove(0);

        assert!(updater.update_source(&source).await.is_err());
        assert_eq!(processor.repository().get_sources()?, vec![source.clone()]);
        assert_eq!(processor.repository().get_current_objects(source.id)?.len(), 1);
        assert_eq!(processor.metrics().updater_recoveries.get(), 0);
        Ok(())
    }
}
