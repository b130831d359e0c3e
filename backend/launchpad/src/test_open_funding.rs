use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::events::EventKind;
use crate::fixtures::{
    contract_for, harness, harness_with, ready_patch, sample_commitment, seed_ready_draft,
    FakeLedger, CREATOR, TOKEN,
};
use crate::orchestrator::{ErrorClass, OpenFundingError, OpenFundingRequest};
use crate::params::ParamError;
use crate::readiness::Violation;
use crate::saga::OpeningStage;
use crate::types::{
    CorePatch, ExternalLink, ExternalLinkType, FundingPatch, Milestone, MilestonePlan,
    ProjectPatch, ProjectStatus, ReleaseModel,
};

fn funding_events(kinds: &[EventKind]) -> usize {
    kinds.iter().filter(|k| **k == EventKind::FundingOpened).count()
}

#[tokio::test]
async fn test_ready_draft_opens_end_to_end() {
    let h = harness().await;
    let draft = h.store.create(CREATOR).await.unwrap();

    // Edits and commitments arrive with the open request itself.
    let outcome = h
        .opener
        .open(
            &draft.id,
            CREATOR,
            OpenFundingRequest {
                patch: Some(ready_patch()),
                commitments: Some(vec![sample_commitment()]),
                expected_version: Some(1),
            },
        )
        .await
        .unwrap();

    assert!(!outcome.already_open);
    let project = outcome.project;
    assert_eq!(project.status(), ProjectStatus::Active);
    assert!(project.published_at.is_some());

    let onchain = project.onchain().unwrap();
    assert_eq!(onchain.contract_address, contract_for(1));
    assert_eq!(onchain.onchain_project_id, 1);
    assert_eq!(onchain.chain_id, 137);
    assert_eq!(onchain.accepted_token, TOKEN);
    assert_eq!(onchain.token_decimals, 6);
    assert!(onchain.snapshot.uri.starts_with("ipfs://"));

    let submitted = h.ledger.submissions();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].project_uri, onchain.snapshot.uri);
    assert_eq!(submitted[0].release_bps, vec![10_000]);
    assert_eq!(h.publisher.publish_count(), 1);

    let stored = h.publisher.get(&onchain.snapshot.content_id).unwrap();
    assert_eq!(stored["schema"], "launchpad.project.v1");
    assert_eq!(stored["title"], "X");

    let kinds: Vec<_> = h.store.events(&draft.id).await.unwrap().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Created,
            EventKind::Edited,
            EventKind::CommitmentsUpdated,
            EventKind::FundingOpened,
        ]
    );

    let saga = h.sagas.load(&draft.id).await.unwrap().unwrap();
    assert_eq!(saga.stage, OpeningStage::Committed);
}

#[tokio::test]
async fn test_opening_twice_returns_existing_result() {
    let h = harness().await;
    let draft = seed_ready_draft(&h.store).await;
    let first = h.opener.open(&draft.id, CREATOR, OpenFundingRequest::default()).await.unwrap();
    let again = h.opener.open(&draft.id, CREATOR, OpenFundingRequest::default()).await.unwrap();

    assert!(again.already_open);
    assert_eq!(again.project, first.project);
    assert_eq!(h.ledger.submit_count(), 1);

    let kinds: Vec<_> = h.store.events(&draft.id).await.unwrap().iter().map(|e| e.kind).collect();
    assert_eq!(funding_events(&kinds), 1);
}

#[tokio::test]
async fn test_stale_version_aborts_before_any_external_call() {
    let h = harness().await;
    let draft = seed_ready_draft(&h.store).await;
    assert_eq!(draft.version, 3);

    // Caller A saves first.
    let title = ProjectPatch {
        core: Some(CorePatch {
            title: Some(Some("A".into())),
            ..Default::default()
        }),
        ..Default::default()
    };
    h.store.update(&draft.id, CREATOR, &title, Some(3)).await.unwrap();
    let events_before = h.store.events(&draft.id).await.unwrap().len();

    // Caller B opens with the version it loaded.
    let err = h
        .opener
        .open(
            &draft.id,
            CREATOR,
            OpenFundingRequest {
                patch: Some(ProjectPatch {
                    core: Some(CorePatch {
                        title: Some(Some("B".into())),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                expected_version: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    match &err {
        OpenFundingError::Conflict(current) => {
            assert_eq!(current.version, 4);
            assert_eq!(current.content().core.title.as_deref(), Some("A"));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(err.class(), ErrorClass::Conflict);
    assert_eq!(h.store.events(&draft.id).await.unwrap().len(), events_before);
    assert_eq!(h.publisher.publish_count(), 0);
    assert_eq!(h.ledger.submit_count(), 0);

    let saga = h.sagas.load(&draft.id).await.unwrap().unwrap();
    assert_eq!(saga.stage, OpeningStage::Aborted);
}

#[tokio::test]
async fn test_expected_version_is_checked_without_edits() {
    let h = harness().await;
    let draft = seed_ready_draft(&h.store).await;
    let err = h
        .opener
        .open(
            &draft.id,
            CREATOR,
            OpenFundingRequest {
                expected_version: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OpenFundingError::Conflict(_)));
}

#[tokio::test]
async fn test_unready_draft_lists_violations_and_stays_draft() {
    let h = harness().await;
    let draft = h.store.create(CREATOR).await.unwrap();
    h.store.update(&draft.id, CREATOR, &ready_patch(), None).await.unwrap();

    let err = h
        .opener
        .open(&draft.id, CREATOR, OpenFundingRequest::default())
        .await
        .unwrap_err();
    match &err {
        OpenFundingError::NotReady(codes) => assert_eq!(codes, &vec![Violation::MissingCommitments]),
        other => panic!("expected readiness failure, got {other:?}"),
    }
    assert_eq!(err.class(), ErrorClass::Readiness);

    let record = h.store.read(&draft.id).await.unwrap().unwrap();
    assert!(record.is_draft());
    assert_eq!(h.publisher.publish_count(), 0);
}

#[tokio::test]
async fn test_milestone_mismatch_is_rejected_before_publish_or_ledger() {
    let h = harness().await;
    let draft = seed_ready_draft(&h.store).await;
    h.store
        .update_commitments(&draft.id, CREATOR, vec![sample_commitment(); 2], None)
        .await
        .unwrap();

    let milestone = ProjectPatch {
        funding: Some(FundingPatch {
            release_model: Some(Some(ReleaseModel::Milestone)),
            milestone_plan: Some(Some(MilestonePlan {
                initial_percent: 20,
                milestones: vec![
                    Milestone { name: "Beta".into(), percent: 40 },
                    Milestone { name: "Launch".into(), percent: 50 },
                ],
            })),
            ..Default::default()
        }),
        ..Default::default()
    };
    let err = h
        .opener
        .open(
            &draft.id,
            CREATOR,
            OpenFundingRequest {
                patch: Some(milestone),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    match &err {
        OpenFundingError::Params(ParamError::ScheduleMismatch { sum, .. }) => assert_eq!(*sum, 110),
        other => panic!("expected schedule mismatch, got {other:?}"),
    }
    assert_eq!(err.class(), ErrorClass::Input);
    assert_eq!(h.publisher.publish_count(), 0);
    assert_eq!(h.ledger.submit_count(), 0);
}

#[tokio::test]
async fn test_balanced_milestones_deploy_in_basis_points() {
    let h = harness().await;
    let draft = seed_ready_draft(&h.store).await;
    let commitments = vec![sample_commitment(); 2];
    let milestone = ProjectPatch {
        funding: Some(FundingPatch {
            release_model: Some(Some(ReleaseModel::Milestone)),
            milestone_plan: Some(Some(MilestonePlan {
                initial_percent: 20,
                milestones: vec![
                    Milestone { name: "Beta".into(), percent: 40 },
                    Milestone { name: "Launch".into(), percent: 40 },
                ],
            })),
            ..Default::default()
        }),
        ..Default::default()
    };
    h.opener
        .open(
            &draft.id,
            CREATOR,
            OpenFundingRequest {
                patch: Some(milestone),
                commitments: Some(commitments),
                expected_version: Some(3),
            },
        )
        .await
        .unwrap();
    assert_eq!(h.ledger.submissions()[0].release_bps, vec![2_000, 4_000, 4_000]);
}

#[tokio::test]
async fn test_invalid_publish_links_abort_without_ledger_call() {
    let h = harness().await;
    let draft = seed_ready_draft(&h.store).await;
    let links = ProjectPatch {
        external_links: Some(vec![
            ExternalLink {
                id: "1".into(),
                link_type: ExternalLinkType::Website,
                label: "Home".into(),
                url: "https://example.com".into(),
            },
            ExternalLink {
                id: "2".into(),
                link_type: ExternalLinkType::Docs,
                label: "Docs".into(),
                url: "https://EXAMPLE.com".into(),
            },
        ]),
        ..Default::default()
    };
    let err = h
        .opener
        .open(
            &draft.id,
            CREATOR,
            OpenFundingRequest {
                patch: Some(links),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_EXTERNAL_LINKS");
    assert_eq!(h.ledger.submit_count(), 0);
}

#[tokio::test]
async fn test_retry_reuses_published_snapshot() {
    let ledger = FakeLedger::default();
    ledger.fail_submits.store(1, Ordering::SeqCst);
    let h = harness_with(ledger).await;
    let draft = seed_ready_draft(&h.store).await;

    let err = h
        .opener
        .open(&draft.id, CREATOR, OpenFundingRequest::default())
        .await
        .unwrap_err();
    assert!(err.retryable());
    assert_eq!(h.publisher.publish_count(), 1);
    let saga = h.sagas.load(&draft.id).await.unwrap().unwrap();
    assert_eq!(saga.stage, OpeningStage::Aborted);
    let first_snapshot = saga.snapshot.unwrap();
    assert!(saga.tx_hash.is_none());

    let outcome = h
        .opener
        .open(&draft.id, CREATOR, OpenFundingRequest::default())
        .await
        .unwrap();
    assert_eq!(h.publisher.publish_count(), 1);
    assert_eq!(outcome.project.onchain().unwrap().snapshot, first_snapshot);
    assert_eq!(h.ledger.submit_count(), 1);
}

#[tokio::test]
async fn test_finality_timeout_resumes_without_resubmitting() {
    let ledger = FakeLedger::default();
    ledger.pending.store(true, Ordering::SeqCst);
    let h = harness_with(ledger).await;
    let draft = seed_ready_draft(&h.store).await;

    let err = h
        .opener
        .open(&draft.id, CREATOR, OpenFundingRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OpenFundingError::FinalityTimeout { ref tx_hash } if tx_hash == "0xtx1"));
    assert!(h.store.read(&draft.id).await.unwrap().unwrap().is_draft());
    let saga = h.sagas.load(&draft.id).await.unwrap().unwrap();
    assert_eq!(saga.tx_hash.as_deref(), Some("0xtx1"));

    // Edits after the broadcast do not change what gets committed.
    h.store
        .update_commitments(&draft.id, CREATOR, vec![], None)
        .await
        .unwrap();

    h.ledger.pending.store(false, Ordering::SeqCst);
    let outcome = h
        .opener
        .open(&draft.id, CREATOR, OpenFundingRequest::default())
        .await
        .unwrap();
    assert_eq!(h.ledger.submit_count(), 1);
    assert_eq!(h.publisher.publish_count(), 1);
    assert_eq!(outcome.project.onchain().unwrap().opened_tx_hash, "0xtx1");
}

#[tokio::test]
async fn test_reverted_transaction_may_be_resubmitted() {
    let ledger = FakeLedger::default();
    ledger.revert.store(true, Ordering::SeqCst);
    let h = harness_with(ledger).await;
    let draft = seed_ready_draft(&h.store).await;

    let err = h
        .opener
        .open(&draft.id, CREATOR, OpenFundingRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TRANSACTION_REVERTED");
    assert!(h.sagas.load(&draft.id).await.unwrap().unwrap().tx_hash.is_none());

    h.ledger.revert.store(false, Ordering::SeqCst);
    let outcome = h
        .opener
        .open(&draft.id, CREATOR, OpenFundingRequest::default())
        .await
        .unwrap();
    assert_eq!(h.ledger.submit_count(), 2);
    assert_eq!(outcome.project.onchain().unwrap().contract_address, contract_for(2));
}

#[tokio::test]
async fn test_missing_creation_event_is_fatal_and_guesses_nothing() {
    let ledger = FakeLedger::default();
    ledger.omit_event.store(true, Ordering::SeqCst);
    let h = harness_with(ledger).await;
    let draft = seed_ready_draft(&h.store).await;

    let err = h
        .opener
        .open(&draft.id, CREATOR, OpenFundingRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Fatal);
    assert!(!err.retryable());

    let record = h.store.read(&draft.id).await.unwrap().unwrap();
    assert!(record.is_draft());
    assert!(record.onchain().is_none());
    let saga = h.sagas.load(&draft.id).await.unwrap().unwrap();
    assert_eq!(saga.tx_hash.as_deref(), Some("0xtx1"));
    assert!(saga.contract_address.is_none());
    assert!(saga.last_error.unwrap().starts_with("CREATION_EVENT_MISSING"));
}

#[tokio::test]
async fn test_concurrent_attempt_is_rejected_while_one_is_running() {
    let ledger = FakeLedger::default();
    ledger.pending.store(true, Ordering::SeqCst);
    let h = harness_with(ledger).await;
    let draft = seed_ready_draft(&h.store).await;

    let opener = h.opener.clone();
    let id = draft.id.clone();
    let first = tokio::spawn(async move {
        opener.open(&id, CREATOR, OpenFundingRequest::default()).await
    });

    // Wait until the first attempt has broadcast.
    for _ in 0..100 {
        if h.ledger.submit_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let err = h
        .opener
        .open(&draft.id, CREATOR, OpenFundingRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "OPENING_IN_PROGRESS");

    h.ledger.pending.store(false, Ordering::SeqCst);
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.project.status(), ProjectStatus::Active);
    assert_eq!(h.ledger.submit_count(), 1);
}

#[tokio::test]
async fn test_dropped_request_still_commits_broadcast_transaction() {
    let ledger = FakeLedger::default();
    ledger.pending.store(true, Ordering::SeqCst);
    let h = harness_with(ledger).await;
    let draft = seed_ready_draft(&h.store).await;

    let opener = h.opener.clone();
    let id = draft.id.clone();
    let request = tokio::spawn(async move {
        opener.open(&id, CREATOR, OpenFundingRequest::default()).await
    });
    for _ in 0..100 {
        let saga = h.sagas.load(&draft.id).await.unwrap();
        if saga.is_some_and(|s| s.tx_hash.is_some()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    // Let the request hand the transaction to the finishing task.
    tokio::time::sleep(Duration::from_millis(20)).await;
    request.abort();
    h.ledger.pending.store(false, Ordering::SeqCst);

    let mut active = false;
    for _ in 0..100 {
        let record = h.store.read(&draft.id).await.unwrap().unwrap();
        if record.status() == ProjectStatus::Active {
            active = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(active);
    assert_eq!(h.ledger.submit_count(), 1);
}

#[tokio::test]
async fn test_request_dropped_between_submit_and_hash_never_broadcasts_twice() {
    let ledger = FakeLedger {
        submit_delay: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let h = harness_with(ledger).await;
    let draft = seed_ready_draft(&h.store).await;

    let opener = h.opener.clone();
    let id = draft.id.clone();
    let request = tokio::spawn(async move {
        opener.open(&id, CREATOR, OpenFundingRequest::default()).await
    });
    for _ in 0..500 {
        if h.ledger.submit_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(h.ledger.submit_count(), 1);
    // The gateway holds the transaction; its hash is not persisted yet.
    request.abort();

    let mut outcome = None;
    for _ in 0..100 {
        match h.opener.open(&draft.id, CREATOR, OpenFundingRequest::default()).await {
            Ok(done) => {
                outcome = Some(done);
                break;
            }
            Err(OpenFundingError::InProgress) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => panic!("retry failed: {e}"),
        }
    }
    let outcome = outcome.expect("opening never settled");
    assert_eq!(outcome.project.status(), ProjectStatus::Active);
    assert_eq!(outcome.project.onchain().unwrap().opened_tx_hash, "0xtx1");
    assert_eq!(h.ledger.submit_count(), 1);
    let saga = h.sagas.load(&draft.id).await.unwrap().unwrap();
    assert_eq!(saga.stage, OpeningStage::Committed);
}

#[tokio::test]
async fn test_creation_fee_timeout_aborts_before_submitting() {
    let ledger = FakeLedger {
        fee_delay: Some(Duration::from_secs(5)),
        ..Default::default()
    };
    let h = harness_with(ledger).await;
    let draft = seed_ready_draft(&h.store).await;

    let err = h
        .opener
        .open(&draft.id, CREATOR, OpenFundingRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "LEDGER_TIMEOUT");
    assert_eq!(err.class(), ErrorClass::External);
    assert!(err.retryable());
    assert_eq!(h.ledger.submit_count(), 0);

    assert!(h.store.read(&draft.id).await.unwrap().unwrap().is_draft());
    let saga = h.sagas.load(&draft.id).await.unwrap().unwrap();
    assert_eq!(saga.stage, OpeningStage::Aborted);
    assert!(saga.tx_hash.is_none());
    assert!(saga.snapshot.is_some());
    assert!(saga.last_error.unwrap().starts_with("LEDGER_TIMEOUT"));
}

#[tokio::test]
async fn test_explicit_token_without_decimals_reads_them_on_chain() {
    let ledger = FakeLedger {
        token_decimals: 8,
        ..Default::default()
    };
    let h = harness_with(ledger).await;
    let draft = seed_ready_draft(&h.store).await;
    let token = ProjectPatch {
        funding: Some(FundingPatch {
            token_address: Some(Some(TOKEN.to_string())),
            ..Default::default()
        }),
        ..Default::default()
    };
    let outcome = h
        .opener
        .open(
            &draft.id,
            CREATOR,
            OpenFundingRequest {
                patch: Some(token),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(h.ledger.decimals_reads.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.project.onchain().unwrap().token_decimals, 8);
    assert_eq!(h.ledger.submissions()[0].target_amount, 1000 * 10u128.pow(8));
}

#[tokio::test]
async fn test_published_record_cannot_be_reopened_by_foreign_saga() {
    let h = harness().await;
    let draft = h.store.create(CREATOR).await.unwrap();
    h.store
        .set_status(
            &draft.id,
            CREATOR,
            ProjectStatus::Active,
            crate::store::StatusExtras {
                onchain: Some(crate::fixtures::sample_attachment()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let err = h
        .opener
        .open(&draft.id, CREATOR, OpenFundingRequest::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OpenFundingError::Forbidden(ProjectStatus::Active)));
}

#[tokio::test]
async fn test_unknown_project_is_not_found() {
    let h = harness().await;
    let err = h
        .opener
        .open("missing", CREATOR, OpenFundingRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotFound);
}

#[tokio::test]
async fn test_draft_with_broadcast_transaction_cannot_be_deleted() {
    let ledger = FakeLedger::default();
    ledger.pending.store(true, Ordering::SeqCst);
    let h = harness_with(ledger).await;
    let draft = seed_ready_draft(&h.store).await;

    let err = h
        .opener
        .open(&draft.id, CREATOR, OpenFundingRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "FINALITY_TIMEOUT");

    let refused = h.store.delete_draft(&draft.id, CREATOR).await;
    assert!(matches!(refused, Err(crate::store::StoreError::Conflict(_))));
    assert!(h.store.read(&draft.id).await.unwrap().is_some());
}
