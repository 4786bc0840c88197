//! End-to-end pipeline scenarios over in-memory store, broker, scripted
//! platform, and scripted model.

mod common;

use chrono::{Duration, Utc};
use common::TestEnv;
use maren_broker::keys;
use maren_core::{
    DispatchJob, PlatformMessageId, RecoveryTrigger, ReviewStatus, ReviewerId, UserId,
};
use maren_pipeline::dispatch::DispatchOutcome;
use maren_pipeline::ingress::IngestOutcome;
use maren_pipeline::supervisor::SupervisorOutcome;

#[tokio::test]
async fn single_message_happy_path() {
    let env = TestEnv::new().await;
    env.model.push_draft("just studying, you?");
    env.model
        .push_bubbles("just studying 📚 [BUBBLE] you?");

    assert_eq!(env.ingest(1, 100, "hey what are you up to?").await, IngestOutcome::Appended);
    let outcomes = env.process_all(&[1]).await;
    assert_eq!(outcomes.len(), 1);
    let SupervisorOutcome::Created(interaction_id) = outcomes[0] else {
        panic!("expected a created interaction, got {:?}", outcomes[0]);
    };

    let interaction = env
        .resources()
        .store
        .get_interaction(interaction_id)
        .await
        .unwrap();
    assert_eq!(interaction.review_status, ReviewStatus::Pending);
    assert_eq!(interaction.user_text, "hey what are you up to?");
    assert_eq!(interaction.bubbles, vec!["just studying 📚", "you?"]);
    assert!(interaction.safety.risk_score < 0.3);
    assert!(!interaction.is_recovered);
    assert_eq!(env.resources().broker.zcard(keys::REVIEW_QUEUE), 1);

    // Reviewer approves with edited bubbles.
    let reviewer = ReviewerId::new("alice");
    let approved = env
        .resources()
        .store
        .approve_interaction(
            interaction_id,
            &reviewer,
            &["just studying 📚".to_owned(), "you?".to_owned()],
            &[],
            5,
            None,
            Utc::now(),
        )
        .await
        .unwrap();

    // Dispatch delivers both bubbles in order.
    let outcome = env
        .handles
        .dispatcher
        .dispatch(&DispatchJob {
            interaction_id,
            user_id: UserId(1),
            bubbles: approved.final_bubbles.clone().unwrap(),
        })
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Sent);
    assert_eq!(env.platform.sent_to(UserId(1)), vec!["just studying 📚", "you?"]);
    assert!(*env.platform.typing.lock().unwrap() >= 2);

    // Memory ends with the exchange.
    let recent = env
        .resources()
        .memory
        .recent(UserId(1), 10)
        .await
        .unwrap();
    let tail: Vec<(&str, &str)> = recent
        .iter()
        .map(|e| (e.role.as_str(), e.text.as_str()))
        .collect();
    assert_eq!(
        tail,
        vec![
            ("user", "hey what are you up to?"),
            ("assistant", "just studying 📚"),
            ("assistant", "you?"),
        ]
    );
}

#[tokio::test]
async fn rapid_burst_batches_into_one_unit() {
    let env = TestEnv::new().await;

    assert_eq!(env.ingest(7, 200, "hi").await, IngestOutcome::Appended);
    assert_eq!(env.ingest(7, 201, "you there").await, IngestOutcome::Appended);
    assert_eq!(env.ingest(7, 202, "??").await, IngestOutcome::Appended);

    let outcomes = env.process_all(&[7]).await;
    assert_eq!(outcomes.len(), 1);
    let SupervisorOutcome::Created(interaction_id) = outcomes[0] else {
        panic!("expected created");
    };

    let interaction = env
        .resources()
        .store
        .get_interaction(interaction_id)
        .await
        .unwrap();
    assert_eq!(interaction.user_text, "hi\nyou there\n??");
    assert_eq!(
        interaction.source_message_ids,
        vec![
            PlatformMessageId(200),
            PlatformMessageId(201),
            PlatformMessageId(202)
        ]
    );
    // Exactly one generation call accounted.
    assert_eq!(*env.model.generate_calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn quarantine_intercepts_and_release_replays() {
    let env = TestEnv::new().await;
    let reviewer = ReviewerId::new("alice");

    env.handles
        .protocol
        .activate(UserId(3), &reviewer)
        .await
        .unwrap();

    assert_eq!(env.ingest(3, 300, "hello??").await, IngestOutcome::Quarantined);
    assert_eq!(env.resources().broker.zcard(keys::REVIEW_QUEUE), 0);
    let queue = env
        .handles
        .protocol
        .quarantine_queue(UserId(3), 10)
        .await
        .unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].text, "hello??");
    assert!(!queue[0].processed);

    // Release flows back through intake and produces an interaction once
    // the protocol is lifted.
    env.handles
        .protocol
        .deactivate(UserId(3), &reviewer)
        .await
        .unwrap();
    let released = env.handles.protocol.release(queue[0].id).await.unwrap();
    assert!(released.released_from_quarantine);

    let outcomes = env.process_all(&[3]).await;
    assert_eq!(outcomes.len(), 1);
    let SupervisorOutcome::Created(interaction_id) = outcomes[0] else {
        panic!("expected created");
    };
    let interaction = env
        .resources()
        .store
        .get_interaction(interaction_id)
        .await
        .unwrap();
    assert_eq!(interaction.source_message_ids, vec![PlatformMessageId(300)]);
}

#[tokio::test]
async fn recovery_tiers_and_skips_by_age() {
    let env = TestEnv::new().await;
    let now = Utc::now();
    env.platform.seed_history(
        UserId(5),
        vec![
            TestEnv::message(5, 400, "where are you", now - Duration::minutes(10)),
            TestEnv::message(5, 401, "hello?", now - Duration::minutes(30)),
            TestEnv::message(5, 402, "ancient one", now - Duration::hours(14)),
        ],
    );

    let op = env
        .handles
        .recovery
        .run(RecoveryTrigger::Startup)
        .await
        .unwrap();
    assert_eq!(op.tier1_count, 2);
    assert_eq!(op.tier2_count, 0);
    assert_eq!(op.skipped_count, 1);
    assert_eq!(op.users_examined, 1);

    // Cursor advanced to the newest id seen, skipped message included.
    assert_eq!(
        env.resources().store.cursor(UserId(5)).await.unwrap(),
        Some(PlatformMessageId(402))
    );

    // The recovered messages flow through the normal pipeline flagged.
    let outcomes = env.process_all(&[5]).await;
    assert_eq!(outcomes.len(), 1);
    let SupervisorOutcome::Created(interaction_id) = outcomes[0] else {
        panic!("expected created");
    };
    let interaction = env
        .resources()
        .store
        .get_interaction(interaction_id)
        .await
        .unwrap();
    assert!(interaction.is_recovered);
    assert_eq!(
        interaction.source_message_ids,
        vec![PlatformMessageId(400), PlatformMessageId(401)]
    );

    // A second run finds nothing new.
    let second = env
        .handles
        .recovery
        .run(RecoveryTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(second.ingested_total(), 0);
}

#[tokio::test]
async fn recovery_cap_leaves_cursor_behind_unhandled_messages() {
    let env = TestEnv::with_config_overlay("[recovery]\nmax_messages_per_run = 2\n").await;
    let now = Utc::now();
    env.platform.seed_history(
        UserId(11),
        vec![
            TestEnv::message(11, 400, "one", now - Duration::minutes(10)),
            TestEnv::message(11, 401, "two", now - Duration::minutes(9)),
            TestEnv::message(11, 402, "three", now - Duration::minutes(8)),
            TestEnv::message(11, 403, "four", now - Duration::minutes(7)),
        ],
    );

    let first = env
        .handles
        .recovery
        .run(RecoveryTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(first.tier1_count, 2);
    // The cursor stops at the last handled id, not the newest fetched;
    // the cap is a pacing limit, never a data-loss boundary.
    assert_eq!(
        env.resources().store.cursor(UserId(11)).await.unwrap(),
        Some(PlatformMessageId(401))
    );

    // The next pass picks up exactly the messages the cap cut off.
    let second = env
        .handles
        .recovery
        .run(RecoveryTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(second.tier1_count, 2);
    assert_eq!(
        env.resources().store.cursor(UserId(11)).await.unwrap(),
        Some(PlatformMessageId(403))
    );

    // Nothing was dropped: all four messages are durably ingested.
    for id in [400, 401, 402, 403] {
        let location = env
            .resources()
            .store
            .message_location(UserId(11), PlatformMessageId(id))
            .await
            .unwrap();
        assert_eq!(location.as_deref(), Some("intake"));
    }
}

#[tokio::test]
async fn coherence_conflict_corrects_draft() {
    let env = TestEnv::new().await;
    let now = Utc::now();
    env.resources()
        .store
        .insert_commitment(
            UserId(9),
            "anatomy exam tomorrow 9am",
            now + Duration::hours(18),
            now,
        )
        .await
        .unwrap();

    env.model.push_draft("wanna grab drinks tomorrow at 9?");
    env.model.push_verdict(
        r#"{"status": "availability_conflict",
            "original_span": "tomorrow at 9",
            "replacement_span": "tomorrow after 11"}"#,
    );

    env.ingest(9, 500, "free tomorrow night?").await;
    let outcomes = env.process_all(&[9]).await;
    let SupervisorOutcome::Created(interaction_id) = outcomes[0] else {
        panic!("expected created");
    };

    let interaction = env
        .resources()
        .store
        .get_interaction(interaction_id)
        .await
        .unwrap();
    // The raw generator output keeps the conflicting time.
    assert!(interaction.generator_text.contains("tomorrow at 9"));
    // The refined draft carries the correction.
    assert!(interaction.draft_text.contains("tomorrow after 11"));

    let record = env
        .resources()
        .store
        .coherence_record(interaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        record.status,
        maren_core::CoherenceStatus::AvailabilityConflict
    );
    assert_eq!(record.replacement_span.as_deref(), Some("tomorrow after 11"));
}

#[tokio::test]
async fn identity_conflict_rotates_once_then_flags() {
    let env = TestEnv::with_config_overlay(
        "[persona]\nsystem_prompt = \"base\"\nprompt_variants = [\"alt\"]\n",
    )
    .await;
    env.model.push_draft("I'm actually an AI");
    env.model.push_verdict(r#"{"status": "identity_conflict"}"#);
    env.model.push_draft("still being weird about it");
    env.model.push_verdict(r#"{"status": "identity_conflict"}"#);

    env.ingest(4, 600, "are you real?").await;
    let outcomes = env.process_all(&[4]).await;
    let SupervisorOutcome::Created(interaction_id) = outcomes[0] else {
        panic!("expected created");
    };

    let interaction = env
        .resources()
        .store
        .get_interaction(interaction_id)
        .await
        .unwrap();
    assert!(interaction.identity_loop_suspected);
    // Two generation calls: the original and exactly one restart.
    assert_eq!(*env.model.generate_calls.lock().unwrap(), 2);
}

#[tokio::test]
async fn duplicate_events_are_idempotent() {
    let env = TestEnv::new().await;

    assert_eq!(env.ingest(2, 700, "hello").await, IngestOutcome::Appended);
    assert_eq!(
        env.ingest(2, 700, "hello").await,
        IngestOutcome::DroppedDuplicate
    );
    assert_eq!(
        env.ingest(2, 700, "hello again").await,
        IngestOutcome::DroppedDuplicate
    );

    let outcomes = env.process_all(&[2]).await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], SupervisorOutcome::Created(_)));

    // Re-delivering after processing still creates nothing new.
    assert_eq!(
        env.ingest(2, 700, "hello").await,
        IngestOutcome::DroppedDuplicate
    );
    assert_eq!(env.resources().store.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn quarantine_mid_buffer_drains_to_quarantine() {
    let env = TestEnv::new().await;
    let reviewer = ReviewerId::new("alice");

    env.ingest(6, 800, "first").await;
    env.ingest(6, 801, "second").await;
    env.drain_intake().await;
    assert_eq!(env.handles.tracker.live_buffers(), 1);

    // Protocol flips while the buffer is pending.
    env.handles
        .protocol
        .activate(UserId(6), &reviewer)
        .await
        .unwrap();
    let drained = env
        .handles
        .tracker
        .drain_to_quarantine(UserId(6))
        .await
        .unwrap();
    assert_eq!(drained, 2);

    let queue = env
        .handles
        .protocol
        .quarantine_queue(UserId(6), 10)
        .await
        .unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(env.resources().store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn dispatch_aborts_on_quarantine() {
    let env = TestEnv::new().await;
    let reviewer = ReviewerId::new("alice");

    env.ingest(8, 900, "hi").await;
    let outcomes = env.process_all(&[8]).await;
    let SupervisorOutcome::Created(interaction_id) = outcomes[0] else {
        panic!("expected created");
    };
    env.resources()
        .store
        .approve_interaction(
            interaction_id,
            &reviewer,
            &["on my way".to_owned()],
            &[],
            4,
            None,
            Utc::now(),
        )
        .await
        .unwrap();

    env.handles
        .protocol
        .activate(UserId(8), &reviewer)
        .await
        .unwrap();

    let outcome = env
        .handles
        .dispatcher
        .dispatch(&DispatchJob {
            interaction_id,
            user_id: UserId(8),
            bubbles: vec!["on my way".to_owned()],
        })
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::CancelledQuarantine);
    assert!(env.platform.sent_to(UserId(8)).is_empty());

    let interaction = env
        .resources()
        .store
        .get_interaction(interaction_id)
        .await
        .unwrap();
    assert_eq!(
        interaction.dispatch_state,
        Some(maren_core::DispatchState::CancelledQuarantine)
    );
}

#[tokio::test]
async fn second_recovery_while_running_rejected() {
    let env = TestEnv::new().await;
    // An empty platform finishes instantly, so race the calls.
    let first = env.handles.recovery.run(RecoveryTrigger::Startup);
    let second = env.handles.recovery.run(RecoveryTrigger::Manual);
    let (a, b) = tokio::join!(first, second);
    let failures = usize::from(a.is_err()) + usize::from(b.is_err());
    // Either they serialized cleanly (both ran) or one was rejected with
    // AlreadyRunning; both results respect the no-overlap contract.
    assert!(failures <= 1);
    if let Err(err) = a.and(b) {
        assert!(matches!(
            err,
            maren_pipeline::PipelineError::AlreadyRunning
        ));
    }
}
