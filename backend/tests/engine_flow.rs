mod common;

use chrono::{Duration, Utc};
use common::*;
use matchmaker::constants::CANDIDATE_SCAN_LIMIT;
use matchmaker::error::MatchError;
use matchmaker::db::MatchStore;
use matchmaker::models::*;
use matchmaker::services::AnalyticsEvent;

#[tokio::test]
async fn test_nearby_pair_is_proposed_and_materialized() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["climbing", "jazz", "chess"]);
    let b = h.user("Bob", "Brown", &["climbing", "jazz", "chess", "cooking"]);
    let (_, mut rx_a) = h.engine.dispatcher().register_connection(a).await.unwrap();
    let (_, mut rx_b) = h.engine.dispatcher().register_connection(b).await.unwrap();

    h.search(a, MatchType::Standard, Some(BERLIN)).await;
    h.search(b, MatchType::Standard, Some(NEAR_BERLIN)).await;

    // Both hear about each other without learning who it is
    let alerts: Vec<EngineEvent> = drain(&mut rx_a);
    assert!(matches!(
        alerts.as_slice(),
        [EngineEvent::NearbyUserAlert { match_type: MatchType::Standard, distance_km }] if (*distance_km - 2.0).abs() < 0.2
    ));

    let candidates = h.engine.queue().find_candidates(a, 10, Utc::now()).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].user_id, b);
    assert!(candidates[0].score > 0);

    let proposal = h.engine.run_matching_pass(a).await.unwrap().expect("a proposal");
    assert_eq!((proposal.user_a, proposal.user_b), (a, b));
    assert_eq!(proposal.score, candidates[0].score);

    for rx in [&mut rx_a, &mut rx_b] {
        match next_event(rx).await {
            EngineEvent::ProposalOffered { proposal_id, partner, .. } => {
                assert_eq!(proposal_id, proposal.id);
                assert!(!partner.masked);
            }
            other => panic!("expected an offer, got {other:?}"),
        }
    }

    let first = h.engine.respond_proposal(a, proposal.id, Decision::Accept).await.unwrap();
    assert_eq!(first.status, ProposalStatus::AcceptedByA);
    let second = h.engine.respond_proposal(b, proposal.id, Decision::Accept).await.unwrap();
    assert_eq!(second.status, ProposalStatus::Confirmed);

    let record = h.store.open_match_for(a, MatchType::Standard).await.unwrap().expect("a match");
    assert_eq!(record.status, MatchStatus::Active);
    assert_ne!(record.user_a, record.user_b);
    assert!(record.chat_id.is_some());
    assert!(h.store.searching_user(a).await.unwrap().is_none());
    assert!(h.store.searching_user(b).await.unwrap().is_none());

    for (rx, partner_id) in [(&mut rx_a, b), (&mut rx_b, a)] {
        assert_eq!(
            next_event(rx).await,
            EngineEvent::ProposalResolved {
                proposal_id: proposal.id,
                status: ProposalStatus::Confirmed
            }
        );
        match next_event(rx).await {
            EngineEvent::MatchConfirmed { match_id, chat_id, partner, .. } => {
                assert_eq!(match_id, record.id);
                assert_eq!(chat_id, record.chat_id);
                assert_eq!(partner.user_id, Some(partner_id));
            }
            other => panic!("expected a confirmation, got {other:?}"),
        }
    }

    let snapshot = h.engine.refresh_metrics().await.unwrap();
    assert_eq!(snapshot.searches_started, 2);
    assert_eq!(snapshot.matches_created, 1);
    assert_eq!(snapshot.searching_count, 0);
    assert_eq!(snapshot.active_proposals, 0);

    let events = h.analytics.events();
    assert!(events.iter().any(|e| matches!(e, AnalyticsEvent::MatchConfirmed { match_id, .. } if *match_id == record.id)));
    assert!(h.push.sent().is_empty());
}

#[tokio::test]
async fn test_second_search_conflicts() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess"]);
    h.search(a, MatchType::Standard, None).await;

    let again = h
        .engine
        .start_search(a, MatchType::Standard, SearchCriteria::default(), None)
        .await;
    assert!(matches!(again, Err(MatchError::AlreadySearching)));
}

#[tokio::test]
async fn test_invalid_criteria_leave_no_state() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess"]);

    let result = h
        .engine
        .start_search(a, MatchType::Standard, SearchCriteria::default().with_radius(-1.0), None)
        .await;
    assert!(matches!(result, Err(MatchError::Validation(_))));

    let result = h
        .engine
        .start_search(a, MatchType::Standard, SearchCriteria::default(), Some(GeoPoint::new(95.0, 0.0)))
        .await;
    assert!(matches!(result, Err(MatchError::Validation(_))));
    assert!(h.store.searching_user(a).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unanswered_proposal_expires_exactly_once() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess", "jazz"]);
    let b = h.user("Bob", "Brown", &["chess", "jazz"]);
    h.search(a, MatchType::Standard, None).await;
    h.search(b, MatchType::Standard, None).await;

    let proposal = h.engine.run_matching_pass(a).await.unwrap().unwrap();
    let later = proposal.expires_at + Duration::seconds(1);

    let expired = h.engine.coordinator().sweep_expired(later).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].proposal.status, ProposalStatus::Expired);
    assert_eq!(expired[0].requeued.len(), 2);
    assert!(h.engine.coordinator().sweep_expired(later).await.unwrap().is_empty());

    // Both are visible to a newcomer again
    let c = h.user("Cara", "Cole", &["chess", "jazz"]);
    h.search(c, MatchType::Standard, None).await;
    let found: Vec<UserId> = h
        .engine
        .queue()
        .find_candidates(c, 10, Utc::now())
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.user_id)
        .collect();
    assert!(found.contains(&a) && found.contains(&b));

    // Late answers are refused
    let late = h.engine.respond_proposal(b, proposal.id, Decision::Accept).await;
    assert!(matches!(late, Err(MatchError::InvalidProposalState(_))));
}

#[tokio::test]
async fn test_expiry_sweep_rematches_released_users() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess"]);
    let b = h.user("Bob", "Brown", &["chess"]);
    h.search(a, MatchType::Standard, None).await;
    h.search(b, MatchType::Standard, None).await;
    let first = h.engine.run_matching_pass(a).await.unwrap().unwrap();

    let swept = h.engine.sweep_expired(first.expires_at + Duration::seconds(1)).await.unwrap();
    assert_eq!(swept, 1);

    let second = h.store.open_proposal_for(a).await.unwrap().expect("re-proposed");
    assert_ne!(second.id, first.id);
    assert!(second.involves(b));
}

#[tokio::test]
async fn test_rejection_releases_both_and_blocks_the_pair() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess"]);
    let b = h.user("Bob", "Brown", &["chess"]);
    let (_, mut rx_a) = h.engine.dispatcher().register_connection(a).await.unwrap();
    h.search(a, MatchType::Standard, None).await;
    h.search(b, MatchType::Standard, None).await;
    let proposal = h.engine.run_matching_pass(a).await.unwrap().unwrap();

    h.engine.respond_proposal(a, proposal.id, Decision::Accept).await.unwrap();
    let outcome = h.engine.respond_proposal(b, proposal.id, Decision::Reject).await.unwrap();
    assert_eq!(outcome.status, ProposalStatus::Rejected);
    assert_eq!(outcome.requeued.len(), 2);

    for user in [a, b] {
        let entry = h.store.searching_user(user).await.unwrap().unwrap();
        assert_eq!(entry.status, SearchStatus::Searching);
        assert!(h.store.open_proposal_for(user).await.unwrap().is_none());
    }

    assert!(matches!(next_event(&mut rx_a).await, EngineEvent::ProposalOffered { .. }));
    assert_eq!(
        next_event(&mut rx_a).await,
        EngineEvent::ProposalResolved {
            proposal_id: proposal.id,
            status: ProposalStatus::Rejected
        }
    );

    // The same pair is not offered again
    assert!(h.engine.run_matching_pass(a).await.unwrap().is_none());

    let again = h.engine.respond_proposal(a, proposal.id, Decision::Accept).await;
    assert!(matches!(again, Err(MatchError::InvalidProposalState(_))));
}

#[tokio::test]
async fn test_foreign_user_cannot_respond() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess"]);
    let b = h.user("Bob", "Brown", &["chess"]);
    let mallory = h.user("Mallory", "Moss", &["chess"]);
    h.search(a, MatchType::Standard, None).await;
    h.search(b, MatchType::Standard, None).await;
    let proposal = h.engine.run_matching_pass(a).await.unwrap().unwrap();

    let result = h.engine.respond_proposal(mallory, proposal.id, Decision::Reject).await;
    assert!(matches!(result, Err(MatchError::InvalidProposalState(_))));
    assert_eq!(h.store.proposal(proposal.id).await.unwrap().unwrap().status, ProposalStatus::Pending);
}

#[tokio::test]
async fn test_cancel_during_proposal_is_deferred() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess"]);
    let b = h.user("Bob", "Brown", &["chess"]);
    h.search(a, MatchType::Standard, None).await;
    h.search(b, MatchType::Standard, None).await;
    let proposal = h.engine.run_matching_pass(a).await.unwrap().unwrap();

    assert_eq!(h.engine.cancel_search(a).await.unwrap(), CancelOutcome::Deferred);
    // The claim still stands
    assert!(h.store.open_proposal_for(a).await.unwrap().is_some());

    let expired = h
        .engine
        .coordinator()
        .sweep_expired(proposal.expires_at + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(expired[0].requeued, vec![b]);
    assert_eq!(expired[0].dropped, vec![a]);
    assert!(h.store.searching_user(a).await.unwrap().is_none());
    assert_eq!(h.engine.cancel_search(a).await.unwrap(), CancelOutcome::NotSearching);
}

#[tokio::test]
async fn test_blocked_and_filtered_users_are_not_candidates() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess"]);
    let blocked = h.user("Bob", "Brown", &["chess"]);
    let friend = h.user("Cara", "Cole", &["chess"]);
    let far = h.user("Dan", "Dale", &["chess"]);
    let suspended = h.user("Eve", "East", &["chess"]);
    h.store.block(blocked, a);
    h.store.befriend(a, friend);
    h.store.upsert_profile(Profile {
        is_suspended: true,
        ..Profile::new(suspended, "Eve", "East").with_interests(["chess"])
    });

    h.search(a, MatchType::Standard, Some(BERLIN)).await;
    h.search(blocked, MatchType::Standard, Some(BERLIN)).await;
    h.search(friend, MatchType::Standard, Some(BERLIN)).await;
    h.search(far, MatchType::Standard, Some(GeoPoint::new(48.1351, 11.5820))).await;
    h.search(suspended, MatchType::Standard, Some(BERLIN)).await;

    assert!(h.engine.queue().find_candidates(a, 10, Utc::now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_crowd_of_ineligible_searchers_does_not_hide_newer_candidate() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess"]);
    for i in 0..CANDIDATE_SCAN_LIMIT + 20 {
        let other = h.user(&format!("User{i}"), "Blocked", &["chess"]);
        h.store.block(a, other);
        h.search(other, MatchType::Standard, None).await;
    }
    let b = h.user("Bob", "Brown", &["chess"]);
    h.search(b, MatchType::Standard, None).await;
    h.search(a, MatchType::Standard, None).await;

    let candidates = h.engine.queue().find_candidates(a, 10, Utc::now()).await.unwrap();
    let ids: Vec<UserId> = candidates.iter().map(|c| c.user_id).collect();
    assert_eq!(ids, vec![b]);

    let proposal = h.engine.run_matching_pass(a).await.unwrap().expect("a proposal");
    assert_eq!(proposal.partner_of(a), Some(b));
}

#[tokio::test]
async fn test_blind_date_is_masked_until_both_request_reveal() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess", "jazz"]);
    let b = h.user("Bob", "Brown", &["chess", "jazz"]);
    let (_, mut rx_b) = h.engine.dispatcher().register_connection(b).await.unwrap();
    h.search(a, MatchType::BlindDate, None).await;
    h.search(b, MatchType::BlindDate, None).await;

    let proposal = h.engine.run_matching_pass(a).await.unwrap().unwrap();
    match next_event(&mut rx_b).await {
        EngineEvent::ProposalOffered { partner, .. } => {
            assert!(partner.masked);
            assert_eq!(partner.user_id, None);
            assert_eq!(partner.first_name, "A****");
            assert_eq!(partner.last_name, "A****");
            assert_eq!(partner.needs, None);
            assert_eq!(partner.match_reason.as_deref(), Some("You share 2 interests"));
        }
        other => panic!("expected an offer, got {other:?}"),
    }
    h.engine.respond_proposal(a, proposal.id, Decision::Accept).await.unwrap();
    h.engine.respond_proposal(b, proposal.id, Decision::Accept).await.unwrap();

    let record = h.store.open_match_for(a, MatchType::BlindDate).await.unwrap().unwrap();
    let view = h.engine.match_view(b, record.id).await.unwrap();
    assert_eq!(view.status, MatchStatus::Active);
    assert!(view.partner.masked);
    assert_eq!(view.partner.user_id, None);

    assert_eq!(h.engine.request_reveal(a, record.id).await.unwrap(), MatchStatus::Active);
    assert!(h.engine.match_view(b, record.id).await.unwrap().partner.masked);
    assert_eq!(h.engine.request_reveal(b, record.id).await.unwrap(), MatchStatus::Revealed);

    let view = h.engine.match_view(b, record.id).await.unwrap();
    assert_eq!(view.status, MatchStatus::Revealed);
    assert!(!view.partner.masked);
    assert_eq!(view.partner.user_id, Some(a));
    assert_eq!(view.partner.first_name, "Alice");

    let events = drain(&mut rx_b);
    assert!(events.iter().any(|e| matches!(e, EngineEvent::MatchRevealed { match_id, .. } if *match_id == record.id)));

    // Ending is terminal
    h.engine.end_match(a, record.id).await.unwrap();
    assert!(matches!(
        h.engine.end_match(b, record.id).await,
        Err(MatchError::InvalidProposalState(_))
    ));
    assert!(matches!(
        h.engine.request_reveal(b, record.id).await,
        Err(MatchError::InvalidProposalState(_))
    ));
}

#[tokio::test]
async fn test_message_threshold_reveals_blind_date() {
    use matchmaker::engine::RevealRule;

    let h = Harness::with_config(matchmaker::engine::EngineConfig {
        reveal_rule: RevealRule::MessageCount(3),
        ..test_config()
    });
    let a = h.user("Alice", "Adams", &["chess"]);
    let b = h.user("Bob", "Brown", &["chess"]);
    h.search(a, MatchType::BlindDate, None).await;
    h.search(b, MatchType::BlindDate, None).await;
    let proposal = h.engine.run_matching_pass(a).await.unwrap().unwrap();
    h.engine.respond_proposal(b, proposal.id, Decision::Accept).await.unwrap();
    h.engine.respond_proposal(a, proposal.id, Decision::Accept).await.unwrap();
    let record = h.store.open_match_for(b, MatchType::BlindDate).await.unwrap().unwrap();

    assert_eq!(h.engine.record_message(record.id).await.unwrap(), MatchStatus::Active);
    assert_eq!(h.engine.record_message(record.id).await.unwrap(), MatchStatus::Active);
    assert_eq!(h.engine.record_message(record.id).await.unwrap(), MatchStatus::Revealed);
    assert_eq!(h.engine.record_message(record.id).await.unwrap(), MatchStatus::Revealed);
}

async fn quiet_blind_date(h: &Harness) -> (UserId, UserId, Match) {
    let a = h.user("Alice", "Adams", &["chess"]);
    let b = h.user("Bob", "Brown", &["chess"]);
    h.search(a, MatchType::BlindDate, None).await;
    h.search(b, MatchType::BlindDate, None).await;
    let proposal = h.engine.run_matching_pass(a).await.unwrap().unwrap();
    h.engine.respond_proposal(a, proposal.id, Decision::Accept).await.unwrap();
    h.engine.respond_proposal(b, proposal.id, Decision::Accept).await.unwrap();
    let record = h.store.open_match_for(a, MatchType::BlindDate).await.unwrap().unwrap();
    (a, b, record)
}

#[tokio::test]
async fn test_elapsed_policy_reveals_without_any_activity() {
    use matchmaker::engine::RevealRule;

    let h = Harness::with_config(matchmaker::engine::EngineConfig {
        reveal_rule: RevealRule::Elapsed(Duration::minutes(10)),
        ..test_config()
    });
    let (a, b, record) = quiet_blind_date(&h).await;
    let (_, mut rx_b) = h.engine.dispatcher().register_connection(b).await.unwrap();

    let now = Utc::now();
    assert_eq!(h.engine.reveal_due(now).await.unwrap(), 0);
    assert!(h.engine.match_view(b, record.id).await.unwrap().partner.masked);

    // Nobody asked and nobody wrote; the clock alone does it
    assert_eq!(h.engine.reveal_due(now + Duration::minutes(11)).await.unwrap(), 1);
    assert_eq!(
        h.store.match_record(record.id).await.unwrap().unwrap().status,
        MatchStatus::Revealed
    );
    match next_event(&mut rx_b).await {
        EngineEvent::MatchRevealed { match_id, partner } => {
            assert_eq!(match_id, record.id);
            assert_eq!(partner.user_id, Some(a));
            assert_eq!(partner.first_name, "Alice");
        }
        other => panic!("expected a reveal, got {other:?}"),
    }
    let view = h.engine.match_view(b, record.id).await.unwrap();
    assert_eq!(view.status, MatchStatus::Revealed);
    assert!(!view.partner.masked);

    // Already revealed matches are not picked up again
    assert_eq!(h.engine.reveal_due(now + Duration::minutes(20)).await.unwrap(), 0);
}

#[tokio::test]
async fn test_view_reveals_once_the_time_condition_holds() {
    use matchmaker::engine::RevealRule;

    let h = Harness::with_config(matchmaker::engine::EngineConfig {
        reveal_rule: RevealRule::Elapsed(Duration::milliseconds(1)),
        ..test_config()
    });
    let (a, _, record) = quiet_blind_date(&h).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let view = h.engine.match_view(a, record.id).await.unwrap();
    assert_eq!(view.status, MatchStatus::Revealed);
    assert!(!view.partner.masked);
    assert_eq!(view.partner.first_name, "Bob");
}

#[tokio::test]
async fn test_mutual_policy_has_no_time_trigger() {
    let h = Harness::new();
    let (_, b, record) = quiet_blind_date(&h).await;

    let later = Utc::now() + Duration::days(30);
    assert_eq!(h.engine.reveal_due(later).await.unwrap(), 0);
    assert!(h.engine.match_view(b, record.id).await.unwrap().partner.masked);
}

#[tokio::test]
async fn test_standard_match_cannot_be_revealed_or_viewed_by_outsiders() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess"]);
    let b = h.user("Bob", "Brown", &["chess"]);
    let outsider = h.user("Olga", "Ortiz", &["chess"]);
    h.search(a, MatchType::Standard, None).await;
    h.search(b, MatchType::Standard, None).await;
    let proposal = h.engine.run_matching_pass(a).await.unwrap().unwrap();
    h.engine.respond_proposal(a, proposal.id, Decision::Accept).await.unwrap();
    h.engine.respond_proposal(b, proposal.id, Decision::Accept).await.unwrap();
    let record = h.store.open_match_for(a, MatchType::Standard).await.unwrap().unwrap();

    assert!(matches!(h.engine.request_reveal(a, record.id).await, Err(MatchError::Validation(_))));
    assert!(matches!(h.engine.match_view(outsider, record.id).await, Err(MatchError::Forbidden)));
    assert!(!h.engine.match_view(a, record.id).await.unwrap().partner.masked);

    // An open match of this type blocks a new search of the same type only
    assert!(matches!(
        h.engine.start_search(a, MatchType::Standard, SearchCriteria::default(), None).await,
        Err(MatchError::AlreadyMatched)
    ));
    h.engine
        .start_search(a, MatchType::BlindDate, SearchCriteria::default(), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_chat_failure_is_completed_by_retry_job() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess"]);
    let b = h.user("Bob", "Brown", &["chess"]);
    let (_, mut rx_a) = h.engine.dispatcher().register_connection(a).await.unwrap();
    h.search(a, MatchType::Standard, None).await;
    h.search(b, MatchType::Standard, None).await;
    let proposal = h.engine.run_matching_pass(a).await.unwrap().unwrap();

    // Both inline attempts fail
    h.chat.fail_next(2);
    h.engine.respond_proposal(a, proposal.id, Decision::Accept).await.unwrap();
    let outcome = h.engine.respond_proposal(b, proposal.id, Decision::Accept).await.unwrap();
    assert_eq!(outcome.status, ProposalStatus::Confirmed);

    let record = h.store.open_match_for(a, MatchType::Standard).await.unwrap().unwrap();
    assert_eq!(record.chat_id, None);

    assert_eq!(h.engine.retry_pending_chats().await.unwrap(), 1);
    let record = h.store.match_record(record.id).await.unwrap().unwrap();
    let chat_id = record.chat_id.clone().expect("chat created on retry");
    assert_eq!(h.engine.retry_pending_chats().await.unwrap(), 0);

    let events = drain(&mut rx_a);
    assert!(events.iter().any(|e| matches!(e, EngineEvent::MatchConfirmed { chat_id: None, .. })));
    assert_eq!(
        events.last(),
        Some(&EngineEvent::ChatReady {
            match_id: record.id,
            chat_id
        })
    );
}

#[tokio::test]
async fn test_offline_users_get_push_fallback() {
    let h = Harness::new();
    let a = h.user("Alice", "Adams", &["chess"]);
    let b = h.user("Bob", "Brown", &["chess"]);
    h.search(a, MatchType::Standard, None).await;
    h.search(b, MatchType::Standard, None).await;
    h.engine.run_matching_pass(a).await.unwrap().unwrap();

    let pushed: Vec<UserId> = h
        .push
        .sent()
        .into_iter()
        .filter(|(_, e)| matches!(e, EngineEvent::ProposalOffered { .. }))
        .map(|(user, _)| user)
        .collect();
    assert_eq!(pushed.len(), 2);
    assert!(pushed.contains(&a) && pushed.contains(&b));
}

#[tokio::test]
async fn test_disconnected_searchers_are_swept_after_grace() {
    let h = Harness::new();
    let online = h.user("Alice", "Adams", &["chess"]);
    let offline = h.user("Bob", "Brown", &["chess"]);
    let _conn = h.engine.dispatcher().register_connection(online).await.unwrap();
    h.search(online, MatchType::Standard, None).await;
    h.search(offline, MatchType::Standard, None).await;

    assert_eq!(h.engine.sweep_disconnected(Utc::now()).await.unwrap(), 0);

    let later = Utc::now() + h.engine.config().disconnected_grace + Duration::seconds(1);
    assert_eq!(h.engine.sweep_disconnected(later).await.unwrap(), 1);
    assert!(h.store.searching_user(online).await.unwrap().is_some());
    assert!(h.store.searching_user(offline).await.unwrap().is_none());
}
