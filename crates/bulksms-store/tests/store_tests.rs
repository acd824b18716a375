//! Integration tests for the durable store
//!
//! The reopen tests run against a real file in a temp dir to simulate
//! process restarts; everything else uses the in-memory store.

use tempfile::TempDir;

use bulksms_core::compliance::{OptOutRecord, OptOutView};
use bulksms_core::message::{MessageStatus, OutboundMessage};
use bulksms_core::session::{CampaignSession, CampaignType, CheckpointPatch, ProcessingStatus};
use bulksms_core::types::{PhoneNumber, SessionId, Timestamp};
use bulksms_core::Recipient;
use bulksms_store::SessionStore;

fn session(recipients: usize) -> CampaignSession {
    CampaignSession::new(
        "contacts.csv",
        "promo",
        CampaignType::Transactional,
        (0..recipients)
            .map(|i| Recipient::new(i as u64, format!("+2547000{i:05}")))
            .collect(),
        "Hi {{Name}}",
        300,
        0,
        Timestamp::new(1_000),
    )
}

fn message(session_id: SessionId, index: u64) -> OutboundMessage {
    OutboundMessage::new(
        session_id,
        index,
        PhoneNumber::parse(&format!("+2547000{index:05}")).unwrap(),
        format!("body {index}"),
        0,
        Timestamp::new(2_000 + index),
    )
}

#[test]
fn save_load_round_trip() {
    let store = SessionStore::open_in_memory().unwrap();
    let mut original = session(3);
    original.transition_to(ProcessingStatus::Sending).unwrap();
    original.last_processed_index = 2;
    original.sent_count = 2;

    store.save(&original).unwrap();
    let loaded = store.load(original.session_id).unwrap();

    // byte-equal logical representation
    assert_eq!(loaded.session_id, original.session_id);
    assert_eq!(loaded.recipients, original.recipients);
    assert_eq!(loaded.template, original.template);
    assert_eq!(loaded.campaign_type, original.campaign_type);
    assert_eq!(loaded.processing_status, ProcessingStatus::Sending);
    assert_eq!(loaded.last_processed_index, 2);
    assert_eq!(loaded.sent_count, 2);
    assert!(loaded.validate_counters().is_ok());
}

#[test]
fn load_missing_session_is_not_found() {
    let store = SessionStore::open_in_memory().unwrap();
    let err = store.load(SessionId::new()).unwrap_err();
    assert!(matches!(
        err,
        bulksms_core::StorageError::SessionNotFound(_)
    ));
}

#[test]
fn checkpoint_is_a_partial_update() {
    let store = SessionStore::open_in_memory().unwrap();
    let mut s = session(10);
    s.transition_to(ProcessingStatus::Sending).unwrap();
    store.save(&s).unwrap();

    s.last_processed_index = 7;
    s.sent_count = 5;
    s.failed_count = 1;
    s.skipped_count = 1;
    store
        .checkpoint(s.session_id, &CheckpointPatch::of(&s), Timestamp::new(9_000))
        .unwrap();

    let loaded = store.load(s.session_id).unwrap();
    assert_eq!(loaded.last_processed_index, 7);
    assert_eq!(loaded.sent_count, 5);
    assert_eq!(loaded.updated_at, Timestamp::new(9_000));
    // untouched columns survive
    assert_eq!(loaded.template, s.template);
    assert_eq!(loaded.recipients.len(), 10);
    assert!(loaded.validate_counters().is_ok());
}

#[test]
fn load_active_prefers_latest() {
    let store = SessionStore::open_in_memory().unwrap();
    assert!(store.load_active().unwrap().is_none());

    let mut a = session(1);
    a.transition_to(ProcessingStatus::Sending).unwrap();
    a.updated_at = Timestamp::new(10);
    store.save(&a).unwrap();

    let mut b = session(1);
    b.transition_to(ProcessingStatus::Sending).unwrap();
    b.transition_to(ProcessingStatus::Paused).unwrap();
    b.updated_at = Timestamp::new(20);
    store.save(&b).unwrap();

    let active = store.load_active().unwrap().unwrap();
    assert_eq!(active.session_id, b.session_id);
}

#[test]
fn lease_exclusivity_expiry_and_reentrancy() {
    let store = SessionStore::open_in_memory().unwrap();
    let s = session(1);
    store.save(&s).unwrap();
    let now = Timestamp::new(100_000);

    assert!(store.acquire_lease(s.session_id, "owner-a", 60_000, now).unwrap());
    // foreign owner fails while the lease is fresh
    assert!(!store
        .acquire_lease(s.session_id, "owner-b", 60_000, now + 1_000)
        .unwrap());
    // same owner renews
    assert!(store
        .acquire_lease(s.session_id, "owner-a", 60_000, now + 2_000)
        .unwrap());
    // expiry frees it
    assert!(store
        .acquire_lease(s.session_id, "owner-b", 60_000, now + 70_000)
        .unwrap());

    store.release_lease(s.session_id, "owner-b").unwrap();
    assert!(store
        .acquire_lease(s.session_id, "owner-a", 60_000, now + 71_000)
        .unwrap());
}

#[test]
fn retry_queue_orders_and_claims() {
    let store = SessionStore::open_in_memory().unwrap();
    let s = session(3);
    store.save(&s).unwrap();

    let mut m1 = message(s.session_id, 0);
    m1.mark_pending_retry(Timestamp::new(8_000), "busy");
    let mut m2 = message(s.session_id, 1);
    m2.mark_pending_retry(Timestamp::new(5_000), "busy");
    let mut m3 = message(s.session_id, 2);
    m3.mark_pending_retry(Timestamp::new(99_000), "busy");
    for m in [&m1, &m2, &m3] {
        store.insert_message(m).unwrap();
    }

    assert_eq!(
        store.next_retry_at(s.session_id).unwrap(),
        Some(Timestamp::new(5_000))
    );
    assert_eq!(store.pending_retry_count(s.session_id).unwrap(), 3);

    // only due rows come back, ordered by wake-up time
    let due = store
        .drain_due(s.session_id, Timestamp::new(10_000), 30_000)
        .unwrap();
    let ids: Vec<_> = due.iter().map(|m| m.msg_id).collect();
    assert_eq!(ids, vec![m2.msg_id, m1.msg_id]);
    // claimed rows keep their queue status until the attempt resolves
    assert!(due.iter().all(|m| m.status == MessageStatus::PendingRetry));
    assert_eq!(store.pending_retry_count(s.session_id).unwrap(), 3);

    // claimed rows do not drain twice while the claim lease holds
    assert!(store
        .drain_due(s.session_id, Timestamp::new(10_000), 30_000)
        .unwrap()
        .is_empty());

    // resolving one attempt clears its claim and removes it from the queue
    store
        .update_message_status(
            m2.msg_id,
            MessageStatus::Sent,
            Some(Timestamp::new(11_000)),
            None,
        )
        .unwrap();
    assert_eq!(store.pending_retry_count(s.session_id).unwrap(), 2);

    // the unresolved claim expires and the row drains again
    let reclaimed = store
        .drain_due(s.session_id, Timestamp::new(41_000), 30_000)
        .unwrap();
    assert_eq!(
        reclaimed.iter().map(|m| m.msg_id).collect::<Vec<_>>(),
        vec![m1.msg_id]
    );
}

#[test]
fn next_retry_at_accounts_for_claim_leases() {
    let store = SessionStore::open_in_memory().unwrap();
    let s = session(1);
    store.save(&s).unwrap();

    let mut m = message(s.session_id, 0);
    m.mark_pending_retry(Timestamp::new(5_000), "busy");
    store.insert_message(&m).unwrap();

    store
        .drain_due(s.session_id, Timestamp::new(5_000), 30_000)
        .unwrap();
    // the effective wake-up for a claimed row is its claim expiry
    assert_eq!(
        store.next_retry_at(s.session_id).unwrap(),
        Some(Timestamp::new(35_000))
    );
}

#[test]
fn purge_and_clear_exhausted() {
    let store = SessionStore::open_in_memory().unwrap();
    let s = session(2);
    store.save(&s).unwrap();

    let mut m1 = message(s.session_id, 0);
    m1.mark_pending_retry(Timestamp::new(5_000), "busy");
    let mut m2 = message(s.session_id, 1);
    m2.mark_exhausted("E_TRANSPORT_TIMEOUT", "gave up");
    store.insert_message(&m1).unwrap();
    store.insert_message(&m2).unwrap();

    assert_eq!(store.purge_pending_retries(s.session_id).unwrap(), 1);
    let purged = store.message(m1.msg_id).unwrap();
    assert_eq!(purged.status, MessageStatus::Failed);
    assert_eq!(purged.error_code.as_deref(), Some("E_CANCELLED"));

    assert_eq!(store.clear_exhausted().unwrap(), 1);
    assert!(store.message(m2.msg_id).is_err());
}

#[test]
fn messages_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dispatch.db");
    let s = session(2);

    {
        let store = SessionStore::open(&path).unwrap();
        store.save(&s).unwrap();
        let mut m = message(s.session_id, 0);
        m.mark_pending_retry(Timestamp::new(4_000), "busy");
        store.insert_message(&m).unwrap();
        // process "crashes" here: store dropped without any cleanup
    }

    let store = SessionStore::open(&path).unwrap();
    let loaded = store.load(s.session_id).unwrap();
    assert_eq!(loaded.recipients.len(), 2);
    assert_eq!(store.pending_retry_count(s.session_id).unwrap(), 1);
    let due = store
        .drain_due(s.session_id, Timestamp::new(5_000), 30_000)
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].retry_count, 1);
}

#[test]
fn claimed_retry_is_reclaimed_after_crash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dispatch.db");
    let s = session(1);
    let msg_id;

    {
        let store = SessionStore::open(&path).unwrap();
        store.save(&s).unwrap();
        let mut m = message(s.session_id, 0);
        m.mark_pending_retry(Timestamp::new(4_000), "busy");
        store.insert_message(&m).unwrap();
        msg_id = m.msg_id;

        // the executor claims the retry...
        let claimed = store
            .drain_due(s.session_id, Timestamp::new(5_000), 30_000)
            .unwrap();
        assert_eq!(claimed.len(), 1);
        // ...and the process dies before resolving the attempt
    }

    let store = SessionStore::open(&path).unwrap();
    // the row is still queued, just leased
    assert_eq!(store.pending_retry_count(s.session_id).unwrap(), 1);

    // before the claim expires nothing drains
    assert!(store
        .drain_due(s.session_id, Timestamp::new(6_000), 30_000)
        .unwrap()
        .is_empty());

    // after expiry the retry comes back without spending budget
    let reclaimed = store
        .drain_due(s.session_id, Timestamp::new(36_000), 30_000)
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].msg_id, msg_id);
    assert_eq!(reclaimed[0].retry_count, 1);
}

#[test]
fn opt_outs_are_unique_and_visible_to_the_gate() {
    let store = SessionStore::open_in_memory().unwrap();
    let phone = PhoneNumber::parse("+254700000001").unwrap();

    assert!(!store.is_opted_out(&phone));
    store
        .add_opt_out(&OptOutRecord {
            phone: phone.clone(),
            reason: "STOP reply".into(),
            created_at: Timestamp::new(1_000),
        })
        .unwrap();
    // duplicate insert is a no-op
    store
        .add_opt_out(&OptOutRecord {
            phone: phone.clone(),
            reason: "again".into(),
            created_at: Timestamp::new(2_000),
        })
        .unwrap();

    assert!(store.is_opted_out(&phone));
    let records = store.opt_outs().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, "STOP reply");

    store.remove_opt_out(&phone).unwrap();
    assert!(!store.is_opted_out(&phone));
}

#[test]
fn schedules_round_trip_and_clear() {
    let store = SessionStore::open_in_memory().unwrap();
    let s1 = session(1);
    let s2 = session(1);
    store.save(&s1).unwrap();
    store.save(&s2).unwrap();

    store
        .put_schedule(
            s1.session_id,
            Timestamp::new(50_000),
            Some("Africa/Nairobi"),
            Timestamp::new(1_000),
        )
        .unwrap();
    store
        .put_schedule(s2.session_id, Timestamp::new(20_000), None, Timestamp::new(1_000))
        .unwrap();

    let all = store.all_schedules().unwrap();
    assert_eq!(all.len(), 2);
    // earliest first
    assert_eq!(all[0].session_id, s2.session_id);
    assert_eq!(all[1].timezone.as_deref(), Some("Africa/Nairobi"));

    store.remove_schedule(s2.session_id).unwrap();
    assert_eq!(store.all_schedules().unwrap().len(), 1);

    // clear removes the schedule along with the session
    store.clear(s1.session_id).unwrap();
    assert!(store.all_schedules().unwrap().is_empty());
    assert!(store.load(s1.session_id).is_err());
}

#[test]
fn update_message_status_preserves_existing_columns() {
    let store = SessionStore::open_in_memory().unwrap();
    let s = session(1);
    store.save(&s).unwrap();
    let m = message(s.session_id, 0);
    store.insert_message(&m).unwrap();

    store
        .update_message_status(
            m.msg_id,
            MessageStatus::Sent,
            Some(Timestamp::new(3_000)),
            None,
        )
        .unwrap();
    store
        .update_message_status(
            m.msg_id,
            MessageStatus::Delivered,
            None,
            Some(Timestamp::new(4_000)),
        )
        .unwrap();

    let loaded = store.message(m.msg_id).unwrap();
    assert_eq!(loaded.status, MessageStatus::Delivered);
    assert_eq!(loaded.sent_at, Some(Timestamp::new(3_000)));
    assert_eq!(loaded.delivered_at, Some(Timestamp::new(4_000)));
}
