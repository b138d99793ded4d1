//! Session-level delivery rules from the gateway's fan-out decision
//! (`Session::should_receive_event`) and the per-connection sequence
//! counter the RESUME opcode relies on. `handler.rs` owns the live
//! socket plumbing around these and has no public surface to unit test;
//! `Session` is the pure state it drives.

use std::collections::HashMap;

use amityvox_ws::session::Session;

#[test]
fn sequence_starts_at_zero_and_increments_monotonically() {
    let mut session = Session::new(1, vec![10], HashMap::new());
    assert_eq!(session.sequence, 0);
    assert_eq!(session.next_sequence(), 1);
    assert_eq!(session.next_sequence(), 2);
    assert_eq!(session.next_sequence(), 3);
    assert_eq!(session.sequence, 3);
}

#[test]
fn global_events_with_no_guild_scope_reach_every_session() {
    let session = Session::new(1, vec![], HashMap::new());
    assert!(session.should_receive_event(None, None));
}

#[test]
fn guild_scoped_events_require_membership() {
    let session = Session::new(1, vec![10, 20], HashMap::new());
    assert!(session.should_receive_event(Some(10), None));
    assert!(session.should_receive_event(Some(20), None));
    assert!(!session.should_receive_event(Some(30), None));
}

#[test]
fn targeted_events_bypass_guild_scope_and_only_reach_named_users() {
    let member = Session::new(1, vec![10], HashMap::new());
    let stranger = Session::new(2, vec![10], HashMap::new());
    let outsider = Session::new(3, vec![], HashMap::new());

    let targets = [1_i64];
    // The target is in the list but not in the guild the event is scoped
    // to: targeting still wins.
    assert!(member.should_receive_event(Some(999), Some(&targets)));
    assert!(!stranger.should_receive_event(Some(10), Some(&targets)));
    assert!(!outsider.should_receive_event(None, Some(&targets)));
}

#[test]
fn add_guild_is_idempotent() {
    let mut session = Session::new(1, vec![10], HashMap::new());
    session.add_guild(20, 999);
    session.add_guild(10, 111);
    session.add_guild(20, 999);
    assert_eq!(session.guild_ids, vec![10, 20]);
    assert_eq!(session.guild_owner_ids.get(&20), Some(&999));
}
