//! Membership change notifications.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tracing::warn;

use crate::member::Member;

/// Observer of member list changes.
///
/// Callbacks run on the service thread in the order changes are applied,
/// after the member view has been updated. A slow listener delays every
/// later membership job.
pub trait MembershipListener: Send + Sync {
    fn member_added(&self, _member: &Member) {}

    fn member_removed(&self, _member: &Member) {}
}

/// Report the difference between two member lists. A member whose UUID
/// changed counts as removed and added again.
pub(crate) fn notify(listeners: &[Arc<dyn MembershipListener>], before: &[Member], after: &[Member]) {
    if listeners.is_empty() {
        return;
    }
    let same = |a: &Member, b: &Member| a.address == b.address && a.uuid == b.uuid;

    for member in before.iter().filter(|m| !after.iter().any(|n| same(m, n))) {
        for listener in listeners {
            guarded("member_removed", || listener.member_removed(member));
        }
    }
    for member in after.iter().filter(|m| !before.iter().any(|n| same(m, n))) {
        for listener in listeners {
            guarded("member_added", || listener.member_added(member));
        }
    }
}

fn guarded(callback: &'static str, f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(callback, "membership listener panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::NodeRole;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Events(Mutex<Vec<String>>);

    impl MembershipListener for Events {
        fn member_added(&self, member: &Member) {
            self.0.lock().push(format!("+{}/{}", member.address, member.uuid));
        }

        fn member_removed(&self, member: &Member) {
            self.0.lock().push(format!("-{}/{}", member.address, member.uuid));
        }
    }

    struct Exploding;

    impl MembershipListener for Exploding {
        fn member_added(&self, _member: &Member) {
            panic!("listener bug");
        }
    }

    fn member(addr: &str, uuid: &str) -> Member {
        Member::new(addr.parse().unwrap(), uuid, NodeRole::Full)
    }

    #[test]
    fn removals_are_reported_before_additions() {
        let events = Arc::new(Events::default());
        let listeners: Vec<Arc<dyn MembershipListener>> = vec![events.clone()];

        notify(
            &listeners,
            &[member("10.0.0.1:5701", "a"), member("10.0.0.2:5701", "b")],
            &[member("10.0.0.1:5701", "a"), member("10.0.0.3:5701", "c")],
        );
        assert_eq!(
            *events.0.lock(),
            vec!["-10.0.0.2:5701/b".to_string(), "+10.0.0.3:5701/c".to_string()]
        );
    }

    #[test]
    fn new_uuid_is_a_new_member() {
        let events = Arc::new(Events::default());
        let listeners: Vec<Arc<dyn MembershipListener>> = vec![events.clone()];

        notify(&listeners, &[member("10.0.0.1:5701", "old")], &[member("10.0.0.1:5701", "new")]);
        assert_eq!(
            *events.0.lock(),
            vec!["-10.0.0.1:5701/old".to_string(), "+10.0.0.1:5701/new".to_string()]
        );
    }

    #[test]
    fn panicking_listener_does_not_starve_the_rest() {
        let events = Arc::new(Events::default());
        let listeners: Vec<Arc<dyn MembershipListener>> = vec![Arc::new(Exploding), events.clone()];

        notify(&listeners, &[], &[member("10.0.0.1:5701", "a")]);
        assert_eq!(*events.0.lock(), vec!["+10.0.0.1:5701/a".to_string()]);
    }
}
