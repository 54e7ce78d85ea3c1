use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use pbx_core::{Extension, TuState, wire};

use crate::link::Link;

/// Failure modes of `Tu::chat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatError {
    NoCallInProgress,
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::NoCallInProgress => write!(f, "no call in progress"),
        }
    }
}

impl std::error::Error for ChatError {}

/// Lock-guarded part of a telephone unit.
struct TuInner {
    /// Write half of the client connection. Goes down with the unit itself,
    /// which closes the handle exactly once.
    link: Box<dyn Link>,
    state: TuState,
    /// Present iff state is RINGING, RING_BACK or CONNECTED. Reciprocal with
    /// the far end except inside the critical section that links or unlinks.
    peer: Option<Arc<Tu>>,
}

impl TuInner {
    /// Writes one CRLF-terminated line to the client. Failures are swallowed:
    /// a dead connection must not abort the transition that produced the line.
    fn send_line(&mut self, tag: Extension, line: &str) {
        tracing::trace!("<- TU {}: {}", tag, line);
        let res = write!(self.link, "{}{}", line, wire::CRLF).and_then(|()| self.link.flush());
        if let Err(e) = res {
            tracing::trace!("TU {}: dropped notification ({})", tag, e);
        }
    }

    /// Notifies the unit of its current state.
    fn notify_state(&mut self, own: Extension) {
        let peer_ext = self.peer.as_ref().and_then(|p| p.extension());
        pbx_core::assert_warn!(
            self.state != TuState::Connected || peer_ext.is_some(),
            "TU {} connected without a peer extension",
            own
        );
        self.send_line(own, &wire::status_line(self.state, own, peer_ext));
    }

    fn transition(&mut self, own: Extension, new: TuState) {
        tracing::debug!("TU {}: {} -> {}", own, self.state, new);
        self.state = new;
    }
}

/// One telephone unit per client connection.
///
/// A unit is mutated both by its own servicing thread and by whichever thread
/// currently services its call peer, so everything except the extension sits
/// behind the unit's mutex. The extension is assigned once at registration
/// and read lock-free; two-unit operations use it to take both locks in a
/// canonical order.
pub struct Tu {
    extension: OnceLock<Extension>,
    inner: Mutex<TuInner>,
}

impl Tu {
    /// Creates the unit for a freshly accepted connection: on hook, no peer,
    /// and no extension until the directory registers it.
    pub fn new(link: Box<dyn Link>) -> Arc<Tu> {
        Arc::new(Tu {
            extension: OnceLock::new(),
            inner: Mutex::new(TuInner {
                link,
                state: TuState::OnHook,
                peer: None,
            }),
        })
    }

    /// The unit's extension, once registered.
    pub fn extension(&self) -> Option<Extension> {
        self.extension.get().copied()
    }

    pub fn state(&self) -> TuState {
        self.lock().state
    }

    /// The far end of the current link, if any.
    pub fn peer(&self) -> Option<Arc<Tu>> {
        self.lock().peer.clone()
    }

    fn lock(&self) -> MutexGuard<'_, TuInner> {
        // A poisoned lock means a thread panicked mid-transition; the call
        // state is beyond recovering at that point.
        self.inner.lock().unwrap()
    }

    /// Extension for lock ordering and log tags. Units are registered (and
    /// numbered) before any call operation can reach them.
    fn ext_order(&self) -> Extension {
        self.extension().unwrap_or(Extension::MAX)
    }

    /// Called by the directory, exactly once, under the directory lock.
    pub(crate) fn assign_extension(&self, ext: Extension) {
        pbx_core::assert_warn!(self.extension.set(ext).is_ok(), "extension {} reassigned", ext);
    }

    /// Re-announces the unit's current state on its own connection.
    pub(crate) fn notify_current(&self) {
        let Some(own) = self.extension() else { return };
        self.lock().notify_state(own);
    }

    /// Abortive close of the underlying connection, used by the shutdown
    /// coordinator. State and slot membership stay untouched; the servicing
    /// thread sees its blocked read fail and unregisters on its own.
    pub(crate) fn shutdown_link(&self) {
        let inner = self.lock();
        if let Err(e) = inner.link.shutdown_both() {
            tracing::trace!("TU {}: link shutdown failed ({})", self.ext_order(), e);
        }
    }

    /// Takes the handset off the cradle.
    ///
    /// ON_HOOK becomes DIAL_TONE; RINGING answers the call, connecting both
    /// ends. Anything else just re-notifies the current state.
    pub fn pickup(self: &Arc<Self>) {
        let Some(own) = self.extension() else {
            tracing::warn!("TU: pickup before registration");
            return;
        };
        loop {
            let snapshot = self.lock().peer.clone();
            match snapshot {
                None => {
                    let mut me = self.lock();
                    if me.peer.is_some() {
                        continue; // linked between snapshot and reacquisition
                    }
                    if me.state == TuState::OnHook {
                        me.transition(own, TuState::DialTone);
                    }
                    me.notify_state(own);
                    return;
                }
                Some(p) => {
                    let (mut me, mut them) = lock_pair(self, &p);
                    if !same_peer(&me.peer, &p) {
                        continue; // link changed in the window, re-run
                    }
                    if me.state == TuState::Ringing {
                        let pext = p.ext_order();
                        me.transition(own, TuState::Connected);
                        them.transition(pext, TuState::Connected);
                        me.notify_state(own);
                        them.notify_state(pext);
                    } else {
                        // Ring-back and connected take no pickup
                        me.notify_state(own);
                    }
                    return;
                }
            }
        }
    }

    /// Returns the handset to the cradle.
    ///
    /// Tears down any link: a CONNECTED or RINGING unit leaves its far end in
    /// DIAL_TONE, a RING_BACK caller takes the ringing far end back to
    /// ON_HOOK with it. Already on hook is a silent no-op.
    pub fn hangup(self: &Arc<Self>) {
        let Some(own) = self.extension() else {
            tracing::warn!("TU: hangup before registration");
            return;
        };
        loop {
            let snapshot = self.lock().peer.clone();
            match snapshot {
                None => {
                    let mut me = self.lock();
                    if me.peer.is_some() {
                        continue;
                    }
                    match me.state {
                        TuState::OnHook => return,
                        TuState::DialTone | TuState::BusySignal | TuState::Error => {
                            me.transition(own, TuState::OnHook);
                            me.notify_state(own);
                            return;
                        }
                        other => {
                            pbx_core::assert_warn!(false, "TU {} in {} with no peer link", own, other);
                            me.transition(own, TuState::OnHook);
                            me.notify_state(own);
                            return;
                        }
                    }
                }
                Some(p) => {
                    let (mut me, mut them) = lock_pair(self, &p);
                    if !same_peer(&me.peer, &p) {
                        continue;
                    }
                    let pext = p.ext_order();
                    match me.state {
                        TuState::Connected | TuState::Ringing => {
                            me.transition(own, TuState::OnHook);
                            them.transition(pext, TuState::DialTone);
                        }
                        TuState::RingBack => {
                            me.transition(own, TuState::OnHook);
                            them.transition(pext, TuState::OnHook);
                        }
                        other => {
                            pbx_core::assert_warn!(false, "TU {} holds a peer link in {}", own, other);
                            me.transition(own, TuState::OnHook);
                            them.transition(pext, TuState::DialTone);
                        }
                    }
                    me.peer = None;
                    them.peer = None;
                    me.notify_state(own);
                    them.notify_state(pext);
                    return;
                }
            }
        }
    }

    /// Dials `target`, the unit resolved for a requested extension (absent
    /// when no such extension is registered).
    ///
    /// Only meaningful in DIAL_TONE; any other state just re-notifies. An
    /// unresolvable extension puts the dialer in ERROR, dialing yourself or a
    /// busy unit yields BUSY_SIGNAL, and otherwise the far end starts
    /// RINGING while the dialer hears RING_BACK.
    pub fn dial(self: &Arc<Self>, target: Option<&Arc<Tu>>) {
        let Some(own) = self.extension() else {
            tracing::warn!("TU: dial before registration");
            return;
        };
        match target {
            None => {
                let mut me = self.lock();
                if me.state == TuState::DialTone {
                    me.transition(own, TuState::Error);
                }
                me.notify_state(own);
            }
            Some(target) if Arc::ptr_eq(self, target) => {
                let mut me = self.lock();
                if me.state == TuState::DialTone {
                    me.transition(own, TuState::BusySignal);
                }
                me.notify_state(own);
            }
            Some(target) => {
                let (mut me, mut them) = lock_pair(self, target);
                if me.state != TuState::DialTone {
                    me.notify_state(own);
                } else if them.peer.is_some() || them.state != TuState::OnHook {
                    // The busy far end is left untouched and gets no line
                    me.transition(own, TuState::BusySignal);
                    me.notify_state(own);
                } else {
                    let target_ext = target.ext_order();
                    me.peer = Some(target.clone());
                    them.peer = Some(self.clone());
                    me.transition(own, TuState::RingBack);
                    them.transition(target_ext, TuState::Ringing);
                    me.notify_state(own);
                    them.notify_state(target_ext);
                }
            }
        }
    }

    /// Relays a chat line to the connected far end.
    ///
    /// Works only while CONNECTED; the far end receives `chat <text>`
    /// verbatim and the sender is re-notified its own state.
    pub fn chat(self: &Arc<Self>, text: &str) -> Result<(), ChatError> {
        let Some(own) = self.extension() else {
            tracing::warn!("TU: chat before registration");
            return Err(ChatError::NoCallInProgress);
        };
        loop {
            let snapshot = self.lock().peer.clone();
            match snapshot {
                None => {
                    let me = self.lock();
                    if me.peer.is_some() {
                        continue;
                    }
                    return Err(ChatError::NoCallInProgress);
                }
                Some(p) => {
                    let (mut me, mut them) = lock_pair(self, &p);
                    if !same_peer(&me.peer, &p) {
                        continue;
                    }
                    if me.state != TuState::Connected {
                        // Ringing or ring-back: the link exists, the call does not
                        return Err(ChatError::NoCallInProgress);
                    }
                    them.send_line(p.ext_order(), &wire::chat_line(text));
                    me.notify_state(own);
                    return Ok(());
                }
            }
        }
    }
}

impl Drop for Tu {
    fn drop(&mut self) {
        // The boxed link goes down with the unit, after the directory and any
        // peer released their handles; the connection closes exactly once.
        tracing::trace!("TU {:?}: destroyed", self.extension.get());
    }
}

/// Locks two units in the canonical order: lowest extension first, whichever
/// side initiated. Guards come back in argument order. Without the canonical
/// order, two units dialing each other concurrently deadlock.
fn lock_pair<'a>(a: &'a Tu, b: &'a Tu) -> (MutexGuard<'a, TuInner>, MutexGuard<'a, TuInner>) {
    debug_assert!(!std::ptr::eq(a, b));
    if a.ext_order() <= b.ext_order() {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}

fn same_peer(current: &Option<Arc<Tu>>, expected: &Arc<Tu>) -> bool {
    current.as_ref().is_some_and(|p| Arc::ptr_eq(p, expected))
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::Barrier;
    use std::thread;

    use pbx_core::debug;

    use crate::testutil::{register_unit, test_pbx};

    #[test]
    fn pickup_gives_dial_tone() {
        let pbx = test_pbx(4);
        let (tu, link) = register_unit(&pbx);
        assert_eq!(link.take_lines(), vec!["ON HOOK 0"]);

        tu.pickup();
        assert_eq!(tu.state(), TuState::DialTone);
        assert_eq!(link.take_lines(), vec!["DIAL TONE"]);
    }

    #[test]
    fn pickup_renotifies_when_already_off_hook() {
        let pbx = test_pbx(4);
        let (tu, link) = register_unit(&pbx);
        tu.pickup();
        link.take_lines();

        tu.pickup();
        assert_eq!(tu.state(), TuState::DialTone);
        assert_eq!(link.take_lines(), vec!["DIAL TONE"]);
    }

    #[test]
    fn dial_unknown_extension_enters_error() {
        let pbx = test_pbx(4);
        let (tu, link) = register_unit(&pbx);
        tu.pickup();
        link.take_lines();

        tu.dial(None);
        assert_eq!(tu.state(), TuState::Error);
        assert_eq!(link.take_lines(), vec!["ERROR"]);

        // Repeating the dial outside DIAL_TONE only re-notifies
        tu.dial(None);
        assert_eq!(tu.state(), TuState::Error);
        assert_eq!(link.take_lines(), vec!["ERROR"]);
    }

    #[test]
    fn dial_outside_dial_tone_renotifies() {
        let pbx = test_pbx(4);
        let (tu, link) = register_unit(&pbx);
        link.take_lines();

        // Still on hook: no ERROR manufactured even for an unknown extension
        tu.dial(None);
        assert_eq!(tu.state(), TuState::OnHook);
        assert_eq!(link.take_lines(), vec!["ON HOOK 0"]);
    }

    #[test]
    fn self_dial_gets_busy_signal() {
        let pbx = test_pbx(4);
        let (tu, link) = register_unit(&pbx);
        tu.pickup();
        link.take_lines();

        tu.dial(Some(&tu));
        assert_eq!(tu.state(), TuState::BusySignal);
        assert!(tu.peer().is_none());
        assert_eq!(link.take_lines(), vec!["BUSY SIGNAL"]);

        // Busy signal is sticky until hangup
        tu.dial(Some(&tu));
        assert_eq!(tu.state(), TuState::BusySignal);
        assert_eq!(link.take_lines(), vec!["BUSY SIGNAL"]);
    }

    #[test]
    fn dial_connects_ring_pair() {
        let pbx = test_pbx(4);
        let (a, la) = register_unit(&pbx);
        let (b, lb) = register_unit(&pbx);
        a.pickup();
        la.take_lines();
        lb.take_lines();

        a.dial(Some(&b));
        assert_eq!(a.state(), TuState::RingBack);
        assert_eq!(b.state(), TuState::Ringing);
        assert_eq!(la.take_lines(), vec!["RING BACK"]);
        assert_eq!(lb.take_lines(), vec!["RINGING"]);

        // Peer links are reciprocal
        assert!(Arc::ptr_eq(&a.peer().unwrap(), &b));
        assert!(Arc::ptr_eq(&b.peer().unwrap(), &a));
    }

    #[test]
    fn dial_busy_target_leaves_target_alone() {
        let pbx = test_pbx(4);
        let (a, la) = register_unit(&pbx);
        let (b, lb) = register_unit(&pbx);
        a.pickup();
        b.pickup();
        la.take_lines();
        lb.take_lines();

        a.dial(Some(&b));
        assert_eq!(a.state(), TuState::BusySignal);
        assert_eq!(b.state(), TuState::DialTone);
        assert!(b.peer().is_none());
        assert_eq!(la.take_lines(), vec!["BUSY SIGNAL"]);
        assert_eq!(lb.take_lines(), Vec::<String>::new());
    }

    #[test]
    fn answer_establishes_connected() {
        debug::setup_logging_verbose();
        let pbx = test_pbx(4);
        let (a, la) = register_unit(&pbx);
        let (b, lb) = register_unit(&pbx);
        a.pickup();
        a.dial(Some(&b));
        la.take_lines();
        lb.take_lines();

        b.pickup();
        assert_eq!(a.state(), TuState::Connected);
        assert_eq!(b.state(), TuState::Connected);
        assert_eq!(lb.take_lines(), vec!["CONNECTED 0"]);
        assert_eq!(la.take_lines(), vec!["CONNECTED 1"]);
    }

    #[test]
    fn chat_outside_connected_fails() {
        let pbx = test_pbx(4);
        let (a, la) = register_unit(&pbx);
        let (b, lb) = register_unit(&pbx);
        assert_eq!(a.chat("anyone there"), Err(ChatError::NoCallInProgress));

        // A ringing link is still not a call
        a.pickup();
        a.dial(Some(&b));
        la.take_lines();
        lb.take_lines();
        assert_eq!(a.chat("pick up already"), Err(ChatError::NoCallInProgress));
        assert_eq!(la.take_lines(), Vec::<String>::new());
        assert_eq!(lb.take_lines(), Vec::<String>::new());
    }

    #[test]
    fn chat_relays_to_peer() {
        let pbx = test_pbx(4);
        let (a, la) = register_unit(&pbx);
        let (b, lb) = register_unit(&pbx);
        a.pickup();
        a.dial(Some(&b));
        b.pickup();
        la.take_lines();
        lb.take_lines();

        assert_eq!(a.chat("hi there"), Ok(()));
        assert_eq!(lb.take_lines(), vec!["chat hi there"]);
        // The sender hears its own state again
        assert_eq!(la.take_lines(), vec!["CONNECTED 1"]);
    }

    #[test]
    fn hangup_connected_peer_hears_dial_tone() {
        let pbx = test_pbx(4);
        let (a, la) = register_unit(&pbx);
        let (b, lb) = register_unit(&pbx);
        a.pickup();
        a.dial(Some(&b));
        b.pickup();
        la.take_lines();
        lb.take_lines();

        a.hangup();
        assert_eq!(a.state(), TuState::OnHook);
        assert_eq!(b.state(), TuState::DialTone);
        assert!(a.peer().is_none());
        assert!(b.peer().is_none());
        assert_eq!(la.take_lines(), vec!["ON HOOK 0"]);
        assert_eq!(lb.take_lines(), vec!["DIAL TONE"]);
    }

    #[test]
    fn ringing_callee_hangup_gives_caller_dial_tone() {
        let pbx = test_pbx(4);
        let (a, la) = register_unit(&pbx);
        let (b, lb) = register_unit(&pbx);
        a.pickup();
        a.dial(Some(&b));
        la.take_lines();
        lb.take_lines();

        b.hangup();
        assert_eq!(b.state(), TuState::OnHook);
        assert_eq!(a.state(), TuState::DialTone);
        assert_eq!(lb.take_lines(), vec!["ON HOOK 1"]);
        assert_eq!(la.take_lines(), vec!["DIAL TONE"]);
    }

    #[test]
    fn caller_abandons_ring_back() {
        let pbx = test_pbx(4);
        let (a, la) = register_unit(&pbx);
        let (b, lb) = register_unit(&pbx);
        a.pickup();
        a.dial(Some(&b));
        la.take_lines();
        lb.take_lines();

        a.hangup();
        assert_eq!(a.state(), TuState::OnHook);
        assert_eq!(b.state(), TuState::OnHook);
        assert_eq!(la.take_lines(), vec!["ON HOOK 0"]);
        assert_eq!(lb.take_lines(), vec!["ON HOOK 1"]);
    }

    #[test]
    fn hangup_on_hook_is_silent() {
        let pbx = test_pbx(4);
        let (tu, link) = register_unit(&pbx);
        link.take_lines();

        tu.hangup();
        assert_eq!(tu.state(), TuState::OnHook);
        assert_eq!(link.take_lines(), Vec::<String>::new());
    }

    #[test]
    fn arc_ownership_follows_link_lifecycle() {
        let pbx = test_pbx(4);
        let (a, _la) = register_unit(&pbx);
        let (b, _lb) = register_unit(&pbx);
        let b_ext = b.extension().unwrap();

        // Registered, unlinked: one local handle plus the directory slot
        assert_eq!(Arc::strong_count(&a), 2);

        a.pickup();
        pbx.dial(&a, b_ext).unwrap();
        assert_eq!(Arc::strong_count(&a), 3);
        assert_eq!(Arc::strong_count(&b), 3);

        a.hangup();
        assert_eq!(Arc::strong_count(&a), 2);
        assert_eq!(Arc::strong_count(&b), 2);

        pbx.unregister(&a).unwrap();
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn cross_dial_never_deadlocks() {
        let pbx = Arc::new(test_pbx(4));
        let (a, _la) = register_unit(&pbx);
        let (b, _lb) = register_unit(&pbx);
        let a_ext = a.extension().unwrap();
        let b_ext = b.extension().unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let t1 = {
            let pbx = pbx.clone();
            let a = a.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    barrier.wait();
                    a.pickup();
                    pbx.dial(&a, b_ext).unwrap();
                    a.hangup();
                }
            })
        };
        let t2 = {
            let pbx = pbx.clone();
            let b = b.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    barrier.wait();
                    b.pickup();
                    pbx.dial(&b, a_ext).unwrap();
                    b.hangup();
                }
            })
        };
        t1.join().unwrap();
        t2.join().unwrap();

        a.hangup();
        b.hangup();
        assert_eq!(a.state(), TuState::OnHook);
        assert_eq!(b.state(), TuState::OnHook);
        assert!(a.peer().is_none());
        assert!(b.peer().is_none());
    }
}
