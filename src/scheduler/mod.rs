use crate::error::{Error, Result};
use crate::protocol::peer_id::PeerId;
use crate::protocol::OpId;
use crate::OwnedJoinHandle;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

/// Payload of a pending operation.
pub trait AsyncOp: Send + 'static {
    fn kind(&self) -> &'static str;
    /// Called exactly once when the op leaves the scheduler without a result
    /// (timeout, group cancellation or scheduler shutdown).
    fn cancel(self, reason: Error);
}

struct Entry<P> {
    op: P,
    deadline: Instant,
    key: Option<PeerId>,
}

struct State<P> {
    next_id: OpId,
    ops: HashMap<OpId, Entry<P>>,
    timeline: BTreeSet<(Instant, OpId)>,
}

struct Shared<P: AsyncOp> {
    state: Mutex<State<P>>,
    rearm: Arc<Notify>,
}

/// Table of in-flight operations ordered by deadline.
///
/// A single timer task sleeps until the earliest deadline. Every op ends
/// through exactly one of [`AsyncOpScheduler::take_ready`] or
/// [`AsyncOp::cancel`]. Cancellation callbacks run outside the internal lock
/// but in the caller's context, so callers of `cancel_group` must not hold
/// locks the callbacks take.
pub struct AsyncOpScheduler<P: AsyncOp> {
    shared: Arc<Shared<P>>,
    _timer: Arc<OwnedJoinHandle>,
}

impl<P: AsyncOp> Clone for AsyncOpScheduler<P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _timer: self._timer.clone(),
        }
    }
}

impl<P: AsyncOp> Default for AsyncOpScheduler<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: AsyncOp> AsyncOpScheduler<P> {
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let rearm = Arc::new(Notify::new());
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                next_id: 1,
                ops: HashMap::new(),
                timeline: BTreeSet::new(),
            }),
            rearm: rearm.clone(),
        });
        let handle = tokio::spawn(timer_loop(Arc::downgrade(&shared), rearm));
        Self {
            shared,
            _timer: Arc::new(OwnedJoinHandle::new(handle)),
        }
    }

    pub fn gen_id(&self) -> OpId {
        let mut state = self.shared.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    pub fn add(&self, op: P, deadline: Instant, key: Option<PeerId>) -> OpId {
        let id = self.gen_id();
        self.add_with_id(id, op, deadline, key);
        id
    }

    /// Inserts with an id obtained from [`AsyncOpScheduler::gen_id`].
    pub fn add_with_id(&self, id: OpId, op: P, deadline: Instant, key: Option<PeerId>) {
        let earliest = {
            let mut state = self.shared.state.lock();
            if let Some(old) = state.ops.remove(&id) {
                log::warn!("replacing pending {} op {id}", old.op.kind());
                state.timeline.remove(&(old.deadline, id));
            }
            state.ops.insert(id, Entry { op, deadline, key });
            state.timeline.insert((deadline, id));
            state.timeline.first().map(|(_, first)| *first) == Some(id)
        };
        if earliest {
            self.shared.rearm.notify_one();
        }
    }

    /// Removes the op if it is still pending. `None` means it already ended.
    pub fn take_ready(&self, id: OpId) -> Option<P> {
        let mut state = self.shared.state.lock();
        let entry = state.ops.remove(&id)?;
        state.timeline.remove(&(entry.deadline, id));
        Some(entry.op)
    }

    /// Runs `f` on a still pending op.
    pub fn with_op<R>(&self, id: OpId, f: impl FnOnce(&mut P) -> R) -> Option<R> {
        let mut state = self.shared.state.lock();
        state.ops.get_mut(&id).map(|entry| f(&mut entry.op))
    }

    pub fn contains(&self, id: OpId) -> bool {
        self.shared.state.lock().ops.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time left until the deadline of a pending op.
    pub fn lasting_time(&self, id: OpId) -> Option<Duration> {
        let state = self.shared.state.lock();
        state
            .ops
            .get(&id)
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn cancel_group(&self, key: &PeerId, reason: Error) {
        let removed = {
            let mut state = self.shared.state.lock();
            let ids: Vec<OpId> = state
                .ops
                .iter()
                .filter(|(_, entry)| entry.key.as_ref() == Some(key))
                .map(|(id, _)| *id)
                .collect();
            remove_ids(&mut state, ids)
        };
        for op in removed {
            op.cancel(reason.clone());
        }
    }

    pub fn cancel_all(&self, reason: Error) {
        let removed = {
            let mut state = self.shared.state.lock();
            let ids: Vec<OpId> = state.timeline.iter().map(|(_, id)| *id).collect();
            remove_ids(&mut state, ids)
        };
        for op in removed {
            op.cancel(reason.clone());
        }
    }
}

fn remove_ids<P>(state: &mut State<P>, mut ids: Vec<OpId>) -> Vec<P> {
    let mut entries: Vec<(Instant, OpId, P)> = Vec::with_capacity(ids.len());
    for id in ids.drain(..) {
        if let Some(entry) = state.ops.remove(&id) {
            state.timeline.remove(&(entry.deadline, id));
            entries.push((entry.deadline, id, entry.op));
        }
    }
    entries.sort_by_key(|(deadline, id, _)| (*deadline, *id));
    entries.into_iter().map(|(_, _, op)| op).collect()
}

impl<P: AsyncOp> Shared<P> {
    fn expire(&self) -> Option<Instant> {
        let now = Instant::now();
        let expired = {
            let mut state = self.state.lock();
            let ids: Vec<OpId> = state
                .timeline
                .iter()
                .take_while(|(deadline, _)| *deadline <= now)
                .map(|(_, id)| *id)
                .collect();
            remove_ids(&mut state, ids)
        };
        for op in expired {
            log::debug!("{} op timed out", op.kind());
            op.cancel(Error::Timeout);
        }
        self.state.lock().timeline.first().map(|(deadline, _)| *deadline)
    }
}

impl<P: AsyncOp> Drop for Shared<P> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.timeline.clear();
        for (_, entry) in state.ops.drain() {
            entry.op.cancel(Error::Canceled);
        }
    }
}

async fn timer_loop<P: AsyncOp>(shared: Weak<Shared<P>>, rearm: Arc<Notify>) {
    loop {
        let next = match shared.upgrade() {
            Some(shared) => shared.expire(),
            None => return,
        };
        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = rearm.notified() => {}
                }
            }
            None => rearm.notified().await,
        }
    }
}

/// Op whose result is delivered through a oneshot slot.
pub struct Pending<T> {
    kind: &'static str,
    reply: oneshot::Sender<Result<T>>,
}

pub struct PendingResult<T>(oneshot::Receiver<Result<T>>);

impl<T: Send + 'static> Pending<T> {
    pub fn new(kind: &'static str) -> (Self, PendingResult<T>) {
        let (reply, receiver) = oneshot::channel();
        (Self { kind, reply }, PendingResult(receiver))
    }
    pub fn complete(self, result: Result<T>) {
        _ = self.reply.send(result);
    }
}

impl<T> PendingResult<T> {
    pub async fn wait(self) -> Result<T> {
        self.0.await.unwrap_or(Err(Error::Canceled))
    }
}

impl<T: Send + 'static> AsyncOp for Pending<T> {
    fn kind(&self) -> &'static str {
        self.kind
    }
    fn cancel(self, reason: Error) {
        _ = self.reply.send(Err(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted(Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>, &'static str);

    impl AsyncOp for Counted {
        fn kind(&self) -> &'static str {
            "counted"
        }
        fn cancel(self, reason: Error) {
            self.0.fetch_add(1, Ordering::SeqCst);
            self.1.lock().push(format!("{}:{}", self.2, reason.name()));
        }
    }

    #[tokio::test]
    async fn unanswered_op_times_out_once() {
        let scheduler = AsyncOpScheduler::new();
        let (op, result) = Pending::<()>::new("test");
        let start = Instant::now();
        let id = scheduler.add(op, start + Duration::from_millis(50), None);
        assert!(scheduler.contains(id));
        let r = result.wait().await;
        let elapsed = start.elapsed();
        assert!(matches!(r, Err(Error::Timeout)));
        assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(60), "{elapsed:?}");
        assert!(!scheduler.contains(id));
        assert!(scheduler.take_ready(id).is_none());
    }

    #[tokio::test]
    async fn take_ready_wins_against_timeout() {
        let scheduler = AsyncOpScheduler::new();
        let (op, result) = Pending::<u32>::new("test");
        let id = scheduler.add(op, Instant::now() + Duration::from_millis(20), None);
        let op = scheduler.take_ready(id).unwrap();
        op.complete(Ok(5));
        assert_eq!(result.wait().await.unwrap(), 5);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn expiry_follows_deadline_order() {
        let scheduler = AsyncOpScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));
        let now = Instant::now();
        scheduler.add(
            Counted(count.clone(), log.clone(), "late"),
            now + Duration::from_millis(30),
            None,
        );
        scheduler.add(
            Counted(count.clone(), log.clone(), "early"),
            now + Duration::from_millis(10),
            None,
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(*log.lock(), vec!["early:TimeOut", "late:TimeOut"]);
    }

    #[tokio::test]
    async fn cancel_group_only_touches_key() {
        let scheduler = AsyncOpScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));
        let deadline = Instant::now() + Duration::from_secs(10);
        let alice = PeerId::from("alice");
        scheduler.add(
            Counted(count.clone(), log.clone(), "a1"),
            deadline,
            Some(alice.clone()),
        );
        scheduler.add(
            Counted(count.clone(), log.clone(), "a2"),
            deadline,
            Some(alice.clone()),
        );
        let other = scheduler.add(
            Counted(count.clone(), log.clone(), "b"),
            deadline,
            Some("bob".into()),
        );
        scheduler.cancel_group(&alice, Error::Canceled);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(scheduler.contains(other));
        scheduler.cancel_group(&alice, Error::Canceled);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropping_scheduler_cancels_pending() {
        let scheduler = AsyncOpScheduler::new();
        let (op, result) = Pending::<()>::new("test");
        scheduler.add(op, Instant::now() + Duration::from_secs(10), None);
        drop(scheduler);
        assert!(matches!(result.wait().await, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn later_earlier_deadline_rearms_timer() {
        let scheduler = AsyncOpScheduler::new();
        let (slow, _slow_result) = Pending::<()>::new("slow");
        scheduler.add(slow, Instant::now() + Duration::from_secs(10), None);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (fast, fast_result) = Pending::<()>::new("fast");
        let start = Instant::now();
        scheduler.add(fast, start + Duration::from_millis(20), None);
        assert!(matches!(fast_result.wait().await, Err(Error::Timeout)));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(scheduler.len(), 1);
    }
}
