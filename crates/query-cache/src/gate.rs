//! Execution gate: at most one in-flight execution per key
//!
//! The first caller for a key becomes the leader and executes; later callers
//! become followers and block until the leader publishes a streaming buffer,
//! completes, fails, or goes away. A leader that is dropped without
//! resolving releases its followers with [`CacheError::Cancelled`].

use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;
use crate::materializer::{MaterializedRows, RowBuffer};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use query_core::QueryError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
enum FlightState {
    Running,
    Streaming(Arc<RowBuffer>),
    Done(MaterializedRows),
    Failed(Arc<QueryError>),
    Cancelled,
}

#[derive(Debug)]
struct Flight {
    state: Mutex<FlightState>,
    ready: Condvar,
    waiters: AtomicUsize,
}

impl Flight {
    fn new() -> Self {
        Self {
            state: Mutex::new(FlightState::Running),
            ready: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    fn set(&self, state: FlightState) {
        *self.state.lock() = state;
        self.ready.notify_all();
    }
}

type FlightMap = DashMap<CacheKey, Arc<Flight>, ahash::RandomState>;

/// What a follower receives from its leader
#[derive(Debug)]
pub enum FlightOutcome {
    /// The complete, sealed row set
    Ready(MaterializedRows),
    /// A buffer the leader is still filling
    Streaming(Arc<RowBuffer>),
}

/// Role assigned by [`ExecutionGate::admit`]
#[derive(Debug)]
pub enum Admission {
    Leader(LeaderGuard),
    Follower(FollowerTicket),
}

/// Per-key single-flight coordinator
#[derive(Debug, Default)]
pub struct ExecutionGate {
    flights: Arc<FlightMap>,
}

impl ExecutionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the leader for `key`, or follow the execution already running
    pub fn admit(&self, key: &CacheKey) -> Admission {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                let flight = Arc::clone(occupied.get());
                flight.waiters.fetch_add(1, Ordering::Relaxed);
                Admission::Follower(FollowerTicket { flight })
            }
            Entry::Vacant(vacant) => {
                let flight = Arc::new(Flight::new());
                vacant.insert(Arc::clone(&flight));
                Admission::Leader(LeaderGuard {
                    flights: Arc::clone(&self.flights),
                    key: key.clone(),
                    flight,
                    resolved: false,
                })
            }
        }
    }

    /// Number of keys with an execution in flight
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Followers currently attached to the execution for `key`
    pub fn waiters(&self, key: &CacheKey) -> usize {
        self.flights
            .get(key)
            .map_or(0, |flight| flight.waiters.load(Ordering::Relaxed))
    }
}

/// Held by the one caller executing a key
#[derive(Debug)]
pub struct LeaderGuard {
    flights: Arc<FlightMap>,
    key: CacheKey,
    flight: Arc<Flight>,
    resolved: bool,
}

impl LeaderGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Let followers attach to a buffer that is still being filled
    pub fn publish(&self, buffer: Arc<RowBuffer>) {
        self.flight.set(FlightState::Streaming(buffer));
    }

    /// Hand the finished rows to every follower
    pub fn complete(mut self, rows: MaterializedRows) {
        self.resolve(FlightState::Done(rows));
    }

    /// Hand the same failure to every follower
    pub fn fail(mut self, error: Arc<QueryError>) {
        self.resolve(FlightState::Failed(error));
    }

    fn resolve(&mut self, state: FlightState) {
        self.resolved = true;
        // woken followers that retry must not find this flight again
        self.flights
            .remove_if(&self.key, |_, flight| Arc::ptr_eq(flight, &self.flight));
        self.flight.set(state);
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.resolved {
            self.resolve(FlightState::Cancelled);
        }
    }
}

/// Held by a caller waiting on someone else's execution
#[derive(Debug)]
pub struct FollowerTicket {
    flight: Arc<Flight>,
}

impl FollowerTicket {
    /// Block until the leader resolves, for at most `timeout`
    pub fn wait(self, timeout: Duration) -> CacheResult<FlightOutcome> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.flight.state.lock();

        while matches!(*state, FlightState::Running) {
            let timed_out = match deadline {
                Some(deadline) => self.flight.ready.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.flight.ready.wait(&mut state);
                    false
                }
            };
            if timed_out && matches!(*state, FlightState::Running) {
                return Err(CacheError::WaitTimeout(timeout));
            }
        }

        match &*state {
            FlightState::Streaming(buffer) => Ok(FlightOutcome::Streaming(Arc::clone(buffer))),
            FlightState::Done(rows) => Ok(FlightOutcome::Ready(rows.clone())),
            FlightState::Failed(error) => Err(CacheError::Materialization(Arc::clone(error))),
            FlightState::Cancelled | FlightState::Running => Err(CacheError::Cancelled),
        }
    }
}

impl Drop for FollowerTicket {
    fn drop(&mut self) {
        self.flight.waiters.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::Scope;
    use crate::key::KeyDeriver;
    use crate::materializer::tests::create_test_batch;
    use query_core::{Command, ExecutionContext, VdbId};
    use std::thread;

    fn key(sql: &str) -> CacheKey {
        let ctx = ExecutionContext::new(VdbId::new("vdb", "1"));
        KeyDeriver::derive(&Command::query(sql), Scope::Vdb, &ctx).unwrap()
    }

    fn leader(admission: Admission) -> LeaderGuard {
        match admission {
            Admission::Leader(guard) => guard,
            Admission::Follower(_) => panic!("expected leader"),
        }
    }

    fn follower(admission: Admission) -> FollowerTicket {
        match admission {
            Admission::Follower(ticket) => ticket,
            Admission::Leader(_) => panic!("expected follower"),
        }
    }

    #[test]
    fn test_single_leader_per_key() {
        let gate = ExecutionGate::new();
        let k = key("SELECT 1");

        let guard = leader(gate.admit(&k));
        let ticket = follower(gate.admit(&k));
        assert_eq!(gate.waiters(&k), 1);
        assert!(matches!(gate.admit(&key("SELECT 2")), Admission::Leader(_)));

        drop(ticket);
        assert_eq!(gate.waiters(&k), 0);
        drop(guard);
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_followers_receive_rows() {
        let gate = Arc::new(ExecutionGate::new());
        let k = key("SELECT 1");
        let guard = leader(gate.admit(&k));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ticket = follower(gate.admit(&k));
                thread::spawn(move || ticket.wait(Duration::from_secs(5)))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        let rows = MaterializedRows::new(vec![create_test_batch(vec![1, 2])]);
        guard.complete(rows.clone());

        for handle in handles {
            match handle.join().unwrap().unwrap() {
                FlightOutcome::Ready(received) => assert!(received.ptr_eq(&rows)),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn test_failure_is_shared() {
        let gate = ExecutionGate::new();
        let k = key("SELECT 1");
        let guard = leader(gate.admit(&k));
        let ticket = follower(gate.admit(&k));

        let error = Arc::new(QueryError::source_error("h2", "connection reset"));
        guard.fail(Arc::clone(&error));

        match ticket.wait(Duration::from_secs(1)) {
            Err(CacheError::Materialization(shared)) => assert!(Arc::ptr_eq(&shared, &error)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_dropped_leader_cancels() {
        let gate = ExecutionGate::new();
        let k = key("SELECT 1");
        let guard = leader(gate.admit(&k));
        let ticket = follower(gate.admit(&k));

        let waiter = thread::spawn(move || ticket.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        drop(guard);

        assert!(matches!(waiter.join().unwrap(), Err(CacheError::Cancelled)));
        assert!(matches!(gate.admit(&k), Admission::Leader(_)));
    }

    #[test]
    fn test_wait_timeout() {
        let gate = ExecutionGate::new();
        let k = key("SELECT 1");
        let _guard = leader(gate.admit(&k));
        let ticket = follower(gate.admit(&k));

        let started = Instant::now();
        let result = ticket.wait(Duration::from_millis(30));
        assert!(matches!(result, Err(CacheError::WaitTimeout(_))));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_publish_releases_followers_early() {
        let gate = ExecutionGate::new();
        let k = key("SELECT 1");
        let guard = leader(gate.admit(&k));
        let ticket = follower(gate.admit(&k));

        let buffer = Arc::new(RowBuffer::new());
        guard.publish(Arc::clone(&buffer));

        match ticket.wait(Duration::from_secs(1)).unwrap() {
            FlightOutcome::Streaming(received) => assert!(Arc::ptr_eq(&received, &buffer)),
            other => panic!("unexpected outcome {:?}", other),
        }
        // still in flight until the fill completes
        assert_eq!(gate.in_flight(), 1);
        guard.complete(buffer.complete());
        assert_eq!(gate.in_flight(), 0);
    }
}
