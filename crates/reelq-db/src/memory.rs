//! In-memory store backend.
//!
//! Mirrors the Postgres semantics the scheduler relies on (row locks with
//! skip-locked reads, transactions with rollback, guarded state updates) and
//! adds fault injection so connectivity failures can be exercised without a
//! database.

use async_trait::async_trait;
use reelq_core::{JobId, JobPayload, JobRecord, JobState};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::statement::StatementKind;
use crate::store::{Connection, Connector};
use crate::{DbError, DbResult, Outcome, Statement};

/// A stored job row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJob {
    pub state: JobState,
    pub progress: u8,
    pub error: Option<String>,
    pub payload: JobPayload,
}

/// Failure to inject into the next matching statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// The session dies mid-statement; any open transaction is lost.
    ConnectionDropped,
    /// The statement itself is rejected.
    QueryError(String),
}

impl FaultKind {
    fn to_error(&self) -> DbError {
        match self {
            FaultKind::ConnectionDropped => {
                DbError::Connection("connection reset by peer".to_string())
            }
            FaultKind::QueryError(message) => DbError::Query {
                code: Some("XX000".to_string()),
                message: message.clone(),
            },
        }
    }
}

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<JobId, StoredJob>,
    next_id: i64,
    locks: HashMap<JobId, u64>,
    faults: Vec<(StatementKind, FaultKind)>,
    refused_connects: u32,
    connect_budget: Option<u32>,
    next_session: u64,
    /// Sessions up to this id were killed server-side.
    terminated_through: u64,
    open: usize,
    closed: usize,
    reconnects: usize,
}

impl MemoryState {
    fn admit_session(&mut self) -> DbResult<u64> {
        if self.refused_connects > 0 {
            if self.refused_connects != u32::MAX {
                self.refused_connects -= 1;
            }
            return Err(DbError::Connection("connection refused".to_string()));
        }
        if let Some(budget) = self.connect_budget.as_mut() {
            if *budget == 0 {
                return Err(DbError::Connection("too many connections".to_string()));
            }
            *budget -= 1;
        }
        self.next_session += 1;
        self.open += 1;
        Ok(self.next_session)
    }

    fn locked_by_other(&self, id: JobId, session: u64) -> bool {
        self.locks.get(&id).is_some_and(|owner| *owner != session)
    }

    fn release_locks(&mut self, session: u64) {
        self.locks.retain(|_, owner| *owner != session);
    }

    fn take_fault(&mut self, kind: StatementKind) -> Option<FaultKind> {
        let index = self.faults.iter().position(|(k, _)| *k == kind)?;
        Some(self.faults.remove(index).1)
    }
}

/// Shared in-memory task table. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a pending job directly, bypassing any connection.
    pub fn insert(&self, payload: JobPayload) -> JobId {
        self.insert_with_state(payload, JobState::Pending)
    }

    pub fn insert_with_state(&self, payload: JobPayload, state: JobState) -> JobId {
        let mut st = self.lock();
        st.next_id += 1;
        let id = JobId::new(st.next_id);
        st.rows.insert(
            id,
            StoredJob {
                state,
                progress: 0,
                error: None,
                payload,
            },
        );
        id
    }

    pub fn job(&self, id: JobId) -> Option<StoredJob> {
        self.lock().rows.get(&id).cloned()
    }

    pub fn state_of(&self, id: JobId) -> Option<JobState> {
        self.lock().rows.get(&id).map(|job| job.state)
    }

    pub fn count_in(&self, state: JobState) -> usize {
        self.lock()
            .rows
            .values()
            .filter(|job| job.state == state)
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail the next statement of `kind`, on whichever connection runs it.
    pub fn inject(&self, kind: StatementKind, fault: FaultKind) {
        self.lock().faults.push((kind, fault));
    }

    /// Refuse the next `n` connection attempts. `u32::MAX` refuses forever.
    pub fn refuse_connects(&self, n: u32) {
        self.lock().refused_connects = n;
    }

    /// Let only `n` more connection attempts succeed.
    pub fn limit_connects(&self, n: u32) {
        self.lock().connect_budget = Some(n);
    }

    /// Lift every connection restriction.
    pub fn allow_connects(&self) {
        let mut st = self.lock();
        st.refused_connects = 0;
        st.connect_budget = None;
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open
    }

    pub fn closed_connections(&self) -> usize {
        self.lock().closed
    }

    /// Kill every open session server-side, as a database restart would. Each
    /// connection notices on its next begin, statement or ping.
    pub fn terminate_sessions(&self) {
        let mut st = self.lock();
        st.terminated_through = st.next_session;
    }

    /// Successful reconnects across all connections.
    pub fn reconnects(&self) -> usize {
        self.lock().reconnects
    }
}

#[async_trait]
impl Connector for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let session = self.lock().admit_session()?;
        Ok(Box::new(MemoryConnection {
            store: self.clone(),
            session: Some(session),
            undo: None,
            broken: false,
        }))
    }
}

type UndoLog = Vec<(JobId, Option<StoredJob>)>;

/// A session on a [`MemoryStore`].
pub struct MemoryConnection {
    store: MemoryStore,
    session: Option<u64>,
    /// Present while a transaction is open.
    undo: Option<UndoLog>,
    broken: bool,
}

impl MemoryConnection {
    fn live_session(&self) -> DbResult<u64> {
        self.session.ok_or(DbError::Closed)
    }

    /// The live session id, or a connection error if the server killed it.
    fn check_alive(&mut self, st: &mut MemoryState) -> DbResult<u64> {
        let session = self.live_session()?;
        if session <= st.terminated_through {
            self.broken = true;
            self.end_session(st);
            return Err(DbError::Connection(
                "terminating connection due to administrator command".to_string(),
            ));
        }
        Ok(session)
    }

    fn abort(&mut self, st: &mut MemoryState) {
        if let Some(undo) = self.undo.take() {
            for (id, previous) in undo.into_iter().rev() {
                match previous {
                    Some(job) => {
                        st.rows.insert(id, job);
                    }
                    None => {
                        st.rows.remove(&id);
                    }
                }
            }
        }
        if let Some(session) = self.session {
            st.release_locks(session);
        }
    }

    fn end_session(&mut self, st: &mut MemoryState) {
        self.abort(st);
        if self.session.take().is_some() {
            st.open -= 1;
            st.closed += 1;
        }
    }

    fn write(
        &mut self,
        st: &mut MemoryState,
        session: u64,
        id: JobId,
        update: impl FnOnce(&mut StoredJob),
    ) {
        if let Some(undo) = self.undo.as_mut() {
            undo.push((id, st.rows.get(&id).cloned()));
            st.locks.insert(id, session);
        }
        if let Some(job) = st.rows.get_mut(&id) {
            update(job);
        }
    }

    fn transition(
        &mut self,
        st: &mut MemoryState,
        session: u64,
        ids: &[JobId],
        from: JobState,
        to: JobState,
    ) -> Vec<JobId> {
        let mut moved = Vec::new();
        for id in ids {
            let eligible = st
                .rows
                .get(id)
                .is_some_and(|job| job.state == from && from.can_transition_to(to))
                && !st.locked_by_other(*id, session);
            if eligible {
                self.write(st, session, *id, |job| job.state = to);
                moved.push(*id);
            }
        }
        moved
    }

    fn run(&mut self, st: &mut MemoryState, session: u64, statement: &Statement) -> Outcome {
        let in_tx = self.undo.is_some();
        match statement {
            Statement::SelectPending { limit } => {
                let limit = usize::try_from(*limit).unwrap_or(0);
                let records: Vec<JobRecord> = st
                    .rows
                    .iter()
                    .filter(|(id, job)| {
                        job.state == JobState::Pending && !st.locked_by_other(**id, session)
                    })
                    .take(limit)
                    .map(|(id, job)| JobRecord {
                        id: *id,
                        state: job.state,
                        progress: job.progress,
                        payload: job.payload.clone(),
                    })
                    .collect();
                if in_tx {
                    for record in &records {
                        st.locks.insert(record.id, session);
                    }
                }
                Outcome::Rows(records)
            }
            Statement::MarkInFlight { ids } => Outcome::Ids(self.transition(
                st,
                session,
                ids,
                JobState::Pending,
                JobState::InFlight,
            )),
            Statement::SelectInFlight => {
                let ids: Vec<JobId> = st
                    .rows
                    .iter()
                    .filter(|(id, job)| {
                        job.state == JobState::InFlight && !st.locked_by_other(**id, session)
                    })
                    .map(|(id, _)| *id)
                    .collect();
                if in_tx {
                    for id in &ids {
                        st.locks.insert(*id, session);
                    }
                }
                Outcome::Ids(ids)
            }
            Statement::ResetToPending { ids } => {
                let moved =
                    self.transition(st, session, ids, JobState::InFlight, JobState::Pending);
                Outcome::Affected(moved.len() as u64)
            }
            Statement::Finish { id, state, error } => {
                let eligible = st
                    .rows
                    .get(id)
                    .is_some_and(|job| {
                        job.state == JobState::InFlight && job.state.can_transition_to(*state)
                    })
                    && !st.locked_by_other(*id, session);
                if !eligible {
                    return Outcome::Affected(0);
                }
                let error = error.clone();
                let state = *state;
                self.write(st, session, *id, |job| {
                    job.state = state;
                    job.progress = 100;
                    job.error = error;
                });
                Outcome::Affected(1)
            }
            Statement::SetProgress { id, progress } => {
                if !st.rows.contains_key(id) {
                    return Outcome::Affected(0);
                }
                let progress = *progress;
                self.write(st, session, *id, |job| job.progress = progress);
                Outcome::Affected(1)
            }
            Statement::Insert { payload } => {
                st.next_id += 1;
                let id = JobId::new(st.next_id);
                st.rows.insert(
                    id,
                    StoredJob {
                        state: JobState::Pending,
                        progress: 0,
                        error: None,
                        payload: payload.clone(),
                    },
                );
                if let Some(undo) = self.undo.as_mut() {
                    undo.push((id, None));
                    st.locks.insert(id, session);
                }
                Outcome::Ids(vec![id])
            }
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&mut self) -> DbResult<()> {
        let store = self.store.clone();
        let mut st = store.lock();
        self.check_alive(&mut st)?;
        if self.undo.is_none() {
            self.undo = Some(Vec::new());
        }
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        let session = self.live_session()?;
        let store = self.store.clone();
        let mut st = store.lock();
        self.undo = None;
        st.release_locks(session);
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.live_session()?;
        let store = self.store.clone();
        let mut st = store.lock();
        self.abort(&mut st);
        Ok(())
    }

    async fn execute(&mut self, statement: &Statement) -> DbResult<Outcome> {
        let store = self.store.clone();
        let mut st = store.lock();
        let session = self.check_alive(&mut st)?;

        if let Some(fault) = st.take_fault(statement.kind()) {
            let err = fault.to_error();
            if err.is_transient() {
                self.broken = true;
                self.end_session(&mut st);
            }
            return Err(err);
        }

        Ok(self.run(&mut st, session, statement))
    }

    async fn ping(&mut self) -> DbResult<()> {
        let store = self.store.clone();
        let mut st = store.lock();
        self.check_alive(&mut st).map(|_| ())
    }

    async fn reconnect(&mut self) -> DbResult<()> {
        let store = self.store.clone();
        let mut st = store.lock();
        self.end_session(&mut st);
        let session = st.admit_session()?;
        st.reconnects += 1;
        self.session = Some(session);
        self.broken = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.undo.is_some()
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn close(&mut self) -> DbResult<()> {
        let store = self.store.clone();
        let mut st = store.lock();
        self.end_session(&mut st);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.session.is_some() {
            let store = self.store.clone();
            let mut st = store.lock();
            self.end_session(&mut st);
        }
    }
}
