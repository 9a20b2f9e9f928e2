//! In-memory proxy configuration store for tests.
//!
//! Mirrors the transactional semantics of the Data Plane API: mutations are
//! staged inside a transaction opened against a version and only become
//! visible at commit, which bumps the version. Supports failure injection
//! (stale versions, failed commits, an unreachable endpoint) and records
//! call counts so tests can assert on exactly what a cycle did.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ProxyError;

use super::{
    BackendSpec, BindSpec, CommitOutcome, FrontendSpec, MemberSpec, ProxyClient, TransactionId,
};

#[derive(Debug, Clone)]
enum StagedOp {
    AddMember(MemberSpec),
    RemoveMember(String),
    CreateBackend(BackendSpec),
    CreateFrontend(FrontendSpec),
    CreateBind(String, BindSpec),
}

#[derive(Debug, Default)]
struct OpenTransaction {
    staged: Vec<StagedOp>,
}

/// Mutation counters, snapshotted via [`InMemoryProxy::counters`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyCounters {
    pub begins: u32,
    pub commits: u32,
    pub member_adds: u32,
    pub member_removes: u32,
    pub abandons: u32,
}

#[derive(Debug, Default)]
struct ProxyState {
    version: u64,
    members: BTreeMap<String, MemberSpec>,
    backends: Vec<BackendSpec>,
    frontends: Vec<FrontendSpec>,
    binds: Vec<(String, BindSpec)>,
    transactions: HashMap<String, OpenTransaction>,
    next_tx: u64,
    counters: ProxyCounters,
    // Failure injection
    stale_begins: u32,
    fail_next_commit: bool,
    unreachable: bool,
}

/// In-memory implementation of [`ProxyClient`].
#[derive(Debug, Default)]
pub struct InMemoryProxy {
    state: Mutex<ProxyState>,
}

impl InMemoryProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the committed members, sorted.
    pub fn committed_members(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.members.keys().cloned().collect()
    }

    /// Names of the committed backends.
    pub fn committed_backends(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.backends.iter().map(|b| b.name.clone()).collect()
    }

    /// Names of the committed frontends.
    pub fn committed_frontends(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.frontends.iter().map(|f| f.name.clone()).collect()
    }

    /// Committed (frontend, bind port) pairs.
    pub fn committed_binds(&self) -> Vec<(String, u16)> {
        let state = self.state.lock().unwrap();
        state
            .binds
            .iter()
            .map(|(frontend, bind)| (frontend.clone(), bind.port))
            .collect()
    }

    /// Current configuration version.
    pub fn version(&self) -> u64 {
        self.state.lock().unwrap().version
    }

    /// Snapshot of the mutation counters.
    pub fn counters(&self) -> ProxyCounters {
        self.state.lock().unwrap().counters.clone()
    }

    /// Number of transactions still open (opened but never applied).
    pub fn open_transactions(&self) -> usize {
        self.state.lock().unwrap().transactions.len()
    }

    /// The next `n` `begin_transaction` calls fail with `StaleVersion`,
    /// as if another actor committed between the read and the open.
    pub fn inject_stale_begins(&self, n: u32) {
        self.state.lock().unwrap().stale_begins = n;
    }

    /// The next commit reports a failure outcome without applying anything.
    pub fn fail_next_commit(&self) {
        self.state.lock().unwrap().fail_next_commit = true;
    }

    /// All subsequent calls fail with `Unreachable` until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    fn check_reachable(state: &ProxyState) -> Result<(), ProxyError> {
        if state.unreachable {
            Err(ProxyError::Unreachable("injected outage".to_string()))
        } else {
            Ok(())
        }
    }

    /// Member names as visible inside a transaction: committed state plus
    /// the transaction's own staged mutations.
    fn visible_members(state: &ProxyState, tx: &OpenTransaction) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = state.members.keys().cloned().collect();
        for op in &tx.staged {
            match op {
                StagedOp::AddMember(member) => {
                    names.insert(member.name.clone());
                }
                StagedOp::RemoveMember(name) => {
                    names.remove(name);
                }
                _ => {}
            }
        }
        names
    }
}

#[async_trait]
impl ProxyClient for InMemoryProxy {
    async fn list_members(&self, _backend: &str) -> Result<Vec<String>, ProxyError> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        Ok(state.members.keys().cloned().collect())
    }

    async fn current_version(&self) -> Result<u64, ProxyError> {
        let state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        Ok(state.version)
    }

    async fn begin_transaction(&self, version: u64) -> Result<TransactionId, ProxyError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        state.counters.begins += 1;

        if state.stale_begins > 0 {
            state.stale_begins -= 1;
            // Simulate the competing commit the stale response implies.
            state.version += 1;
            return Err(ProxyError::StaleVersion { requested: version });
        }

        if version != state.version {
            return Err(ProxyError::StaleVersion { requested: version });
        }

        state.next_tx += 1;
        let id = format!("tx-{}", state.next_tx);
        state
            .transactions
            .insert(id.clone(), OpenTransaction::default());
        Ok(TransactionId::new(id))
    }

    async fn add_member(
        &self,
        tx: &TransactionId,
        _backend: &str,
        member: &MemberSpec,
    ) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        state.counters.member_adds += 1;

        let open = state
            .transactions
            .get(tx.as_str())
            .ok_or_else(|| ProxyError::UnknownTransaction(tx.to_string()))?;
        if Self::visible_members(&state, open).contains(&member.name) {
            return Err(ProxyError::DuplicateMember(member.name.clone()));
        }

        let open = state
            .transactions
            .get_mut(tx.as_str())
            .ok_or_else(|| ProxyError::UnknownTransaction(tx.to_string()))?;
        open.staged.push(StagedOp::AddMember(member.clone()));
        Ok(())
    }

    async fn remove_member(
        &self,
        tx: &TransactionId,
        _backend: &str,
        name: &str,
    ) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        state.counters.member_removes += 1;

        let open = state
            .transactions
            .get(tx.as_str())
            .ok_or_else(|| ProxyError::UnknownTransaction(tx.to_string()))?;
        if !Self::visible_members(&state, open).contains(name) {
            return Err(ProxyError::MissingMember(name.to_string()));
        }

        let open = state
            .transactions
            .get_mut(tx.as_str())
            .ok_or_else(|| ProxyError::UnknownTransaction(tx.to_string()))?;
        open.staged.push(StagedOp::RemoveMember(name.to_string()));
        Ok(())
    }

    async fn create_backend(
        &self,
        tx: &TransactionId,
        backend: &BackendSpec,
    ) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let open = state
            .transactions
            .get_mut(tx.as_str())
            .ok_or_else(|| ProxyError::UnknownTransaction(tx.to_string()))?;
        open.staged.push(StagedOp::CreateBackend(backend.clone()));
        Ok(())
    }

    async fn create_frontend(
        &self,
        tx: &TransactionId,
        frontend: &FrontendSpec,
    ) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let open = state
            .transactions
            .get_mut(tx.as_str())
            .ok_or_else(|| ProxyError::UnknownTransaction(tx.to_string()))?;
        open.staged.push(StagedOp::CreateFrontend(frontend.clone()));
        Ok(())
    }

    async fn create_bind(
        &self,
        tx: &TransactionId,
        frontend: &str,
        bind: &BindSpec,
    ) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        let open = state
            .transactions
            .get_mut(tx.as_str())
            .ok_or_else(|| ProxyError::UnknownTransaction(tx.to_string()))?;
        open.staged
            .push(StagedOp::CreateBind(frontend.to_string(), bind.clone()));
        Ok(())
    }

    async fn commit(&self, tx: &TransactionId) -> Result<CommitOutcome, ProxyError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        state.counters.commits += 1;

        let open = state
            .transactions
            .remove(tx.as_str())
            .ok_or_else(|| ProxyError::UnknownTransaction(tx.to_string()))?;

        if state.fail_next_commit {
            state.fail_next_commit = false;
            return Ok(CommitOutcome::failure("injected commit failure"));
        }

        for op in open.staged {
            match op {
                StagedOp::AddMember(member) => {
                    state.members.insert(member.name.clone(), member);
                }
                StagedOp::RemoveMember(name) => {
                    state.members.remove(&name);
                }
                StagedOp::CreateBackend(backend) => state.backends.push(backend),
                StagedOp::CreateFrontend(frontend) => state.frontends.push(frontend),
                StagedOp::CreateBind(frontend, bind) => state.binds.push((frontend, bind)),
            }
        }

        state.version += 1;
        Ok(CommitOutcome::success())
    }

    async fn abandon(&self, tx: &TransactionId) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap();
        Self::check_reachable(&state)?;
        state.counters.abandons += 1;
        state
            .transactions
            .remove(tx.as_str())
            .map(|_| ())
            .ok_or_else(|| ProxyError::UnknownTransaction(tx.to_string()))
    }
}
