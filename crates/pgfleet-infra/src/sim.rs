//! In-process simulation of every collaborator.
//!
//! Used by the test suites and by `pgfleetd standalone`, which has no real
//! platform client. State lives behind tokio mutexes that are never held
//! across an await on another collaborator.
//!
//! Fault injection: [`FaultPlan`] fails the next N calls of a given
//! operation; [`SimulatedInfrastructure`] additionally lets tests crash
//! instances, inject replication lag and force primary claims.

mod infra;
mod objects;

use std::collections::HashMap;

use pgfleet_state::SecretRef;
use tokio::sync::Mutex;

use crate::error::{InfraError, InfraErrorKind, InfraResult};
use crate::traits::CredentialSource;
use crate::types::Credential;

pub use infra::{SimInstance, SimulatedInfrastructure};
pub use objects::MemoryObjectStore;

/// Operations faults can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    CreateVolume,
    ExpandVolume,
    DeleteVolume,
    CreateInstance,
    UpdateInstance,
    DeleteInstance,
    Fence,
    Unfence,
    Promote,
    Observe,
    BaseBackup,
    FetchWal,
    Put,
    Get,
    List,
    Delete,
}

#[derive(Debug, Default)]
struct FaultState {
    pending: HashMap<SimOp, (u32, InfraErrorKind)>,
    calls: HashMap<SimOp, u32>,
}

/// Pending injected failures plus per-operation call counters.
#[derive(Debug, Default)]
pub struct FaultPlan {
    state: Mutex<FaultState>,
}

impl FaultPlan {
    /// Fail the next `count` calls of `op` with an error of `kind`.
    pub async fn fail_next(&self, op: SimOp, count: u32, kind: InfraErrorKind) {
        self.state.lock().await.pending.insert(op, (count, kind));
    }

    /// Number of times `op` was called (including failed calls).
    pub async fn calls(&self, op: SimOp) -> u32 {
        self.state.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Count a call and return the injected failure, if any.
    pub(crate) async fn check(&self, op: SimOp) -> InfraResult<()> {
        let mut state = self.state.lock().await;
        *state.calls.entry(op).or_insert(0) += 1;

        let Some((remaining, kind)) = state.pending.get_mut(&op) else {
            return Ok(());
        };
        let kind = *kind;
        *remaining -= 1;
        if *remaining == 0 {
            state.pending.remove(&op);
        }
        Err(InfraError {
            kind,
            message: format!("injected {op:?} failure"),
        })
    }
}

/// Fixed credential table.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    secrets: HashMap<SecretRef, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, key: &str, value: &str) -> Self {
        self.insert(name, key, value);
        self
    }

    pub fn insert(&mut self, name: &str, key: &str, value: &str) {
        self.secrets.insert(
            SecretRef {
                name: name.to_string(),
                key: key.to_string(),
            },
            value.to_string(),
        );
    }
}

impl CredentialSource for StaticCredentials {
    fn resolve(&self, reference: &SecretRef) -> Option<Credential> {
        self.secrets.get(reference).map(Credential::new)
    }
}
