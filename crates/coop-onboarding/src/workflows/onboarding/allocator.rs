use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::error;

use super::domain::{AccountNumber, MemberId};

/// Grants permanent member and account identifiers.
///
/// Implementations must make read-increment-return atomic: concurrent callers never observe
/// the same value. Values are never reused, even when the caller later fails to persist them.
pub trait IdentifierAllocator: Send + Sync {
    fn allocate_member_id(&self) -> Result<MemberId, AllocationError>;
    fn allocate_account_number(&self, year: i32) -> Result<AccountNumber, AllocationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("{sequence} sequence exhausted at {limit}")]
    Exhausted { sequence: String, limit: u64 },
    #[error("identifier store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Default)]
struct Counters {
    last_member_id: u64,
    last_account_sequence: BTreeMap<i32, u32>,
}

/// In-process allocator owning both counters behind a single lock.
#[derive(Debug)]
pub struct SequenceAllocator {
    account_prefix: String,
    account_sequence_limit: u32,
    member_id_limit: u64,
    counters: Mutex<Counters>,
}

impl SequenceAllocator {
    pub fn new(account_prefix: impl Into<String>, account_sequence_limit: u32) -> Self {
        Self {
            account_prefix: account_prefix.into(),
            account_sequence_limit,
            member_id_limit: u64::MAX,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn with_member_id_limit(mut self, limit: u64) -> Self {
        self.member_id_limit = limit;
        self
    }

    /// Continue from persisted high-water marks.
    pub fn resume(self, last_member_id: u64, last_account_sequence: BTreeMap<i32, u32>) -> Self {
        {
            let mut counters = self.lock();
            counters.last_member_id = last_member_id;
            counters.last_account_sequence = last_account_sequence;
        }
        self
    }

    /// Current high-water marks, for persisting alongside issued identifiers.
    pub fn snapshot(&self) -> (u64, BTreeMap<i32, u32>) {
        let counters = self.lock();
        (
            counters.last_member_id,
            counters.last_account_sequence.clone(),
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl IdentifierAllocator for SequenceAllocator {
    fn allocate_member_id(&self) -> Result<MemberId, AllocationError> {
        let mut counters = self.lock();
        if counters.last_member_id >= self.member_id_limit {
            error!(limit = self.member_id_limit, "member id sequence exhausted");
            return Err(AllocationError::Exhausted {
                sequence: "member id".to_string(),
                limit: self.member_id_limit,
            });
        }
        counters.last_member_id += 1;
        Ok(MemberId(counters.last_member_id))
    }

    fn allocate_account_number(&self, year: i32) -> Result<AccountNumber, AllocationError> {
        let mut counters = self.lock();
        let last = counters.last_account_sequence.entry(year).or_insert(0);
        if *last >= self.account_sequence_limit {
            error!(year, limit = self.account_sequence_limit, "account number sequence exhausted");
            return Err(AllocationError::Exhausted {
                sequence: format!("{} {year} account", self.account_prefix),
                limit: u64::from(self.account_sequence_limit),
            });
        }
        *last += 1;
        Ok(AccountNumber::format(&self.account_prefix, year, *last))
    }
}
