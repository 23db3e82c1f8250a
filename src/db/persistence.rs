use std::{future::Future, pin::Pin};

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::{connection::Database, models::SessionRecord};
use crate::evidence::{EvidenceStatus, FlaggedInterval, FlaggedQuery};
use crate::scoring::Violation;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable storage used by session workers and evidence recorders. The
/// SQLite [`Database`] is the production implementation; tests swap in
/// failing or counting stores.
pub trait Persistence: Send + Sync {
    fn save_session<'a>(&'a self, session: &'a SessionRecord) -> StoreFuture<'a, ()>;

    fn find_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Option<SessionRecord>>;

    /// Latest session created for `(user_id, exam_id)`, in any status.
    fn latest_session_for<'a>(
        &'a self,
        user_id: &'a str,
        exam_id: &'a str,
    ) -> StoreFuture<'a, Option<SessionRecord>>;

    fn save_violations<'a>(
        &'a self,
        session_id: &'a str,
        window_index: u64,
        violations: &'a [Violation],
    ) -> StoreFuture<'a, ()>;

    fn session_violations<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Vec<Violation>>;

    /// `Ok(false)` when the window was already stored.
    fn save_flagged_interval<'a>(&'a self, interval: &'a FlaggedInterval) -> StoreFuture<'a, bool>;

    fn update_evidence<'a>(
        &'a self,
        session_id: &'a str,
        window_index: u64,
        evidence: &'a EvidenceStatus,
    ) -> StoreFuture<'a, ()>;

    fn session_flagged_intervals<'a>(
        &'a self,
        session_id: &'a str,
    ) -> StoreFuture<'a, Vec<FlaggedInterval>>;

    fn flagged_intervals<'a>(
        &'a self,
        query: &'a FlaggedQuery,
    ) -> StoreFuture<'a, Vec<FlaggedInterval>>;

    /// Deletes flagged intervals flagged before `cutoff`, returning the
    /// evidence references they pointed at.
    fn purge_flagged_before(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, Vec<String>>;

    /// Marks sessions left open by a previous process as ended.
    fn end_orphaned_sessions(&self, ended_at: DateTime<Utc>) -> StoreFuture<'_, Vec<String>>;
}

impl Persistence for Database {
    fn save_session<'a>(&'a self, session: &'a SessionRecord) -> StoreFuture<'a, ()> {
        Box::pin(self.upsert_session(session))
    }

    fn find_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Option<SessionRecord>> {
        Box::pin(self.get_session(session_id))
    }

    fn latest_session_for<'a>(
        &'a self,
        user_id: &'a str,
        exam_id: &'a str,
    ) -> StoreFuture<'a, Option<SessionRecord>> {
        Box::pin(Database::latest_session_for(self, user_id, exam_id))
    }

    fn save_violations<'a>(
        &'a self,
        session_id: &'a str,
        window_index: u64,
        violations: &'a [Violation],
    ) -> StoreFuture<'a, ()> {
        Box::pin(self.insert_window_violations(session_id, window_index, violations))
    }

    fn session_violations<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, Vec<Violation>> {
        Box::pin(self.get_violations_for_session(session_id))
    }

    fn save_flagged_interval<'a>(&'a self, interval: &'a FlaggedInterval) -> StoreFuture<'a, bool> {
        Box::pin(self.insert_flagged_interval(interval))
    }

    fn update_evidence<'a>(
        &'a self,
        session_id: &'a str,
        window_index: u64,
        evidence: &'a EvidenceStatus,
    ) -> StoreFuture<'a, ()> {
        Box::pin(Database::update_evidence(self, session_id, window_index, evidence))
    }

    fn session_flagged_intervals<'a>(
        &'a self,
        session_id: &'a str,
    ) -> StoreFuture<'a, Vec<FlaggedInterval>> {
        Box::pin(self.get_flagged_for_session(session_id))
    }

    fn flagged_intervals<'a>(
        &'a self,
        query: &'a FlaggedQuery,
    ) -> StoreFuture<'a, Vec<FlaggedInterval>> {
        Box::pin(self.list_flagged_intervals(query))
    }

    fn purge_flagged_before(&self, cutoff: DateTime<Utc>) -> StoreFuture<'_, Vec<String>> {
        Box::pin(Database::purge_flagged_before(self, cutoff))
    }

    fn end_orphaned_sessions(&self, ended_at: DateTime<Utc>) -> StoreFuture<'_, Vec<String>> {
        Box::pin(Database::end_orphaned_sessions(self, ended_at))
    }
}
