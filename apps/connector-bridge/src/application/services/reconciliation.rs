//! Reconciliation Tracker
//!
//! An intent that timed out was rolled back locally, but the terminal may
//! still have executed it. The tracker remembers such intents per account
//! and, when the connector next answers `SYNC_REQUEST`, checks whether the
//! terminal shows the intent's effect. Any evidence of an effect the local
//! books do not have becomes a [`Conflict`] for manual resolution; nothing
//! is corrected automatically.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::application::ports::{StoreError, TradeStore};
use crate::domain::identity::{AccountId, IntentId, RemoteRef, TradeId};
use crate::domain::trade::{PositionSnapshot, TradeAction, TradeIntent};

/// What the terminal shows that the local books do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// A timed-out open appears as a position unknown locally.
    UnexpectedOpen,
    /// A timed-out close's position is gone from the terminal.
    UnexpectedClose,
    /// A timed-out modify's levels are live on the terminal.
    UnexpectedModify,
    /// A successful result arrived after the deadline.
    LateResult,
}

impl ConflictKind {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::UnexpectedOpen => "unexpected_open",
            Self::UnexpectedClose => "unexpected_close",
            Self::UnexpectedModify => "unexpected_modify",
            Self::LateResult => "late_result",
        }
    }
}

/// A discrepancy awaiting manual resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict id.
    pub id: u64,
    /// Account.
    pub account_id: AccountId,
    /// Kind.
    pub kind: ConflictKind,
    /// Intent that was rolled back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<IntentId>,
    /// Local trade involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<TradeId>,
    /// Terminal ticket involved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<RemoteRef>,
    /// Human-readable detail.
    pub detail: String,
    /// When it was detected.
    pub detected_at: DateTime<Utc>,
    /// Whether an operator resolved it.
    pub resolved: bool,
    /// When an operator resolved it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// How long a resolved conflict is kept before it is dropped.
pub const RESOLVED_RETENTION: TimeDelta = TimeDelta::hours(24);

/// Tracks timed-out intents and the conflicts they produce.
pub struct ReconciliationTracker {
    store: Arc<dyn TradeStore>,
    pending: DashMap<AccountId, Vec<TradeIntent>>,
    conflicts: RwLock<Vec<Conflict>>,
    next_id: AtomicU64,
    retention: TimeDelta,
}

impl std::fmt::Debug for ReconciliationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationTracker")
            .field("pending_accounts", &self.pending.len())
            .field("conflicts", &self.conflicts.read().len())
            .finish_non_exhaustive()
    }
}

impl ReconciliationTracker {
    /// Create a tracker reading committed trades from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn TradeStore>) -> Self {
        Self {
            store,
            pending: DashMap::new(),
            conflicts: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            retention: RESOLVED_RETENTION,
        }
    }

    /// Keep resolved conflicts for `retention` instead of the default.
    #[must_use]
    pub fn with_retention(mut self, retention: TimeDelta) -> Self {
        self.retention = retention;
        self
    }

    /// Remember a timed-out intent until the account's next sync.
    pub fn register_timeout(&self, intent: &TradeIntent) {
        tracing::warn!(
            intent_id = %intent.id,
            account_id = %intent.account_id,
            action = %intent.action,
            "Intent timed out; reconciliation pending"
        );
        self.pending
            .entry(intent.account_id.clone())
            .or_default()
            .push(intent.clone());
    }

    /// Whether `account` has timed-out intents awaiting a sync.
    #[must_use]
    pub fn has_pending(&self, account: &AccountId) -> bool {
        self.pending.get(account).is_some_and(|p| !p.is_empty())
    }

    /// Record a successful result that arrived after its deadline.
    pub fn record_late_result(&self, account: &AccountId, ticket: Option<RemoteRef>, detail: &str) {
        self.push_conflict(
            account,
            ConflictKind::LateResult,
            None,
            None,
            ticket,
            format!("successful trade result after deadline: {detail}"),
        );
    }

    /// Compare pending timeouts for `account` against the terminal's
    /// positions. Pending entries are consumed; new conflicts are returned.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if committed trades cannot be read. Pending
    /// entries are kept in that case.
    pub async fn reconcile(
        &self,
        account: &AccountId,
        positions: &[PositionSnapshot],
    ) -> Result<Vec<Conflict>, StoreError> {
        if !self.has_pending(account) {
            return Ok(Vec::new());
        }

        let trades = self.store.trades(account).await?;
        let Some((_, checks)) = self.pending.remove(account) else {
            return Ok(Vec::new());
        };

        let known_tickets: HashSet<&RemoteRef> =
            trades.iter().filter_map(|t| t.remote_ref.as_ref()).collect();
        let live_tickets: HashSet<&RemoteRef> = positions.iter().map(|p| &p.ticket).collect();

        let mut found = Vec::new();
        for intent in &checks {
            let target = trades.iter().find(|t| t.trade_id == intent.trade_id);
            match intent.action {
                TradeAction::Open => {
                    let candidate = positions.iter().find(|p| {
                        !known_tickets.contains(&p.ticket)
                            && intent.instrument.as_deref() == Some(p.instrument.as_str())
                            && intent.side == Some(p.side)
                            && intent.size == Some(p.size)
                    });
                    if let Some(position) = candidate {
                        found.push(self.push_conflict(
                            account,
                            ConflictKind::UnexpectedOpen,
                            Some(intent.id.clone()),
                            None,
                            Some(position.ticket.clone()),
                            format!(
                                "terminal holds {} {:?} {} not in local books",
                                position.instrument, position.side, position.size
                            ),
                        ));
                    }
                }
                TradeAction::Close => {
                    let gone = target
                        .filter(|t| t.is_open())
                        .and_then(|t| t.remote_ref.as_ref())
                        .filter(|ticket| !live_tickets.contains(ticket));
                    if let Some(ticket) = gone {
                        found.push(self.push_conflict(
                            account,
                            ConflictKind::UnexpectedClose,
                            Some(intent.id.clone()),
                            Some(intent.trade_id.clone()),
                            Some(ticket.clone()),
                            "locally open trade is absent from the terminal".into(),
                        ));
                    }
                }
                TradeAction::Modify => {
                    let applied = target.and_then(|t| {
                        let ticket = t.remote_ref.as_ref()?;
                        let position = positions.iter().find(|p| &p.ticket == ticket)?;
                        let sl_applied = intent.stop_loss.is_some()
                            && position.stop_loss == intent.stop_loss
                            && t.stop_loss != intent.stop_loss;
                        let tp_applied = intent.take_profit.is_some()
                            && position.take_profit == intent.take_profit
                            && t.take_profit != intent.take_profit;
                        (sl_applied || tp_applied).then(|| ticket.clone())
                    });
                    if let Some(ticket) = applied {
                        found.push(self.push_conflict(
                            account,
                            ConflictKind::UnexpectedModify,
                            Some(intent.id.clone()),
                            Some(intent.trade_id.clone()),
                            Some(ticket),
                            "requested protective levels are live on the terminal".into(),
                        ));
                    }
                }
            }
        }

        tracing::info!(
            account_id = %account,
            checked = checks.len(),
            conflicts = found.len(),
            "Reconciliation pass complete"
        );
        Ok(found)
    }

    fn push_conflict(
        &self,
        account: &AccountId,
        kind: ConflictKind,
        intent_id: Option<IntentId>,
        trade_id: Option<TradeId>,
        ticket: Option<RemoteRef>,
        detail: String,
    ) -> Conflict {
        let conflict = Conflict {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            account_id: account.clone(),
            kind,
            intent_id,
            trade_id,
            ticket,
            detail,
            detected_at: Utc::now(),
            resolved: false,
            resolved_at: None,
        };
        tracing::error!(
            conflict_id = conflict.id,
            account_id = %account,
            kind = ?kind,
            detail = %conflict.detail,
            "Reconciliation conflict requires manual resolution"
        );
        crate::infrastructure::metrics::record_reconciliation_conflict(kind);
        let mut conflicts = self.conflicts.write();
        self.prune_resolved(&mut conflicts, conflict.detected_at);
        conflicts.push(conflict.clone());
        conflict
    }

    fn prune_resolved(&self, conflicts: &mut Vec<Conflict>, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        let before = conflicts.len();
        conflicts.retain(|c| c.resolved_at.is_none_or(|at| at > cutoff));
        let dropped = before - conflicts.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped expired resolved conflicts");
        }
    }

    /// Unresolved conflicts, optionally restricted to `accounts`.
    #[must_use]
    pub fn conflicts(&self, accounts: Option<&HashSet<AccountId>>) -> Vec<Conflict> {
        self.conflicts
            .read()
            .iter()
            .filter(|c| !c.resolved)
            .filter(|c| accounts.is_none_or(|set| set.contains(&c.account_id)))
            .cloned()
            .collect()
    }

    /// Mark a conflict resolved by an operator. Returns the conflict, or
    /// `None` if the id is unknown. Resolved conflicts are dropped once
    /// they are older than the retention period.
    pub fn resolve(&self, id: u64) -> Option<Conflict> {
        let now = Utc::now();
        let mut conflicts = self.conflicts.write();
        let conflict = conflicts.iter_mut().find(|c| c.id == id)?;
        if !conflict.resolved {
            conflict.resolved = true;
            conflict.resolved_at = Some(now);
        }
        tracing::info!(conflict_id = id, account_id = %conflict.account_id, "Conflict resolved");
        let resolved = conflict.clone();
        self.prune_resolved(&mut conflicts, now);
        Some(resolved)
    }

    /// Number of conflicts held, resolved ones included.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.conflicts.read().len()
    }
}
