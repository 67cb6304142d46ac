//! Read-view demotion and conflict aborts.
//!
//! Instead of aborting a reader the moment a conflicting writer prepares,
//! the engine demotes the reader to a *read view*: it keeps executing but
//! sees state frozen below the writer's PSN. The global read-view list is
//! kept ordered by ascending `rv_psn`, so the collector can read the
//! lowest protected PSN off the front.

use strata_types::{Psn, TxnId};

use crate::manager::TxManager;
use crate::txn::TxnStatus;

impl TxManager {
    /// The lowest read-view PSN across all demoted transactions.
    ///
    /// Defaults to the next PSN to be issued, so that with no read views
    /// active not even the stories of the latest prepared transaction
    /// are classified as read-view-protected.
    pub(crate) fn lowest_rv_psn(&self) -> Psn {
        self.read_view_txns
            .first()
            .map(|t| self.txns[t].rv_psn)
            .unwrap_or(self.next_psn)
    }

    /// Demote `txn` so that it no longer sees changes prepared at or
    /// after `psn`. Idempotent; an already deeper read view is kept.
    ///
    /// For every key we could pick any level between the confirmed state
    /// and the oldest prepared change of that key; the latest level is
    /// the cheapest, and with several breakers the level only ever
    /// decreases.
    pub fn send_to_read_view(&mut self, txn_id: TxnId, psn: Psn) {
        let Some(txn) = self.txns.get_mut(&txn_id) else {
            return;
        };
        match txn.status {
            TxnStatus::InProgress => {
                txn.status = TxnStatus::InReadView;
                txn.rv_psn = psn;
                tracing::debug!(txn = %txn_id, psn = %psn, "transaction sent to read view");
                self.read_view_txns.push(txn_id);
                self.adjust_read_view_position(txn_id);
            }
            TxnStatus::InReadView => {
                if txn.rv_psn > psn {
                    txn.rv_psn = psn;
                    tracing::debug!(txn = %txn_id, psn = %psn, "read view deepened");
                    self.adjust_read_view_position(txn_id);
                }
            }
            _ => {}
        }
    }

    /// Restore the ascending-`rv_psn` order of the read-view list after
    /// `txn_id` joined at the tail or had its level lowered. Only ever
    /// moves the transaction toward the front.
    fn adjust_read_view_position(&mut self, txn_id: TxnId) {
        let pos = self
            .read_view_txns
            .iter()
            .position(|&t| t == txn_id)
            .expect("txn in read view list");
        let rv = self.txns[&txn_id].rv_psn;
        if pos == 0 || self.txns[&self.read_view_txns[pos - 1]].rv_psn <= rv {
            return;
        }
        self.read_view_txns.remove(pos);
        let insert_at = self
            .read_view_txns
            .iter()
            .position(|&t| self.txns[&t].rv_psn > rv)
            .unwrap_or(self.read_view_txns.len());
        self.read_view_txns.insert(insert_at, txn_id);
    }

    /// Mark `txn` as aborted by conflict. Idempotent and safe at any
    /// point: its trackers stay behind, harmless, until its statements
    /// are rolled back.
    pub fn abort_with_conflict(&mut self, txn_id: TxnId) {
        let Some(txn) = self.txns.get_mut(&txn_id) else {
            return;
        };
        match txn.status {
            TxnStatus::InReadView => {
                txn.status = TxnStatus::Aborted;
                tracing::debug!(txn = %txn_id, "transaction aborted by conflict");
                if let Some(pos) = self.read_view_txns.iter().position(|&t| t == txn_id) {
                    self.read_view_txns.remove(pos);
                }
            }
            TxnStatus::InProgress => {
                txn.status = TxnStatus::Aborted;
                tracing::debug!(txn = %txn_id, "transaction aborted by conflict");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::TxnStatus;
    use proptest::prelude::*;

    proptest! {
        /// However demotions interleave, the read-view list stays
        /// ordered by ascending rv_psn.
        #[test]
        fn prop_read_view_list_stays_ascending(
            psns in prop::collection::vec(2u64..64, 1..16),
        ) {
            let mut m = TxManager::new();
            let txns: Vec<_> = psns.iter().map(|_| m.begin()).collect();
            for (tx, p) in txns.iter().zip(&psns) {
                m.send_to_read_view(*tx, Psn::new(*p));
            }
            // A second round of (possibly deeper) demotions.
            for (tx, p) in txns.iter().zip(psns.iter().rev()) {
                m.send_to_read_view(*tx, Psn::new(*p));
            }
            let order: Vec<u64> = m
                .read_view_txns
                .iter()
                .map(|t| m.txns[t].rv_psn.get())
                .collect();
            let mut sorted = order.clone();
            sorted.sort_unstable();
            prop_assert_eq!(order, sorted);
        }
    }

    #[test]
    fn test_send_to_read_view_is_idempotent_upward() {
        let mut m = TxManager::new();
        let tx = m.begin();
        m.send_to_read_view(tx, Psn::new(10));
        assert_eq!(m.txns[&tx].rv_psn, Psn::new(10));
        // A higher PSN is a no-op.
        m.send_to_read_view(tx, Psn::new(20));
        assert_eq!(m.txns[&tx].rv_psn, Psn::new(10));
        // A lower PSN deepens the view.
        m.send_to_read_view(tx, Psn::new(5));
        assert_eq!(m.txns[&tx].rv_psn, Psn::new(5));
    }

    #[test]
    fn test_read_view_list_stays_sorted() {
        let mut m = TxManager::new();
        let a = m.begin();
        let b = m.begin();
        let c = m.begin();
        m.send_to_read_view(a, Psn::new(30));
        m.send_to_read_view(b, Psn::new(10));
        m.send_to_read_view(c, Psn::new(20));
        let order: Vec<Psn> = m
            .read_view_txns
            .iter()
            .map(|t| m.txns[t].rv_psn)
            .collect();
        assert_eq!(order, vec![Psn::new(10), Psn::new(20), Psn::new(30)]);
        assert_eq!(m.lowest_rv_psn(), Psn::new(10));
    }

    #[test]
    fn test_abort_with_conflict_is_idempotent() {
        let mut m = TxManager::new();
        let tx = m.begin();
        m.send_to_read_view(tx, Psn::new(10));
        m.abort_with_conflict(tx);
        assert_eq!(m.txns[&tx].status, TxnStatus::Aborted);
        assert!(m.read_view_txns.is_empty());
        m.abort_with_conflict(tx);
        assert_eq!(m.txns[&tx].status, TxnStatus::Aborted);
    }
}
