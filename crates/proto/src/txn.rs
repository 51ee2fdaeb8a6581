//! Transaction id allocation and reply correlation.

use std::collections::HashMap;

use crate::TransactionId;

/// Error returned when registering an id that is already outstanding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transaction {0} is already pending")]
pub struct DuplicateTransaction(pub TransactionId);

/// Tracks outstanding transactions and the reply handler of each.
///
/// At most one handler exists per id; a resolved id is forgotten and a second
/// resolve for it reports nothing.
#[derive(Debug)]
pub struct TransactionTracker<H> {
	pending: HashMap<TransactionId, H>,
}

impl<H> Default for TransactionTracker<H> {
	fn default() -> Self {
		Self { pending: HashMap::new() }
	}
}

impl<H> TransactionTracker<H> {
	/// Creates an empty tracker.
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns an id that is not currently outstanding.
	pub fn next_id(&self) -> TransactionId {
		loop {
			let id = TransactionId::random();
			if !self.pending.contains_key(&id) {
				return id;
			}
		}
	}

	/// Stores the reply handler for `id`.
	///
	/// # Errors
	///
	/// Returns [`DuplicateTransaction`] if `id` is already outstanding; the
	/// existing handler is kept.
	pub fn register(&mut self, id: TransactionId, handler: H) -> Result<(), DuplicateTransaction> {
		if self.pending.contains_key(&id) {
			return Err(DuplicateTransaction(id));
		}
		self.pending.insert(id, handler);
		Ok(())
	}

	/// Removes and returns the handler for `id`.
	///
	/// Unknown ids (duplicate or stale replies) are logged and yield `None`.
	pub fn resolve(&mut self, id: &TransactionId) -> Option<H> {
		let handler = self.pending.remove(id);
		if handler.is_none() {
			tracing::warn!(txid = %id, "txn.resolve.unknown");
		}
		handler
	}

	/// Number of outstanding transactions.
	pub fn len(&self) -> usize {
		self.pending.len()
	}

	/// Returns true when nothing is outstanding.
	pub fn is_empty(&self) -> bool {
		self.pending.is_empty()
	}

	/// Abandons every outstanding transaction, returning their handlers.
	pub fn drain(&mut self) -> impl Iterator<Item = (TransactionId, H)> + '_ {
		self.pending.drain()
	}
}
