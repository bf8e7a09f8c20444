//! Two-phase local mutations.
//!
//! A send, edit or delete is first proposed (recorded as pending, invisible in
//! the message list), then either confirmed into the store once the backend
//! accepts it or rolled back when it fails. Nothing reaches the store before
//! confirmation.

use std::collections::BTreeMap;

use tracing::debug;
use uuid::Uuid;

use huddle_types::{Message, MessageId};

use crate::store::{Applied, MessageStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Send { channel_id: Uuid, body: String },
    Edit { id: MessageId, body: String },
    Delete { id: MessageId },
}

impl Mutation {
    /// The message this mutation targets, if it already exists.
    pub fn target(&self) -> Option<MessageId> {
        match self {
            Self::Send { .. } => None,
            Self::Edit { id, .. } | Self::Delete { id } => Some(*id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutationTicket(u64);

#[derive(Debug, Default)]
pub struct PendingMutations {
    next_ticket: u64,
    pending: BTreeMap<MutationTicket, Mutation>,
}

impl PendingMutations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn propose(&mut self, mutation: Mutation) -> MutationTicket {
        self.next_ticket += 1;
        let ticket = MutationTicket(self.next_ticket);
        debug!("Proposed {:?} as {:?}", mutation, ticket);
        self.pending.insert(ticket, mutation);
        ticket
    }

    /// Applies a confirmed mutation to `store`.
    ///
    /// `row` is the representation the backend returned, if any. An edit
    /// without one falls back to patching the body locally. Unknown tickets
    /// change nothing.
    pub fn confirm(&mut self, ticket: MutationTicket, row: Option<Message>, store: &mut MessageStore) -> Applied {
        let Some(mutation) = self.pending.remove(&ticket) else {
            return Applied::Unchanged;
        };

        match (mutation, row) {
            (Mutation::Send { channel_id, .. }, Some(row)) if row.channel_id == channel_id => store.apply_insert(row),
            (Mutation::Send { .. }, _) => Applied::Unchanged,
            (Mutation::Edit { id, .. }, Some(row)) if row.id == id => store.apply_update(row),
            (Mutation::Edit { id, body }, _) => match store.get(id) {
                Some(existing) => {
                    let patched = Message {
                        message: body,
                        ..existing.clone()
                    };
                    store.apply_update(patched)
                }
                None => Applied::Unchanged,
            },
            (Mutation::Delete { id }, _) => store.apply_delete(id),
        }
    }

    /// Discards a failed mutation. Returns it so the caller can report it.
    pub fn rollback(&mut self, ticket: MutationTicket) -> Option<Mutation> {
        let mutation = self.pending.remove(&ticket);
        if let Some(m) = &mutation {
            debug!("Rolled back {:?} ({:?})", m, ticket);
        }
        mutation
    }

    /// Pending mutations, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Mutation> {
        self.pending.values()
    }

    pub fn is_pending(&self, id: MessageId) -> bool {
        self.pending.values().any(|m| m.target() == Some(id))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
