use std::collections::HashSet;

use huddle_types::{ChangeEvent, Message, MessageId};

/// Ordered view of one channel's messages.
///
/// Order is the seed order followed by inserts in arrival order; nothing is
/// re-sorted after the seed. Each id appears at most once, so every apply
/// operation can be replayed without changing the result.
#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

/// What an applied change did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Updated,
    Deleted,
    Unchanged,
}

impl Applied {
    pub fn changed(self) -> bool {
        self != Applied::Unchanged
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents with a server-ordered list. Repeated ids in the
    /// input keep their first occurrence.
    pub fn seed(&mut self, initial: Vec<Message>) {
        self.clear();
        for msg in initial {
            if self.ids.insert(msg.id) {
                self.messages.push(msg);
            }
        }
    }

    pub fn apply_insert(&mut self, msg: Message) -> Applied {
        if !self.ids.insert(msg.id) {
            return Applied::Unchanged;
        }
        self.messages.push(msg);
        Applied::Inserted
    }

    /// Replaces the entry with the same id in place.
    pub fn apply_update(&mut self, mut msg: Message) -> Applied {
        let Some(existing) = self.messages.iter_mut().find(|m| m.id == msg.id) else {
            return Applied::Unchanged;
        };
        // Feed records never carry the joined sender email.
        if msg.sender_email.is_none() {
            msg.sender_email = existing.sender_email.clone();
        }
        if *existing == msg {
            return Applied::Unchanged;
        }
        *existing = msg;
        Applied::Updated
    }

    pub fn apply_delete(&mut self, id: MessageId) -> Applied {
        if !self.ids.remove(&id) {
            return Applied::Unchanged;
        }
        self.messages.retain(|m| m.id != id);
        Applied::Deleted
    }

    pub fn apply(&mut self, event: ChangeEvent) -> Applied {
        match event {
            ChangeEvent::Insert(msg) => self.apply_insert(msg),
            ChangeEvent::Update(msg) => self.apply_update(msg),
            ChangeEvent::Delete { id, .. } => self.apply_delete(id),
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        if !self.ids.contains(&id) {
            return None;
        }
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|m| m.id).collect()
    }
}
