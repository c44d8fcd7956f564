// Kademlia routing table
//
// 256 k-buckets indexed by shared prefix length with our own id. Buckets are
// least recently seen first; a full bucket keeps its old contacts and drops
// the newcomer.

use super::node_id::{NodeId, ID_BITS};
use super::protocol::Contact;
use parking_lot::RwLock;
use std::collections::VecDeque;

/// Contacts per bucket
pub const K: usize = 20;

pub struct RoutingTable {
    self_id: NodeId,
    buckets: RwLock<Vec<VecDeque<Contact>>>,
}

impl RoutingTable {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            self_id,
            buckets: RwLock::new(vec![VecDeque::new(); ID_BITS]),
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Record that `contact` is alive
    ///
    /// # Returns
    ///
    /// * `true` if the contact is in the table afterwards
    pub fn insert(&self, contact: Contact) -> bool {
        let Some(index) = self.self_id.bucket_index(&contact.id) else {
            return false;
        };

        let mut buckets = self.buckets.write();
        let bucket = &mut buckets[index];
        if let Some(pos) = bucket.iter().position(|c| c.id == contact.id) {
            bucket.remove(pos);
            bucket.push_back(contact);
            return true;
        }
        if bucket.len() < K {
            bucket.push_back(contact);
            return true;
        }
        false
    }

    /// Forget an unresponsive contact
    pub fn remove(&self, id: &NodeId) {
        if let Some(index) = self.self_id.bucket_index(id) {
            self.buckets.write()[index].retain(|c| c.id != *id);
        }
    }

    /// Up to `count` known contacts closest to `target`
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let buckets = self.buckets.read();
        let mut all: Vec<Contact> = buckets.iter().flatten().cloned().collect();
        all.sort_by_key(|c| c.id.distance(target));
        all.truncate(count);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.read().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
