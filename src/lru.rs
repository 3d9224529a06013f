// Non-blocking multi-connection I/O multiplexing library.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//     Alexis Sellier <alexis@cloudhead.io>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
// Copyright 2021-2023 Alexis Sellier <alexis@cloudhead.io>. All Rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use std::collections::HashMap;

const NIL: usize = usize::MAX;

struct Node {
    id: String,
    last_active: u64,
    prev: usize,
    next: usize,
}

/// Access-ordered mapping of connection ids to their last-activity timestamp.
///
/// A doubly-linked list threaded through a slab of nodes, with a hash index
/// from id to slot: touching an entry and peeking the least-recently-active
/// one are both O(1). The list head is the oldest entry, the tail the most
/// recently touched one.
pub(crate) struct LruTracker {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    head: usize,
    tail: usize,
    free: Vec<usize>,
}

impl LruTracker {
    pub fn new() -> Self {
        Self {
            nodes: vec![],
            index: empty!(),
            head: NIL,
            tail: NIL,
            free: vec![],
        }
    }

    pub fn is_empty(&self) -> bool { self.index.is_empty() }

    /// Inserts the id as the most recently active entry; an already-tracked
    /// id is just touched.
    pub fn insert(&mut self, id: &str, now: u64) {
        if self.touch(id, now) {
            return;
        }
        let node = Node {
            id: id.to_string(),
            last_active: now,
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.index.insert(id.to_string(), slot);
        self.push_tail(slot);
    }

    /// Refreshes the timestamp of the id and moves it to the most recently
    /// active position. Returns whether the id was tracked.
    pub fn touch(&mut self, id: &str, now: u64) -> bool {
        let Some(&slot) = self.index.get(id) else {
            return false;
        };
        self.nodes[slot].last_active = now;
        if self.tail != slot {
            self.unlink(slot);
            self.push_tail(slot);
        }
        true
    }

    /// Removes the id from tracking. Returns whether the id was tracked.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(slot) = self.index.remove(id) else {
            return false;
        };
        self.unlink(slot);
        self.free.push(slot);
        true
    }

    /// The least-recently-active entry and its timestamp.
    pub fn oldest(&self) -> Option<(&str, u64)> {
        if self.head == NIL {
            return None;
        }
        let node = &self.nodes[self.head];
        Some((&node.id, node.last_active))
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = NIL;
    }

    fn push_tail(&mut self, slot: usize) {
        self.nodes[slot].prev = self.tail;
        self.nodes[slot].next = NIL;
        if self.tail == NIL {
            self.head = slot;
        } else {
            self.nodes[self.tail].next = slot;
        }
        self.tail = slot;
    }
}
