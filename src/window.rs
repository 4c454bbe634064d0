// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Bounded window of in-flight work with job index allocator
//!
//! Window is responsible for associating work with the one byte `job_idx` boards report back
//! with each nonce and for managing this relation for the lifetime of the work. Indices are
//! allocated in circular fashion and an index is never handed out twice while its work is still
//! in the window. When the window is full, the oldest work is evicted first.

use crate::work::Work;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of distinct job indices
const JOB_IDX_SPACE: usize = 256;

/// Work dispatched to a board and waiting for its results
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub job_idx: u8,
    /// Board the work was dispatched to
    pub board: usize,
    pub work: Work,
    pub dispatched: Instant,
    /// Nonces already reported for this work
    nonces: Vec<u32>,
}

/// Result of associating a nonce with work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStatus {
    /// Nonce hasn't been seen for this work yet
    Fresh,
    /// Nonce has already been accounted for this work
    Duplicate,
}

impl WorkItem {
    pub fn new(job_idx: u8, board: usize, work: Work, dispatched: Instant) -> Self {
        Self {
            job_idx,
            board,
            work,
            dispatched,
            nonces: Vec::new(),
        }
    }

    /// Associate nonce with the work and detect duplicates
    pub fn insert_nonce(&mut self, nonce: u32) -> NonceStatus {
        if self.nonces.contains(&nonce) {
            NonceStatus::Duplicate
        } else {
            self.nonces.push(nonce);
            NonceStatus::Fresh
        }
    }

    #[inline]
    pub fn nonce_count(&self) -> usize {
        self.nonces.len()
    }
}

#[derive(Debug)]
pub struct WorkWindow {
    capacity: usize,
    /// Next index to try when allocating, increases modulo 256
    next_job_idx: u8,
    /// In-flight work, oldest first
    items: VecDeque<WorkItem>,
}

impl WorkWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity <= JOB_IDX_SPACE,
            "BUG: invalid work window capacity {}",
            capacity
        );
        Self {
            capacity,
            next_job_idx: 0,
            items: VecDeque::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn has_free_slot(&self) -> bool {
        self.items.len() < self.capacity
    }

    pub fn contains(&self, job_idx: u8) -> bool {
        self.items.iter().any(|item| item.job_idx == job_idx)
    }

    /// Allocate next job index that is not used by any work in the window
    pub fn alloc_job_idx(&mut self) -> Option<u8> {
        for _ in 0..JOB_IDX_SPACE {
            let job_idx = self.next_job_idx;
            self.next_job_idx = self.next_job_idx.wrapping_add(1);
            if !self.contains(job_idx) {
                return Some(job_idx);
            }
        }
        None
    }

    /// Store new work to the window. When the window is full, the oldest work is evicted and
    /// returned.
    pub fn push(&mut self, item: WorkItem) -> Option<WorkItem> {
        assert!(
            !self.contains(item.job_idx),
            "BUG: job index {} is already in flight",
            item.job_idx
        );
        let evicted = if self.has_free_slot() {
            None
        } else {
            self.items.pop_front()
        };
        self.items.push_back(item);
        evicted
    }

    /// Drop the oldest work to make room for new one
    pub fn evict_oldest(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    /// Look-up work by job index
    pub fn find(&self, job_idx: u8) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.job_idx == job_idx)
    }

    pub fn find_mut(&mut self, job_idx: u8) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|item| item.job_idx == job_idx)
    }

    /// Remove work from the window, its job index becomes reusable
    pub fn retire(&mut self, job_idx: u8) -> Option<WorkItem> {
        let position = self.items.iter().position(|item| item.job_idx == job_idx)?;
        self.items.remove(position)
    }

    /// Retire all work dispatched before `now - max_age`
    pub fn expire(&mut self, now: Instant, max_age: Duration) -> Vec<WorkItem> {
        let mut expired = Vec::new();
        while let Some(oldest) = self.items.front() {
            let age = now
                .checked_duration_since(oldest.dispatched)
                .unwrap_or_default();
            if age < max_age {
                break;
            }
            expired.extend(self.items.pop_front());
        }
        expired
    }

    /// Drop all in-flight work
    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        count
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter()
    }
}
