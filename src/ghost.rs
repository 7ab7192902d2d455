//! Append-only ledger, candidate proposals, and deterministic collapse for
//! a group of speculative-state "ghosts".
//!
//! `GhostEngine` owns its ledger and scheduling queue as instance fields
//! rather than process statics, so multiple independent engines can coexist
//! and concurrent use just needs an external lock owned by the caller around
//! the whole engine. The ghost's state and each candidate's payload are
//! generic over a type parameter `S` rather than an opaque pointer + size.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{Error, Result};

/// The FNV-1a-64 accumulator's starting value, also mixed in as the first
/// fixed constant of the collapse seed.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(start: u64, bytes: &[u8]) -> u64 {
    let mut acc = start;
    for &byte in bytes {
        acc ^= u64::from(byte);
        acc = acc.wrapping_mul(FNV_PRIME);
    }
    acc
}

/// Computes the collapse seed: starting from the fixed offset basis,
/// successive FNV-1a-64 sub-hashes — each one starting from the prior
/// accumulator XOR'd with the offset basis — over the ledger length at
/// propose time, the ghost id, the step index, and each candidate tag in
/// order. Integer fields are encoded little-endian so the result is
/// identical across runs, platforms, and word orderings; a platform-native
/// encoding would not give that.
fn collapse_seed(ledger_len_at_propose: u64, ghost_id: &[u8], step_index: u64, tags: &[String]) -> u64 {
    let mut acc = FNV_OFFSET_BASIS;
    acc = fnv1a(acc ^ FNV_OFFSET_BASIS, &ledger_len_at_propose.to_le_bytes());
    acc = fnv1a(acc ^ FNV_OFFSET_BASIS, ghost_id);
    acc = fnv1a(acc ^ FNV_OFFSET_BASIS, &step_index.to_le_bytes());
    for tag in tags {
        acc = fnv1a(acc ^ FNV_OFFSET_BASIS, tag.as_bytes());
    }
    acc
}

/// A speculative next-state proposal: an owned state value plus a short tag.
pub struct Candidate<S> {
    pub data: S,
    pub tag: String,
}

impl<S> Candidate<S> {
    /// `tag` is truncated to 63 bytes.
    pub fn new(data: S, tag: impl Into<String>) -> Self {
        let mut tag = tag.into();
        truncate_to_63_bytes(&mut tag);
        Self { data, tag }
    }
}

fn truncate_to_63_bytes(s: &mut String) {
    if s.len() > 63 {
        let mut end = 63;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
}

/// One append-only ledger record.
pub struct LedgerEntry<S> {
    pub ghost_id: String,
    pub step_index: u64,
    pub proposal_present: bool,
    pub candidate_tags: Vec<String>,
    pub chosen_index: Option<usize>,
    pub state: Option<Rc<S>>,
}

struct GhostInner<S> {
    id: String,
    state: Option<Rc<S>>,
    proposal: Option<Vec<Candidate<S>>>,
    proposal_ledger_len: Option<u64>,
    step_fn: Option<Box<dyn FnMut() -> S>>,
    finished: bool,
    step_index: u64,
}

/// A handle to one ghost's speculative-state history.
///
/// Duplicate ids are permitted; two handles are the same ghost iff
/// [`Self::is_same_ghost`] says so — identity is the handle's own shared
/// allocation, not the id string.
pub struct GhostHandle<S>(Rc<RefCell<GhostInner<S>>>);

impl<S> Clone for GhostHandle<S> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<S> GhostHandle<S> {
    #[must_use]
    pub fn is_same_ghost(&self, other: &GhostHandle<S>) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn id(&self) -> String {
        self.0.borrow().id.clone()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.0.borrow().finished
    }

    #[must_use]
    pub fn step_index(&self) -> u64 {
        self.0.borrow().step_index
    }

    #[must_use]
    pub fn state(&self) -> Option<Rc<S>> {
        self.0.borrow().state.clone()
    }

    #[must_use]
    pub fn has_pending_proposal(&self) -> bool {
        self.0.borrow().proposal.is_some()
    }
}

/// Owns the append-only ledger and scheduling queue for a group of ghosts.
/// Single-writer by contract: concurrent use from multiple threads requires
/// an external lock around the whole engine.
pub struct GhostEngine<S> {
    ledger: VecDeque<LedgerEntry<S>>,
    ledger_capacity: usize,
    queue: VecDeque<GhostHandle<S>>,
    queue_capacity: usize,
}

impl<S: Clone> GhostEngine<S> {
    #[must_use]
    pub fn new(ledger_capacity: usize, queue_capacity: usize) -> Self {
        Self {
            ledger: VecDeque::with_capacity(ledger_capacity.min(1024)),
            ledger_capacity: ledger_capacity.max(1),
            queue: VecDeque::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Resets the ledger and scheduling queue to empty.
    pub fn init(&mut self) {
        self.ledger.clear();
        self.queue.clear();
    }

    fn push_ledger(&mut self, entry: LedgerEntry<S>) {
        if self.ledger.len() >= self.ledger_capacity {
            // Ring-buffer discipline: evict the oldest entry so every other
            // operation stays infallible with respect to ledger space.
            self.ledger.pop_front();
        }
        self.ledger.push_back(entry);
    }

    /// Creates a new ghost handle, truncates `id` to 63 bytes, and records
    /// its initial ledger entry at step 0.
    pub fn create(&mut self, id: impl Into<String>, step_fn: Option<Box<dyn FnMut() -> S>>) -> GhostHandle<S> {
        let mut id = id.into();
        truncate_to_63_bytes(&mut id);
        let handle = GhostHandle(Rc::new(RefCell::new(GhostInner {
            id: id.clone(),
            state: None,
            proposal: None,
            proposal_ledger_len: None,
            step_fn,
            finished: false,
            step_index: 0,
        })));
        self.push_ledger(LedgerEntry {
            ghost_id: id,
            step_index: 0,
            proposal_present: false,
            candidate_tags: Vec::new(),
            chosen_index: None,
            state: None,
        });
        handle
    }

    /// Attaches `candidates` to `ghost` and appends a ledger entry recording
    /// the (pre-incremented) step index and the candidates' tags. Rejects an
    /// empty candidate list with [`Error::InvalidArgument`], since collapse
    /// requires at least one candidate to choose among.
    pub fn propose(&mut self, ghost: &GhostHandle<S>, candidates: Vec<Candidate<S>>) -> Result<()> {
        if candidates.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let (id, step_index, tags, ledger_len) = {
            let mut inner = ghost.0.borrow_mut();
            if inner.finished {
                return Err(Error::Finished);
            }
            inner.step_index += 1;
            let tags: Vec<String> = candidates.iter().map(|c| c.tag.clone()).collect();
            let ledger_len = self.ledger.len() as u64;
            inner.proposal_ledger_len = Some(ledger_len);
            inner.proposal = Some(candidates);
            (inner.id.clone(), inner.step_index, tags, ledger_len)
        };
        let _ = ledger_len;
        self.push_ledger(LedgerEntry {
            ghost_id: id,
            step_index,
            proposal_present: true,
            candidate_tags: tags,
            chosen_index: None,
            state: None,
        });
        Ok(())
    }

    /// Computes the deterministic seed over the pending proposal, installs
    /// the chosen candidate's data as the ghost's state, records the choice
    /// into that proposal's ledger entry, and returns the chosen index.
    pub fn collapse(&mut self, ghost: &GhostHandle<S>) -> Result<usize> {
        let (candidates, ledger_len_at_propose, step_index, id) = {
            let mut inner = ghost.0.borrow_mut();
            let candidates = inner.proposal.take().ok_or(Error::InvalidArgument)?;
            let ledger_len_at_propose = inner.proposal_ledger_len.take().unwrap_or(0);
            (candidates, ledger_len_at_propose, inner.step_index, inner.id.clone())
        };
        if candidates.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let tags: Vec<String> = candidates.iter().map(|c| c.tag.clone()).collect();
        let seed = collapse_seed(ledger_len_at_propose, id.as_bytes(), step_index, &tags);
        let chosen = (seed % candidates.len() as u64) as usize;
        let state = Rc::new(candidates[chosen].data.clone());

        ghost.0.borrow_mut().state = Some(Rc::clone(&state));

        if let Some(entry) = self
            .ledger
            .iter_mut()
            .rev()
            .find(|e| e.ghost_id == id && e.step_index == step_index && e.proposal_present && e.chosen_index.is_none())
        {
            entry.chosen_index = Some(chosen);
            entry.state = Some(state);
        }
        tracing::debug!(ghost_id = %id, step_index, chosen, "ghost proposal collapsed");
        Ok(chosen)
    }

    /// For a ghost with no pending proposal, invokes its step function to
    /// produce the next state, installs it, advances the step index, and
    /// appends a (no-proposal) ledger entry.
    pub fn step(&mut self, ghost: &GhostHandle<S>) -> Result<()> {
        let mut step_fn = {
            let mut inner = ghost.0.borrow_mut();
            if inner.finished {
                return Err(Error::Finished);
            }
            if inner.proposal.is_some() {
                return Err(Error::Busy);
            }
            inner.step_fn.take().ok_or(Error::Unsupported)?
        };
        let next_state = step_fn();
        let (id, step_index) = {
            let mut inner = ghost.0.borrow_mut();
            inner.step_fn = Some(step_fn);
            inner.step_index += 1;
            let state = Rc::new(next_state);
            inner.state = Some(Rc::clone(&state));
            self.push_ledger(LedgerEntry {
                ghost_id: inner.id.clone(),
                step_index: inner.step_index,
                proposal_present: false,
                candidate_tags: Vec::new(),
                chosen_index: None,
                state: Some(state),
            });
            (inner.id.clone(), inner.step_index)
        };
        let _ = (id, step_index);
        Ok(())
    }

    /// Appends to the scheduling queue. Returns [`Error::Busy`] when the
    /// queue is at capacity.
    pub fn queue_add(&mut self, ghost: GhostHandle<S>) -> Result<()> {
        if self.queue.len() >= self.queue_capacity {
            return Err(Error::Busy);
        }
        self.queue.push_back(ghost);
        Ok(())
    }

    /// For each currently queued ghost, collapses its pending proposal or
    /// invokes its step function. Ghosts that are
    /// not yet finished afterward are re-queued for the next call; finished
    /// ghosts are dropped from the queue. Returns [`Error::InvalidArgument`]
    /// if the queue was empty.
    pub fn schedule(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let pending: Vec<GhostHandle<S>> = self.queue.drain(..).collect();
        for ghost in pending {
            if !ghost.is_finished() {
                if ghost.has_pending_proposal() {
                    let _ = self.collapse(&ghost);
                } else {
                    let _ = self.step(&ghost);
                }
            }
            if !ghost.is_finished() {
                self.queue.push_back(ghost);
            }
        }
        Ok(())
    }

    /// Clears the ghost's own fields and marks it finished. The ledger
    /// itself is append-only and untouched.
    pub fn dispose(&mut self, ghost: &GhostHandle<S>) {
        let mut inner = ghost.0.borrow_mut();
        inner.proposal = None;
        inner.proposal_ledger_len = None;
        inner.state = None;
        inner.step_fn = None;
        inner.finished = true;
    }

    #[must_use]
    pub fn ledger_len(&self) -> usize {
        self.ledger.len()
    }

    pub fn ledger_entries(&self) -> impl Iterator<Item = &LedgerEntry<S>> {
        self.ledger.iter()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }
}
