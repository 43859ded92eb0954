use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use rally_shared::errors::{AppResult, ErrorCode};

use crate::models::{Candidate, SwipeAction};

/// A swipe that left the deck but has not been confirmed by the data service.
#[derive(Debug, PartialEq, Eq)]
pub struct PendingSwipe {
    deck: Uuid,
    ticket: u64,
    target: Uuid,
    action: SwipeAction,
}

impl PendingSwipe {
    pub fn target(&self) -> Uuid {
        self.target
    }

    pub fn action(&self) -> SwipeAction {
        self.action
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Confirmed,
    RolledBack,
    /// The ticket did not belong to this deck.
    Stale,
}

/// Local card stack for one user's discovery session.
///
/// Swiping advances the deck immediately; the card is parked until the
/// remote write settles and goes back on top if the write failed.
#[derive(Debug)]
pub struct SwipeDeck {
    /// Tickets are only unique within one deck.
    id: Uuid,
    user_id: Uuid,
    queue: VecDeque<Candidate>,
    pending: HashMap<u64, Candidate>,
    next_ticket: u64,
}

impl SwipeDeck {
    pub fn new(user_id: Uuid, candidates: Vec<Candidate>) -> Self {
        let mut deck = Self {
            id: Uuid::new_v4(),
            user_id,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            next_ticket: 0,
        };
        deck.refill(candidates);
        deck
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn top(&self) -> Option<&Candidate> {
        self.queue.front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Appends a fresh discovery page, skipping cards already in the deck or in flight.
    pub fn refill(&mut self, candidates: Vec<Candidate>) -> usize {
        let mut known: HashSet<Uuid> = self
            .queue
            .iter()
            .chain(self.pending.values())
            .map(|c| c.profile.id)
            .collect();

        let before = self.queue.len();
        for candidate in candidates {
            if known.insert(candidate.profile.id) {
                self.queue.push_back(candidate);
            }
        }
        self.queue.len() - before
    }

    /// Takes the top card off the deck. `None` when the deck is empty.
    pub fn swipe(&mut self, action: SwipeAction) -> Option<PendingSwipe> {
        let candidate = self.queue.pop_front()?;
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let pending = PendingSwipe {
            deck: self.id,
            ticket,
            target: candidate.profile.id,
            action,
        };
        self.pending.insert(ticket, candidate);
        Some(pending)
    }

    /// Resolves a pending swipe with the outcome of its remote write.
    ///
    /// An `AlreadySwiped` rejection confirms: the decision is on record either way.
    pub fn settle<T>(&mut self, swipe: PendingSwipe, result: &AppResult<T>) -> Settlement {
        if swipe.deck != self.id {
            return Settlement::Stale;
        }
        let Some(candidate) = self.pending.remove(&swipe.ticket) else {
            return Settlement::Stale;
        };

        match result {
            Ok(_) => Settlement::Confirmed,
            Err(e) if e.is(ErrorCode::AlreadySwiped) => Settlement::Confirmed,
            Err(e) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    target = %swipe.target,
                    error = %e,
                    "swipe failed, card returned to deck"
                );
                self.queue.push_front(candidate);
                Settlement::RolledBack
            }
        }
    }
}
