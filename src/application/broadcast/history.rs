use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use serde_json::Value;

use super::messages::{Event, EventId, EventKind};

type Ring = VecDeque<Arc<Event>>;

fn lock(ring: &Mutex<Ring>) -> MutexGuard<'_, Ring> {
    ring.lock().unwrap_or_else(PoisonError::into_inner)
}

fn push_bounded(ring: &mut Ring, event: Arc<Event>, cap: usize) {
    ring.push_back(event);
    while ring.len() > cap {
        ring.pop_front();
    }
}

/// Result of a replay lookup.
#[derive(Debug, Clone)]
pub struct Replay {
    pub events: Vec<Arc<Event>>,
    /// The cursor was not retained and the whole history for the symbols was returned
    pub fallback: bool,
}

/// Bounded event history: one global ring plus one ring per symbol for symbol-scoped kinds.
///
/// Event ids are assigned under the global ring lock, so the global ring is always in id order.
#[derive(Debug)]
pub struct EventHistory {
    max_global: usize,
    max_per_symbol: usize,
    next_id: Mutex<u64>,
    global: Mutex<Ring>,
    per_symbol: RwLock<HashMap<String, Arc<Mutex<Ring>>>>,
}

impl EventHistory {
    pub fn new(max_global: usize, max_per_symbol: usize) -> Self {
        Self {
            max_global: max_global.max(1),
            max_per_symbol: max_per_symbol.max(1),
            next_id: Mutex::new(0),
            global: Mutex::new(VecDeque::new()),
            per_symbol: RwLock::new(HashMap::new()),
        }
    }

    /// Stamps a new event with the next id and appends it to the rings.
    pub fn record(&self, kind: EventKind, symbol: Option<String>, data: Value) -> Arc<Event> {
        let event = {
            let mut global = lock(&self.global);
            let mut next_id = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
            *next_id += 1;
            let event = Arc::new(Event {
                event_id: EventId(*next_id),
                kind,
                timestamp: Utc::now(),
                symbol,
                data,
            });
            push_bounded(&mut global, event.clone(), self.max_global);
            event
        };

        if let (true, Some(symbol)) = (kind.is_symbol_scoped(), event.symbol.as_deref()) {
            let ring = self.symbol_ring(symbol);
            push_bounded(&mut lock(&ring), event.clone(), self.max_per_symbol);
        }
        event
    }

    fn symbol_ring(&self, symbol: &str) -> Arc<Mutex<Ring>> {
        if let Some(ring) = self
            .per_symbol
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
        {
            return ring.clone();
        }
        self.per_symbol
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(symbol.to_string())
            .or_default()
            .clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.global).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn symbol_events(&self, symbol: &str) -> Vec<Arc<Event>> {
        let ring = self
            .per_symbol
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .cloned();
        ring.map(|r| lock(&r).iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Events strictly after `cursor` matching `symbols` (empty set matches all; events
    /// without a symbol always match). A cursor that is no longer retained yields the
    /// full retained history for `symbols` with `fallback` set.
    pub fn replay(&self, cursor: Option<EventId>, symbols: &HashSet<String>) -> Replay {
        let matches = |event: &Arc<Event>| match &event.symbol {
            Some(symbol) => symbols.is_empty() || symbols.contains(symbol),
            None => true,
        };

        let global: Vec<Arc<Event>> = lock(&self.global).iter().cloned().collect();

        let Some(cursor) = cursor else {
            return Replay {
                events: global.into_iter().filter(matches).collect(),
                fallback: false,
            };
        };

        if let Some(pos) = global.iter().position(|e| e.event_id == cursor) {
            return Replay {
                events: global[pos + 1..].iter().filter(|e| matches(e)).cloned().collect(),
                fallback: false,
            };
        }

        if symbols.is_empty() {
            return Replay {
                events: global,
                fallback: true,
            };
        }

        // Per-symbol rings can outlive the global ring for quiet symbols
        let mut seen = HashSet::new();
        let mut events: Vec<Arc<Event>> = Vec::new();
        let mut cursor_retained = false;
        for symbol in symbols {
            for event in self.symbol_events(symbol) {
                cursor_retained |= event.event_id == cursor;
                if seen.insert(event.event_id) {
                    events.push(event);
                }
            }
        }
        for event in global.into_iter().filter(matches) {
            if seen.insert(event.event_id) {
                events.push(event);
            }
        }
        events.sort_by_key(|e| e.event_id);

        if cursor_retained {
            events.retain(|e| e.event_id > cursor);
        }
        Replay {
            events,
            fallback: !cursor_retained,
        }
    }
}
