// Daemon-owned shared state: queues, the macro table, and callback registries.
//
// Mutations are serialized per logical resource: each queue has its own
// mutex + condvar, the macro table and the registry each sit under one lock.
// Nothing here touches the wire; the server layer maps faults to result
// codes at its boundary.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::error::{Error, ErrorKind};
use crate::core::model::{Binding, CallbackType, InsertOrder, RegistrationEntry};
use crate::core::name::{generated_queue_name, validate_macro_name, validate_queue_name};

/// How often a parked puller re-checks queue liveness and its connection.
pub const WAIT_TICK: Duration = Duration::from_millis(250);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_unix_ns() -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos).unwrap_or(0)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueEntry {
    pub data: Vec<u8>,
    pub timestamp_ns: u64,
}

#[derive(Debug)]
pub enum Pulled {
    Entry(QueueEntry),
    Empty,
    Deleted,
    Hangup,
}

#[derive(Debug)]
struct QueueInner {
    entries: VecDeque<QueueEntry>,
    alive: bool,
}

/// One hybrid FIFO/LIFO queue. A single stored sequence: FIFO inserts land
/// at the tail, LIFO inserts at the head, pulls always take the head.
#[derive(Debug)]
pub struct Queue {
    inner: Mutex<QueueInner>,
    ready: Condvar,
}

impl Queue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                alive: true,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn add(&self, data: Vec<u8>, order: InsertOrder) -> Result<(), Error> {
        let entry = QueueEntry {
            data,
            timestamp_ns: now_unix_ns(),
        };
        let mut inner = lock(&self.inner);
        if !inner.alive {
            return Err(Error::new(ErrorKind::NotFound).with_message("queue was deleted"));
        }
        match order {
            InsertOrder::Fifo => inner.entries.push_back(entry),
            InsertOrder::Lifo => inner.entries.push_front(entry),
        }
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    /// Pull the head entry. With `wait`, parks until an entry arrives, the
    /// queue is deleted, or `peer_alive` reports the requesting connection
    /// gone. Delivery is exactly-once: the pop happens under the queue lock.
    pub fn pull(&self, wait: bool, peer_alive: &mut dyn FnMut() -> bool) -> Pulled {
        let mut inner = lock(&self.inner);
        loop {
            if !inner.alive {
                return Pulled::Deleted;
            }
            if let Some(entry) = inner.entries.pop_front() {
                return Pulled::Entry(entry);
            }
            if !wait {
                return Pulled::Empty;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(inner, WAIT_TICK)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner = guard;
            if !peer_alive() {
                return Pulled::Hangup;
            }
        }
    }

    pub fn len(&self) -> u64 {
        lock(&self.inner).entries.len() as u64
    }

    pub fn clear(&self) {
        lock(&self.inner).entries.clear();
    }

    /// Mark the queue dead and wake every parked puller so the pending calls
    /// fail instead of hanging.
    fn kill(&self) {
        let mut inner = lock(&self.inner);
        inner.alive = false;
        inner.entries.clear();
        drop(inner);
        self.ready.notify_all();
    }
}

struct SessionSlot {
    queue: Arc<Queue>,
    refs: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MacroRecord {
    pub name: String,
    pub image: Vec<u8>,
    pub order: u32,
}

/// Everything the daemon owns. Clients never mutate shared state directly.
pub struct State {
    named: Mutex<HashMap<String, (String, Arc<Queue>)>>,
    sessions: Mutex<HashMap<u64, SessionSlot>>,
    next_handle: AtomicU64,
    macros: Mutex<Vec<MacroRecord>>,
    registry: Mutex<HashMap<(CallbackType, String), RegistrationEntry>>,
}

impl State {
    pub fn new() -> Self {
        Self {
            named: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            macros: Mutex::new(Vec::new()),
            registry: Mutex::new(HashMap::new()),
        }
    }

    // --- named queues -----------------------------------------------------

    /// Create a named queue. A collision is never an error: the daemon
    /// manufactures a fresh unique name and reports `duplicate = true`.
    pub fn create_named(&self, name: &str) -> Result<(String, bool), Error> {
        validate_queue_name(name)?;
        let mut named = lock(&self.named);
        let key = name.to_ascii_uppercase();
        if !named.contains_key(&key) {
            named.insert(key, (name.to_string(), Arc::new(Queue::new())));
            return Ok((name.to_string(), false));
        }
        loop {
            let fresh = generated_queue_name()?;
            let fresh_key = fresh.to_ascii_uppercase();
            if !named.contains_key(&fresh_key) {
                named.insert(fresh_key, (fresh.clone(), Arc::new(Queue::new())));
                return Ok((fresh, true));
            }
        }
    }

    /// Attach to a named queue, creating it if absent; reports whether it
    /// already existed.
    pub fn open_named(&self, name: &str) -> Result<bool, Error> {
        validate_queue_name(name)?;
        let mut named = lock(&self.named);
        let key = name.to_ascii_uppercase();
        if named.contains_key(&key) {
            return Ok(true);
        }
        named.insert(key, (name.to_string(), Arc::new(Queue::new())));
        Ok(false)
    }

    pub fn delete_named(&self, name: &str) -> Result<(), Error> {
        validate_queue_name(name)?;
        let mut named = lock(&self.named);
        match named.remove(&name.to_ascii_uppercase()) {
            Some((_, queue)) => {
                queue.kill();
                Ok(())
            }
            None => Err(Error::new(ErrorKind::NotFound).with_message("queue is not registered")),
        }
    }

    pub fn query_named(&self, name: &str) -> Result<bool, Error> {
        validate_queue_name(name)?;
        Ok(lock(&self.named).contains_key(&name.to_ascii_uppercase()))
    }

    pub fn named_queue(&self, name: &str) -> Result<Arc<Queue>, Error> {
        validate_queue_name(name)?;
        lock(&self.named)
            .get(&name.to_ascii_uppercase())
            .map(|(_, queue)| Arc::clone(queue))
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("queue is not registered"))
    }

    // --- session queues ---------------------------------------------------

    pub fn session_create(&self) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        lock(&self.sessions).insert(
            handle,
            SessionSlot {
                queue: Arc::new(Queue::new()),
                refs: 1,
            },
        );
        handle
    }

    /// Nest onto an inherited session queue: refcount++, same queue.
    pub fn session_attach(&self, handle: u64) -> Result<(), Error> {
        let mut sessions = lock(&self.sessions);
        match sessions.get_mut(&handle) {
            Some(slot) => {
                slot.refs += 1;
                Ok(())
            }
            None => Err(Error::new(ErrorKind::NotFound).with_message("unknown session queue")),
        }
    }

    /// Drop one reference; only the last releaser triggers deletion.
    pub fn session_detach(&self, handle: u64) -> Result<(), Error> {
        let mut sessions = lock(&self.sessions);
        let slot = sessions
            .get_mut(&handle)
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("unknown session queue"))?;
        slot.refs -= 1;
        if slot.refs == 0 {
            let slot = sessions.remove(&handle);
            if let Some(slot) = slot {
                slot.queue.kill();
            }
        }
        Ok(())
    }

    /// Explicit deletion is honored only when no other process still holds a
    /// reference; otherwise the queue is in use.
    pub fn session_delete(&self, handle: u64) -> Result<(), Error> {
        let mut sessions = lock(&self.sessions);
        let slot = sessions
            .get(&handle)
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("unknown session queue"))?;
        if slot.refs > 1 {
            return Err(Error::new(ErrorKind::AccessDenied)
                .with_message("session queue is still referenced"));
        }
        if let Some(slot) = sessions.remove(&handle) {
            slot.queue.kill();
        }
        Ok(())
    }

    /// Live session queues, for daemon status reporting.
    pub fn session_count(&self) -> u64 {
        lock(&self.sessions).len() as u64
    }

    pub fn session_queue(&self, handle: u64) -> Result<Arc<Queue>, Error> {
        lock(&self.sessions)
            .get(&handle)
            .map(|slot| Arc::clone(&slot.queue))
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("unknown session queue"))
    }

    // --- macro space ------------------------------------------------------

    fn macro_index(macros: &[MacroRecord], name: &str) -> Option<usize> {
        macros
            .iter()
            .position(|record| record.name.eq_ignore_ascii_case(name))
    }

    /// Add or replace a macro. Re-adding an existing name updates its image
    /// and position in place.
    pub fn macro_add(&self, name: &str, image: Vec<u8>, order: u32) -> Result<(), Error> {
        validate_macro_name(name)?;
        let mut macros = lock(&self.macros);
        match Self::macro_index(&macros, name) {
            Some(index) => {
                macros[index].image = image;
                macros[index].order = order;
            }
            None => macros.push(MacroRecord {
                name: name.to_string(),
                image,
                order,
            }),
        }
        Ok(())
    }

    pub fn macro_remove(&self, name: &str) -> Result<(), Error> {
        let mut macros = lock(&self.macros);
        match Self::macro_index(&macros, name) {
            Some(index) => {
                macros.remove(index);
                Ok(())
            }
            None => Err(Error::new(ErrorKind::NotFound).with_message("unknown macro")),
        }
    }

    pub fn macro_clear(&self) {
        lock(&self.macros).clear();
    }

    pub fn macro_get(&self, name: &str) -> Result<MacroRecord, Error> {
        let macros = lock(&self.macros);
        Self::macro_index(&macros, name)
            .map(|index| macros[index].clone())
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("unknown macro"))
    }

    pub fn macro_query(&self, name: &str) -> Result<u32, Error> {
        let macros = lock(&self.macros);
        Self::macro_index(&macros, name)
            .map(|index| macros[index].order)
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("unknown macro"))
    }

    pub fn macro_reorder(&self, name: &str, order: u32) -> Result<(), Error> {
        let mut macros = lock(&self.macros);
        match Self::macro_index(&macros, name) {
            Some(index) => {
                macros[index].order = order;
                Ok(())
            }
            None => Err(Error::new(ErrorKind::NotFound).with_message("unknown macro")),
        }
    }

    pub fn macro_count(&self) -> u64 {
        lock(&self.macros).len() as u64
    }

    /// Stable snapshot in resolution order (position, then insertion) for the
    /// save iteration cursor.
    pub fn macro_snapshot(&self) -> Vec<MacroRecord> {
        let macros = lock(&self.macros);
        let mut snapshot: Vec<MacroRecord> = macros.clone();
        snapshot.sort_by_key(|record| record.order);
        snapshot
    }

    // --- registrations ----------------------------------------------------

    /// Register a callback binding. An existing `(type, name)` key is left
    /// untouched and reported as a duplicate, never overwritten.
    pub fn register(
        &self,
        kind: CallbackType,
        name: &str,
        entry: RegistrationEntry,
    ) -> Result<bool, Error> {
        if name.is_empty() {
            return Err(Error::new(ErrorKind::BadArgument).with_message("empty callback name"));
        }
        let mut registry = lock(&self.registry);
        let key = (kind, name.to_string());
        if registry.contains_key(&key) {
            return Ok(true);
        }
        registry.insert(key, entry);
        Ok(false)
    }

    /// Unqualified drop removes unconditionally (subject to drop authority);
    /// a qualified drop removes only a binding to that specific library.
    pub fn deregister(
        &self,
        kind: CallbackType,
        name: &str,
        library: Option<&str>,
    ) -> Result<(), Error> {
        let mut registry = lock(&self.registry);
        let key = (kind, name.to_string());
        let entry = registry
            .get(&key)
            .ok_or_else(|| Error::new(ErrorKind::NotFound).with_message("not registered"))?;
        if !entry.drop_authority {
            return Err(
                Error::new(ErrorKind::AccessDenied).with_message("registration is drop-protected")
            );
        }
        if let Some(library) = library {
            match &entry.binding {
                Binding::Library { library: bound, .. } if bound == library => {}
                _ => {
                    return Err(
                        Error::new(ErrorKind::NotFound).with_message("no binding to that library")
                    );
                }
            }
        }
        registry.remove(&key);
        Ok(())
    }

    pub fn lookup(
        &self,
        kind: CallbackType,
        name: &str,
        library: Option<&str>,
    ) -> Option<RegistrationEntry> {
        let registry = lock(&self.registry);
        let entry = registry.get(&(kind, name.to_string()))?;
        if let Some(library) = library {
            match &entry.binding {
                Binding::Library { library: bound, .. } if bound == library => {}
                _ => return None,
            }
        }
        Some(entry.clone())
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}
