use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::{
    sync::mpsc::{self, error::SendTimeoutError},
    task::JoinSet,
};

use super::events::HubEvent;
use crate::error::EngineError;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    sink: mpsc::Sender<HubEvent>,
}

/// Delivery counts for one publish.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub timed_out: usize,
    pub pruned: usize,
}

/// Per-session fan-out to live observers. Best effort: no replay, a slow
/// subscriber loses the event after `send_timeout`, a closed one is removed.
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    send_timeout: Duration,
}

impl BroadcastHub {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            send_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Subscriber>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn subscribe(&self, session_id: &str, sink: mpsc::Sender<HubEvent>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(session_id.to_string())
            .or_default()
            .push(Subscriber { id, sink });
        log_debug!("subscriber {id} joined session {session_id}");
        id
    }

    /// Returns whether the subscriber was registered for that session.
    pub fn unsubscribe(&self, session_id: &str, id: SubscriberId) -> bool {
        let mut map = self.lock();
        let Some(list) = map.get_mut(session_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|subscriber| subscriber.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(session_id);
        }
        removed
    }

    /// Drops every subscription held by `id`, whatever the session.
    pub fn unsubscribe_all(&self, id: SubscriberId) {
        let mut map = self.lock();
        map.retain(|_, list| {
            list.retain(|subscriber| subscriber.id != id);
            !list.is_empty()
        });
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.lock().get(session_id).map_or(0, Vec::len)
    }

    pub async fn publish(&self, session_id: &str, event: HubEvent) -> PublishReport {
        // Snapshot the sinks so the lock is never held across an await.
        let targets: Vec<(SubscriberId, mpsc::Sender<HubEvent>)> = self
            .lock()
            .get(session_id)
            .map(|list| {
                list.iter()
                    .map(|subscriber| (subscriber.id, subscriber.sink.clone()))
                    .collect()
            })
            .unwrap_or_default();

        // Deliveries run side by side, so a publish waits at most one timeout
        // however many subscribers are slow.
        let mut sends = JoinSet::new();
        for (id, sink) in targets {
            let event = event.clone();
            let send_timeout = self.send_timeout;
            sends.spawn(async move { (id, sink.send_timeout(event, send_timeout).await) });
        }

        let mut report = PublishReport::default();
        let mut closed = Vec::new();
        while let Some(joined) = sends.join_next().await {
            let (id, result) = match joined {
                Ok(sent) => sent,
                Err(err) => {
                    log_warn!("{} delivery task for session {session_id} failed: {err}", event.name());
                    continue;
                }
            };
            match result {
                Ok(()) => report.delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    report.timed_out += 1;
                    let err = EngineError::Broadcast(format!(
                        "{} to subscriber {id} of session {session_id} timed out",
                        event.name()
                    ));
                    log_warn!("{err}");
                }
                Err(SendTimeoutError::Closed(_)) => closed.push(id),
            }
        }

        if !closed.is_empty() {
            report.pruned = closed.len();
            let mut map = self.lock();
            if let Some(list) = map.get_mut(session_id) {
                list.retain(|subscriber| !closed.contains(&subscriber.id));
                if list.is_empty() {
                    map.remove(session_id);
                }
            }
        }

        report
    }
}
