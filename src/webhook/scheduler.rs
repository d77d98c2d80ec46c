//! Retry scheduler
//!
//! Cancellable background tasks keyed by delivery id. A task removes itself
//! from the table when it finishes; `cancel` aborts it. The pending count is
//! published on a `watch` channel so callers can wait for the queue to drain.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Entry {
    serial: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Table {
    next_serial: u64,
    entries: HashMap<String, Entry>,
}

#[derive(Clone)]
pub struct RetryScheduler {
    table: Arc<Mutex<Table>>,
    pending: Arc<watch::Sender<usize>>,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            pending: Arc::new(pending),
        }
    }
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, table: &Table) {
        self.pending.send_replace(table.entries.len());
    }

    /// Run `task` in the background under `key`, aborting any task already
    /// scheduled under the same key.
    pub fn schedule<F>(&self, key: String, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut table = self.table();
        table.next_serial += 1;
        let serial = table.next_serial;

        let this = self.clone();
        let done_key = key.clone();
        // The table lock is held until the entry is inserted, so the
        // completion cleanup below always finds it.
        let handle = tokio::spawn(async move {
            task.await;
            let mut table = this.table();
            if table
                .entries
                .get(&done_key)
                .is_some_and(|entry| entry.serial == serial)
            {
                table.entries.remove(&done_key);
            }
            this.publish(&table);
        });

        if let Some(previous) = table.entries.insert(key, Entry { serial, handle }) {
            previous.handle.abort();
        }
        self.publish(&table);
    }

    /// Abort the task under `key`. Returns whether one was scheduled.
    pub fn cancel(&self, key: &str) -> bool {
        let mut table = self.table();
        let removed = table.entries.remove(key);
        self.publish(&table);
        match removed {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.table().entries.contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.table().entries.len()
    }

    /// Wait until no task is scheduled.
    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }
}
