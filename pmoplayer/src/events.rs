use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::model::PlayerEvent;

/// Fan-out of player events to every live subscriber.
#[derive(Clone, Default)]
pub struct PlayerEventBus {
    subscribers: Arc<Mutex<Vec<Sender<PlayerEvent>>>>,
}

impl PlayerEventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> Receiver<PlayerEvent> {
        let (tx, rx) = unbounded::<PlayerEvent>();
        {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.push(tx);
        }
        rx
    }

    /// Dropped receivers are pruned here.
    pub fn broadcast(&self, event: PlayerEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
