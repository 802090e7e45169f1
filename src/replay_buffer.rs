use std::collections::VecDeque;

use tokio::sync::Mutex;

/// Bounded history of the most recent items. Once full, the oldest item is evicted first.
#[derive(Debug)]
pub(crate) struct ReplayBuffer<T> {
    history: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone + Send + 'static> ReplayBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub async fn push(&self, item: T) {
        if self.capacity == 0 {
            return;
        }
        let mut history = self.history.lock().await;
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(item);
    }

    /// Current contents in insertion order.
    pub async fn snapshot(&self) -> Vec<T> {
        let history = self.history.lock().await;
        history.iter().cloned().collect()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.history.lock().await.len()
    }
}
