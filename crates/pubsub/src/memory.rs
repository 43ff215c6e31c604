use std::collections::VecDeque;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::{Message, MessageSource, ReceivedMessage};

/// Process-local [`MessageSource`] for tests and local runs.
///
/// Acknowledged ids are recorded instead of discarded. Nothing is ever redelivered.
#[derive(Default)]
pub struct InMemoryChannel {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    next_id: u64,
    pending: VecDeque<ReceivedMessage>,
    acked: Vec<String>,
    extended: Vec<(String, u32)>,
}

impl InMemoryChannel {
    pub fn new() -> Self { Self::default() }

    /// Enqueues a message and returns its id, which doubles as its ack id.
    pub async fn publish(&self, data: impl Into<Vec<u8>>) -> String {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id.to_string();
        state.pending.push_back(ReceivedMessage {
            ack_id: id.clone(),
            message: Message { id: id.clone(), data: data.into(), ..Default::default() },
        });
        self.notify.notify_one();
        id
    }

    /// Messages not yet pulled.
    pub async fn pending(&self) -> usize { self.state.lock().await.pending.len() }

    /// Ack ids in acknowledgement order.
    pub async fn acked(&self) -> Vec<String> { self.state.lock().await.acked.clone() }

    /// Ack deadline extensions as `(ack id, seconds)`, oldest first.
    pub async fn extensions(&self) -> Vec<(String, u32)> {
        self.state.lock().await.extended.clone()
    }
}

#[async_trait]
impl MessageSource for InMemoryChannel {
    async fn pull(&self, max: usize) -> Result<Vec<ReceivedMessage>> {
        loop {
            {
                let mut state = self.state.lock().await;
                if !state.pending.is_empty() {
                    let count = max.min(state.pending.len());
                    return Ok(state.pending.drain(..count).collect());
                }
            }
            self.notify.notified().await;
        }
    }

    async fn acknowledge(&self, ack_ids: &[String]) -> Result<()> {
        self.state.lock().await.acked.extend_from_slice(ack_ids);
        Ok(())
    }

    async fn modify_ack_deadline(&self, ack_ids: &[String], seconds: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.extended.extend(ack_ids.iter().map(|id| (id.clone(), seconds)));
        Ok(())
    }
}
