//! Security definition lookups (506/507).

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::dispatch::MessageHandler;
use super::messages::{Message, SecurityDefinitionForSymbolRequest, SecurityDefinitionResponse};
use super::session::{RequestIds, SessionError};
use crate::domain::historical::RequestId;
use crate::domain::market_data::SubscriptionKey;

#[derive(Debug, Default)]
struct Pending {
    waiting: HashMap<RequestId, oneshot::Sender<SecurityDefinitionResponse>>,
    closed: bool,
}

/// Correlates security definition responses with lookups.
#[derive(Debug)]
pub struct SecurityDefinitions {
    pending: Mutex<Pending>,
    outbound: mpsc::Sender<Message>,
    ids: RequestIds,
}

impl SecurityDefinitions {
    /// Create a lookup table writing requests to `outbound`.
    #[must_use]
    pub fn new(outbound: mpsc::Sender<Message>, ids: RequestIds) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            outbound,
            ids,
        }
    }

    /// Ask the server to describe `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session ends before a response.
    pub async fn lookup(
        &self,
        key: &SubscriptionKey,
    ) -> Result<SecurityDefinitionResponse, SessionError> {
        let id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(SessionError::Closed);
            }
            pending.waiting.insert(id, tx);
        }

        let request = SecurityDefinitionForSymbolRequest {
            request_id: id,
            symbol: key.symbol.clone(),
            exchange: key.exchange.clone(),
        };
        if self
            .outbound
            .send(Message::SecurityDefinitionForSymbolRequest(request))
            .await
            .is_err()
        {
            self.pending.lock().waiting.remove(&id);
            return Err(SessionError::Closed);
        }
        tracing::debug!(request_id = id, symbol = %key, "Security definition requested");

        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Lookups awaiting a response.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.lock().waiting.len()
    }
}

impl MessageHandler for SecurityDefinitions {
    fn handle(&self, message: Message) {
        let Message::SecurityDefinitionResponse(response) = message else {
            return;
        };
        let waiter = self.pending.lock().waiting.remove(&response.request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => tracing::debug!(
                request_id = response.request_id,
                "Security definition for unknown request id"
            ),
        }
    }

    fn close(&self) {
        let mut pending = self.pending.lock();
        pending.closed = true;
        pending.waiting.clear();
    }
}
