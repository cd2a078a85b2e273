use super::StoreTask;
use crate::{
    error::{Error, Result},
    handler::Messenger,
    routing::contact::Contact,
    storage::DhtValueEntity,
    token::SecurityToken,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;

/// Hands store-forward batches over to the dispatcher task.
pub(crate) struct ChannelMessenger {
    store_tx: mpsc::UnboundedSender<StoreTask>,
    bootstrapped: Arc<AtomicBool>,
}

impl ChannelMessenger {
    pub fn new(store_tx: mpsc::UnboundedSender<StoreTask>, bootstrapped: Arc<AtomicBool>) -> Self {
        Self {
            store_tx,
            bootstrapped,
        }
    }
}

impl Messenger for ChannelMessenger {
    fn send_store_request(
        &self,
        dst: Contact,
        token: Option<SecurityToken>,
        values: Vec<DhtValueEntity>,
    ) -> Result<()> {
        self.store_tx
            .send(StoreTask { dst, token, values })
            .map_err(|_| Error::Closed)
    }

    fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn positive_store_request_is_queued() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let messenger = ChannelMessenger::new(tx, Arc::new(AtomicBool::new(true)));
        let dst = test::alive_contact(test::dummy_node_id(), 3000);

        messenger.send_store_request(dst.clone(), None, Vec::new()).unwrap();

        let task = rx.try_recv().unwrap();
        assert_eq!(task.dst, dst);
        assert!(task.token.is_none());
        assert!(messenger.is_bootstrapped());
    }

    #[test]
    fn negative_closed_dispatcher() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let messenger = ChannelMessenger::new(tx, Arc::new(AtomicBool::new(false)));
        let dst = test::alive_contact(test::dummy_node_id(), 3000);

        assert!(matches!(
            messenger.send_store_request(dst, None, Vec::new()),
            Err(Error::Closed)
        ));
        assert!(!messenger.is_bootstrapped());
    }
}
