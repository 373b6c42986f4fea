//! Mailbox registry and delivery

use crate::{
    metrics::{MESSAGES_DROPPED, MESSAGES_SENT, MESSAGES_UNREACHABLE, REQUEST_DURATION},
    types::{DropRule, Envelope, Mailbox, Message, Responder},
    Error, Result,
};
use async_trait::async_trait;
use dashmap::DashMap;
use line_ledger::NodeId;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Delivery between nodes
#[async_trait]
pub trait Transport<M: Message>: Send + Sync {
    /// Open a mailbox for a node, replacing any previous one
    fn register(&self, node: &NodeId) -> Mailbox<M>;

    /// Close the mailbox of a node
    fn unregister(&self, node: &NodeId);

    /// Fire-and-forget delivery
    async fn send(&self, from: &NodeId, to: &NodeId, message: M) -> Result<()>;

    /// Deliver and wait for the response
    async fn request(&self, from: &NodeId, to: &NodeId, message: M, timeout: Duration) -> Result<M>;
}

/// Bus configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Envelopes buffered per mailbox
    pub mailbox_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
        }
    }
}

/// In-process bus shared by every node of a network
pub struct Bus<M> {
    config: BusConfig,
    mailboxes: DashMap<NodeId, mpsc::Sender<Envelope<M>>>,
    rules: Mutex<Vec<DropRule>>,
}

impl<M> std::fmt::Debug for Bus<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("mailboxes", &self.mailboxes.len())
            .field("rules", &self.rules.lock().len())
            .finish()
    }
}

impl<M: Message> Default for Bus<M> {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl<M: Message> Bus<M> {
    /// Create an empty bus
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            mailboxes: DashMap::new(),
            rules: Mutex::new(Vec::new()),
        }
    }

    /// Check whether a node has an open mailbox
    pub fn is_registered(&self, node: &NodeId) -> bool {
        self.mailboxes
            .get(node)
            .map_or(false, |tx| !tx.is_closed())
    }

    /// Install a drop rule
    pub fn add_rule(&self, rule: DropRule) {
        debug!(?rule, "Drop rule installed");
        self.rules.lock().push(rule);
    }

    /// Remove every drop rule
    pub fn clear_rules(&self) {
        self.rules.lock().clear();
    }

    /// Consume a matching rule, if any
    fn should_drop(&self, from: &NodeId, to: &NodeId, kind: &'static str) -> bool {
        let mut rules = self.rules.lock();
        let Some(rule) = rules.iter_mut().find(|rule| rule.matches(from, to, kind)) else {
            return false;
        };
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        rules.retain(|rule| rule.remaining != Some(0));

        MESSAGES_DROPPED.with_label_values(&[kind]).inc();
        warn!(from = %from, to = %to, kind, "Message dropped by rule");
        true
    }

    async fn deliver(&self, envelope: Envelope<M>) -> Result<()> {
        let kind = envelope.message.kind();
        let to = envelope.to.clone();

        let Some(tx) = self.mailboxes.get(&to).map(|entry| entry.value().clone()) else {
            MESSAGES_UNREACHABLE.with_label_values(&[kind]).inc();
            return Err(Error::Unreachable(to));
        };

        if tx.send(envelope).await.is_err() {
            MESSAGES_UNREACHABLE.with_label_values(&[kind]).inc();
            return Err(Error::Unreachable(to));
        }

        MESSAGES_SENT.with_label_values(&[kind]).inc();
        Ok(())
    }

    /// Send the same message to several nodes concurrently
    pub async fn broadcast(&self, from: &NodeId, targets: &[NodeId], message: M) -> Vec<(NodeId, Result<()>)>
    where
        M: Clone,
    {
        let sends = targets.iter().map(|to| {
            let message = message.clone();
            async move { (to.clone(), Transport::send(self, from, to, message).await) }
        });
        futures::future::join_all(sends).await
    }
}

#[async_trait]
impl<M: Message> Transport<M> for Bus<M> {
    fn register(&self, node: &NodeId) -> Mailbox<M> {
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        self.mailboxes.insert(node.clone(), tx);
        debug!(node = %node, "Mailbox registered");
        Mailbox::new(rx)
    }

    fn unregister(&self, node: &NodeId) {
        if self.mailboxes.remove(node).is_some() {
            debug!(node = %node, "Mailbox closed");
        }
    }

    async fn send(&self, from: &NodeId, to: &NodeId, message: M) -> Result<()> {
        // A lost one-way message looks like a successful send to the sender
        if self.should_drop(from, to, message.kind()) {
            return Ok(());
        }

        self.deliver(Envelope {
            from: from.clone(),
            to: to.clone(),
            message,
            responder: None,
        })
        .await
    }

    async fn request(&self, from: &NodeId, to: &NodeId, message: M, timeout: Duration) -> Result<M> {
        let kind = message.kind();
        let start = Instant::now();

        let result = async {
            if self.should_drop(from, to, kind) {
                return Err(Error::Dropped {
                    from: from.clone(),
                    to: to.clone(),
                    kind,
                });
            }

            let (tx, rx) = oneshot::channel();
            self.deliver(Envelope {
                from: from.clone(),
                to: to.clone(),
                message,
                responder: Some(Responder::new(tx)),
            })
            .await?;

            let response = match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(response)) => response,
                Ok(Err(_)) => return Err(Error::NoResponse(to.clone())),
                Err(_) => {
                    return Err(Error::Timeout {
                        to: to.clone(),
                        kind,
                    })
                }
            };

            let response_kind = response.kind();
            if self.should_drop(to, from, response_kind) {
                return Err(Error::Dropped {
                    from: to.clone(),
                    to: from.clone(),
                    kind: response_kind,
                });
            }
            Ok(response)
        }
        .await;

        let status = if result.is_ok() { "ok" } else { "error" };
        REQUEST_DURATION
            .with_label_values(&[kind, status])
            .observe(start.elapsed().as_secs_f64());

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    enum TestMessage {
        Ping(u32),
        Pong(u32),
        Note,
    }

    impl Message for TestMessage {
        fn kind(&self) -> &'static str {
            match self {
                TestMessage::Ping(_) => "Ping",
                TestMessage::Pong(_) => "Pong",
                TestMessage::Note => "Note",
            }
        }
    }

    fn spawn_echo(bus: &Arc<Bus<TestMessage>>, node: &str) {
        let mut mailbox = bus.register(&NodeId::new(node));
        tokio::spawn(async move {
            while let Some(envelope) = mailbox.recv().await {
                if let (TestMessage::Ping(n), Some(responder)) = (envelope.message, envelope.responder) {
                    responder.send(TestMessage::Pong(n));
                }
            }
        });
    }

    #[tokio::test]
    async fn test_request_response() {
        let bus = Arc::new(Bus::default());
        spawn_echo(&bus, "b");

        let response = bus
            .request(&"a".into(), &"b".into(), TestMessage::Ping(7), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response, TestMessage::Pong(7));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let bus: Bus<TestMessage> = Bus::default();
        let err = bus
            .send(&"a".into(), &"nobody".into(), TestMessage::Note)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_drop_rule_is_consumed() {
        let bus = Arc::new(Bus::default());
        spawn_echo(&bus, "b");
        bus.add_rule(DropRule::any().to("b").kind("Ping").times(1));

        let first = bus
            .request(&"a".into(), &"b".into(), TestMessage::Ping(1), Duration::from_secs(1))
            .await;
        assert!(matches!(first, Err(Error::Dropped { .. })));

        let second = bus
            .request(&"a".into(), &"b".into(), TestMessage::Ping(2), Duration::from_secs(1))
            .await;
        assert_eq!(second.unwrap(), TestMessage::Pong(2));
    }

    #[tokio::test]
    async fn test_response_can_be_dropped() {
        let bus = Arc::new(Bus::default());
        spawn_echo(&bus, "b");
        bus.add_rule(DropRule::any().from("b").kind("Pong"));

        let result = bus
            .request(&"a".into(), &"b".into(), TestMessage::Ping(1), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(Error::Dropped { kind: "Pong", .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout() {
        let bus: Arc<Bus<TestMessage>> = Arc::new(Bus::default());
        // Registered but never read
        let _mailbox = bus.register(&NodeId::new("b"));

        let result = bus
            .request(&"a".into(), &"b".into(), TestMessage::Ping(1), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_unregister_closes_delivery() {
        let bus: Arc<Bus<TestMessage>> = Arc::new(Bus::default());
        let _mailbox = bus.register(&NodeId::new("b"));
        assert!(bus.is_registered(&NodeId::new("b")));

        bus.unregister(&NodeId::new("b"));
        assert!(!bus.is_registered(&NodeId::new("b")));
        assert!(bus.send(&"a".into(), &"b".into(), TestMessage::Note).await.is_err());
    }

    #[tokio::test]
    async fn test_broadcast() {
        let bus: Arc<Bus<TestMessage>> = Arc::new(Bus::default());
        let mut b = bus.register(&NodeId::new("b"));
        let mut c = bus.register(&NodeId::new("c"));

        let results = bus
            .broadcast(&"a".into(), &["b".into(), "c".into(), "d".into()], TestMessage::Note)
            .await;
        assert_eq!(results.iter().filter(|(_, r)| r.is_ok()).count(), 2);
        assert_eq!(b.recv().await.unwrap().message, TestMessage::Note);
        assert_eq!(c.recv().await.unwrap().message, TestMessage::Note);
    }
}
