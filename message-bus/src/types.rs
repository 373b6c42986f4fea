//! Type definitions for message bus

use line_ledger::NodeId;
use tokio::sync::{mpsc, oneshot};

/// Payload carried by the bus
pub trait Message: Send + Sync + 'static {
    /// Kind used for metrics, logging and drop rules
    fn kind(&self) -> &'static str;
}

/// Message in a mailbox
#[derive(Debug)]
pub struct Envelope<M> {
    /// Sender
    pub from: NodeId,

    /// Receiver
    pub to: NodeId,

    /// Payload
    pub message: M,

    /// Reply channel, present for requests
    pub responder: Option<Responder<M>>,
}

/// One-shot reply channel of a request
#[derive(Debug)]
pub struct Responder<M> {
    tx: oneshot::Sender<M>,
}

impl<M> Responder<M> {
    pub(crate) fn new(tx: oneshot::Sender<M>) -> Self {
        Self { tx }
    }

    /// Send the response; false when the requester already gave up
    pub fn send(self, response: M) -> bool {
        self.tx.send(response).is_ok()
    }
}

/// Receiving side of a node's mailbox
#[derive(Debug)]
pub struct Mailbox<M> {
    rx: mpsc::Receiver<Envelope<M>>,
}

impl<M> Mailbox<M> {
    pub(crate) fn new(rx: mpsc::Receiver<Envelope<M>>) -> Self {
        Self { rx }
    }

    /// Next envelope; `None` once the node was unregistered
    pub async fn recv(&mut self) -> Option<Envelope<M>> {
        self.rx.recv().await
    }

    /// Stop accepting new envelopes
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Rule removing matching messages from the bus
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropRule {
    /// Sender to match, any when unset
    pub from: Option<NodeId>,

    /// Receiver to match, any when unset
    pub to: Option<NodeId>,

    /// Kind to match, any when unset
    pub kind: Option<&'static str>,

    /// Messages left to drop, unlimited when unset
    pub remaining: Option<u32>,
}

impl DropRule {
    /// Rule matching every message
    pub fn any() -> Self {
        Self::default()
    }

    /// Restrict to one sender
    pub fn from(mut self, node: impl Into<NodeId>) -> Self {
        self.from = Some(node.into());
        self
    }

    /// Restrict to one receiver
    pub fn to(mut self, node: impl Into<NodeId>) -> Self {
        self.to = Some(node.into());
        self
    }

    /// Restrict to one kind
    pub fn kind(mut self, kind: &'static str) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Drop at most `count` messages
    pub fn times(mut self, count: u32) -> Self {
        self.remaining = Some(count);
        self
    }

    pub(crate) fn matches(&self, from: &NodeId, to: &NodeId, kind: &str) -> bool {
        self.from.as_ref().map_or(true, |f| f == from)
            && self.to.as_ref().map_or(true, |t| t == to)
            && self.kind.map_or(true, |k| k == kind)
            && self.remaining != Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_matching() {
        let a = NodeId::new("a");
        let b = NodeId::new("b");

        let rule = DropRule::any().from("a").kind("Vote");
        assert!(rule.matches(&a, &b, "Vote"));
        assert!(!rule.matches(&b, &a, "Vote"));
        assert!(!rule.matches(&a, &b, "AskReserve"));

        let exhausted = DropRule::any().times(0);
        assert!(!exhausted.matches(&a, &b, "Vote"));
    }
}
