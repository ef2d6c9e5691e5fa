use super::{EventBroker, EventReceiver};
use crate::error::{HarnessError, HarnessResult};
use crate::value::PropertySet;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct TopicState {
    subscribers: Vec<Sender<PropertySet>>,
    /// Events published while nobody was subscribed
    retained: Vec<PropertySet>,
}

/// In-process broker with fan-out topic semantics
///
/// Every subscriber of a topic receives its own copy of each event. Events published
/// to a topic without live subscribers are retained and handed to the next subscriber,
/// so a trigger published before the pipeline subscribes is not lost.
pub struct InMemoryBroker {
    host: String,
    topics: Mutex<HashMap<String, TopicState>>,
}

impl InMemoryBroker {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Number of events retained for a topic without subscribers
    pub fn retained(&self, topic: &str) -> HarnessResult<usize> {
        let topics = self.topics.lock()?;
        Ok(topics.get(topic).map(|t| t.retained.len()).unwrap_or(0))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new("localhost")
    }
}

impl EventBroker for InMemoryBroker {
    fn host(&self) -> &str {
        &self.host
    }

    fn publish(&self, topic: &str, payload: PropertySet) -> HarnessResult<()> {
        let mut topics = self.topics.lock()?;
        let state = topics.entry(topic.to_string()).or_default();

        state
            .subscribers
            .retain(|subscriber| subscriber.send(payload.clone()).is_ok());

        if state.subscribers.is_empty() {
            tracing::trace!("Retaining event on '{}' until a subscriber appears", topic);
            state.retained.push(payload);
        }

        Ok(())
    }

    fn subscribe(&self, topic: &str) -> HarnessResult<Box<dyn EventReceiver>> {
        let (sender, receiver) = unbounded();
        let mut topics = self.topics.lock()?;
        let state = topics.entry(topic.to_string()).or_default();

        for payload in state.retained.drain(..) {
            sender
                .send(payload)
                .map_err(|e| HarnessError::Event(format!("Failed to hand over event: {}", e)))?;
        }
        state.subscribers.push(sender);

        Ok(Box::new(ChannelReceiver {
            topic: topic.to_string(),
            receiver,
        }))
    }
}

struct ChannelReceiver {
    topic: String,
    receiver: Receiver<PropertySet>,
}

impl EventReceiver for ChannelReceiver {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn receive(&self, timeout: Duration) -> HarnessResult<Option<PropertySet>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(payload) => Ok(Some(payload)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(HarnessError::Event(format!(
                "Broker closed topic '{}'",
                self.topic
            ))),
        }
    }

    fn try_receive(&self) -> HarnessResult<Option<PropertySet>> {
        match self.receiver.try_recv() {
            Ok(payload) => Ok(Some(payload)),
            Err(crossbeam_channel::TryRecvError::Empty) => Ok(None),
            Err(crossbeam_channel::TryRecvError::Disconnected) => Err(HarnessError::Event(
                format!("Broker closed topic '{}'", self.topic),
            )),
        }
    }
}
