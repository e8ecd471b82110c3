#![allow(dead_code)]

pub mod broker;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::{ready, Future},
    io,
    sync::Mutex,
};

use mqtt_commands::*;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Payload,
}

/// In-memory bus that records publishes and lets tests deliver messages to handlers.
#[derive(Default)]
pub struct RecordingBus {
    published: Mutex<Vec<Published>>,
    handlers: Mutex<HashMap<String, MessageHandler>>,
    failing_topics: HashSet<String>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_subscriptions(topics: &[&str]) -> Self {
        Self {
            failing_topics: topics.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .collect()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.lock().unwrap().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Invoke the handler for `topic` on the calling thread. Returns false if none exists.
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        let handler = self.handlers.lock().unwrap().get(topic).cloned();
        match handler {
            Some(handler) => {
                handler(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
                true
            }
            None => false,
        }
    }
}

impl MessageBus for RecordingBus {
    fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Payload,
    ) -> impl Future<Output = Result<(), PublishError>> + Send {
        self.published.lock().unwrap().push(Published {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        });
        ready(Ok(()))
    }

    fn subscribe(
        &self,
        topic: &str,
        _qos: QoS,
        handler: MessageHandler,
    ) -> impl Future<Output = Result<(), SubscribeError>> + Send {
        let result = if self.failing_topics.contains(topic) {
            Err(SubscribeError::NotConnected)
        } else {
            self.handlers
                .lock()
                .unwrap()
                .insert(topic.to_string(), handler);
            Ok(())
        };
        ready(result)
    }
}

/// Runner that answers from a script instead of spawning processes.
pub struct ScriptedRunner {
    results: Mutex<VecDeque<bool>>,
    output: Option<String>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    /// `run` pops one result per call; an exhausted script fails.
    pub fn new(results: impl IntoIterator<Item = bool>) -> Self {
        Self {
            results: Mutex::new(results.into_iter().collect()),
            output: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call fails.
    pub fn failing() -> Self {
        Self::new(Vec::<bool>::new())
    }

    /// `output` returns this text, or fails if `None`.
    pub fn with_output(mut self, output: Option<&str>) -> Self {
        self.output = output.map(str::to_string);
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }

    fn failure(invocation: &Invocation) -> RunError {
        RunError::Spawn {
            program: invocation.program.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "scripted failure"),
        }
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, invocation: &Invocation) -> Result<(), RunError> {
        self.calls.lock().unwrap().push(invocation.clone());
        match self.results.lock().unwrap().pop_front() {
            Some(true) => Ok(()),
            _ => Err(Self::failure(invocation)),
        }
    }

    fn output(&self, invocation: &Invocation) -> Result<String, RunError> {
        self.calls.lock().unwrap().push(invocation.clone());
        self.output.clone().ok_or_else(|| Self::failure(invocation))
    }
}
