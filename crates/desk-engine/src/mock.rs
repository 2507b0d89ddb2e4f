use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use desk_core::{
    AgentId, OutputItem, Responder, ResponderError, ResponderOutput, ResponderRequest,
    SharedContext,
};

/// Pre-programmed replies for deterministic tests.
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Return these items; `next_agent` is derived from the last handoff.
    Items { items: Vec<OutputItem>, resolved: bool },
    /// Return this exact output, consistent or not.
    Raw(ResponderOutput),
    Error(ResponderError),
    /// Wait, then resolve the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn message(agent: AgentId, content: &str) -> Self {
        Self::Items {
            items: vec![OutputItem::Message { agent, content: content.to_string() }],
            resolved: false,
        }
    }

    pub fn handoff(from: AgentId, to: AgentId, greeting: &str) -> Self {
        Self::Items {
            items: vec![
                OutputItem::Handoff { from, to },
                OutputItem::Message { agent: to, content: greeting.to_string() },
            ],
            resolved: false,
        }
    }

    pub fn resolving(agent: AgentId, content: &str) -> Self {
        Self::Items {
            items: vec![OutputItem::Message { agent, content: content.to_string() }],
            resolved: true,
        }
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Responder that replays `MockReply`s in order and records every request.
pub struct MockResponder {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<ResponderRequest>>,
    call_count: AtomicUsize,
}

impl MockResponder {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ResponderRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Responder for MockResponder {
    fn name(&self) -> &str {
        "mock"
    }

    async fn respond(&self, request: ResponderRequest) -> Result<ResponderOutput, ResponderError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().pop_front();
        let active = request.active_agent;
        let context = request.context.clone();
        self.requests.lock().push(request);

        let mut current = reply.ok_or_else(|| {
            ResponderError::Internal(format!("MockResponder: no reply configured for call {idx}"))
        })?;

        loop {
            match current {
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
                MockReply::Error(e) => return Err(e),
                MockReply::Raw(output) => return Ok(output),
                MockReply::Items { items, resolved } => {
                    return Ok(finish(items, active, context, resolved));
                }
            }
        }
    }
}

fn finish(
    items: Vec<OutputItem>,
    active: AgentId,
    context: SharedContext,
    resolved: bool,
) -> ResponderOutput {
    let next_agent = items
        .iter()
        .rev()
        .find_map(|item| match item {
            OutputItem::Handoff { to, .. } => Some(*to),
            _ => None,
        })
        .unwrap_or(active);
    ResponderOutput { items, next_agent, context, resolved }
}
