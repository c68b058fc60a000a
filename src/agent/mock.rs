//! Scripted guest agent for unit tests

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use super::{AgentError, GuestAgentClient};

type Reply = Result<Value, AgentError>;

/// Agent replaying queued replies; the last reply of each queue repeats forever
pub(crate) struct MockAgent {
    status: Mutex<VecDeque<Reply>>,
    submit: Mutex<VecDeque<Reply>>,
    polls: Mutex<VecDeque<Reply>>,
    submitted: Mutex<Vec<String>>,
    status_calls: AtomicU32,
    poll_calls: AtomicU32,
}

fn next(queue: &Mutex<VecDeque<Reply>>) -> Reply {
    let mut queue = queue.lock().unwrap();
    if queue.len() > 1 {
        queue.pop_front().unwrap()
    } else {
        queue
            .front()
            .cloned()
            .unwrap_or_else(|| Err(AgentError::Other("no scripted reply".to_string())))
    }
}

impl MockAgent {
    /// Running VM whose command finishes on the first poll with exit code 0
    pub(crate) fn running() -> Self {
        Self {
            status: Mutex::new(VecDeque::from([Ok(json!({"status": "running"}))])),
            submit: Mutex::new(VecDeque::from([Ok(json!({"pid": 4242}))])),
            polls: Mutex::new(VecDeque::from([Ok(json!({
                "exited": 1,
                "exitcode": 0,
                "out-data": "ok\n"
            }))])),
            submitted: Mutex::new(Vec::new()),
            status_calls: AtomicU32::new(0),
            poll_calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn with_status(self, replies: Vec<Reply>) -> Self {
        *self.status.lock().unwrap() = replies.into();
        self
    }

    pub(crate) fn with_submit(self, replies: Vec<Reply>) -> Self {
        *self.submit.lock().unwrap() = replies.into();
        self
    }

    pub(crate) fn with_polls(self, replies: Vec<Reply>) -> Self {
        *self.polls.lock().unwrap() = replies.into();
        self
    }

    /// Commands received by `submit_command`, in order
    pub(crate) fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub(crate) fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn poll_calls(&self) -> u32 {
        self.poll_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GuestAgentClient for MockAgent {
    async fn vm_status(&self, _node: &str, _vmid: &str) -> Result<Value, AgentError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        next(&self.status)
    }

    async fn submit_command(&self, _node: &str, _vmid: &str, command: &str) -> Result<Value, AgentError> {
        self.submitted.lock().unwrap().push(command.to_string());
        next(&self.submit)
    }

    async fn exec_status(&self, _node: &str, _vmid: &str, _pid: u64) -> Result<Value, AgentError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        next(&self.polls)
    }
}
