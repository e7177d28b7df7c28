//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use radadapter::communication::Result;
use radadapter::*;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Channel that records every command and answers from a scripted queue.
/// An empty queue answers with a connection loss.
#[derive(Default)]
pub struct MockChannel {
    replies: Mutex<VecDeque<Response>>,
    sent: Mutex<Vec<Command>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: Response) {
        self.replies.lock().unwrap().push_back(response);
    }

    pub fn sent(&self) -> Vec<Command> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn connection_options(&self) -> ServerConnectionOptions {
        ServerConnectionOptions::new("mock", 9339)
    }

    fn connection_state(&self) -> ClientState {
        ClientState::Connected
    }

    async fn send_with_reply(&self, command: Command, _cancel: &CancellationToken) -> Result<Response> {
        self.sent.lock().unwrap().push(command);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ChannelError::ConnectionLost {
                endpoint: "mock:9339".into(),
                message: "no scripted reply".into(),
            })
    }

    fn force_disconnect(&self) {}
}

pub fn metadata(status: FetchStatus, timestamp: i64, byte_count: u32) -> Response {
    Response::MetadataFetched(MetadataFetched {
        status,
        timestamp: Timestamp(timestamp),
        byte_count,
    })
}

pub fn range(status: FetchStatus, timestamp: i64, data: Vec<u8>) -> Response {
    Response::ResultRangeFetched(ResultRangeFetched {
        status,
        timestamp: Timestamp(timestamp),
        data,
    })
}

pub fn executed(exit_code: i32) -> Response {
    Response::ExecutionCompleted(ExecutionCompleted {
        status: ExecutionStatus::Completed,
        exit_code,
        stdout: String::new(),
        stderr: String::new(),
    })
}

/// Little-endian dwords counting up from `start`
pub fn dword_bytes(start: u32, count: usize) -> Vec<u8> {
    (start..start + count as u32).flat_map(|v| v.to_le_bytes()).collect()
}
