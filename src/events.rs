//! Projection of backend happenings onto DAP messages, plus the buffered
//! sender the session writes through.
//!
//! Handlers never touch the transport directly: they queue messages on
//! [`DapSender`] and the server loop flushes the queue after each
//! dispatch, so a response and the events it implies leave in order.

use crate::api::DebuggerState;
use crate::dap::{DapMessage, Event, ProtocolMessage, Request, Response};
use crate::dap_types;
use crate::rpc::RpcError;
use serde_json::{json, Value};

/// Everything that can wake the session loop: a client message or an
/// asynchronous completion from the backend side.
#[derive(Debug)]
pub enum SessionEvent {
    Client(DapMessage),
    /// A long-running `continue` returned. `epoch` is the counter value
    /// captured when the command was issued.
    ContinueDone {
        epoch: u64,
        result: Result<DebuggerState, RpcError>,
    },
    Output {
        category: &'static str,
        chunk: String,
    },
    BackendExited {
        code: Option<i32>,
    },
    /// The client connection reached end of input.
    ClientClosed,
}

#[derive(Debug, Default)]
pub struct DapSender {
    pub seq: i64,
    queued: Vec<DapMessage>,
}

impl DapSender {
    pub fn with_seq(seq: i64) -> DapSender {
        DapSender { seq, queued: vec![] }
    }

    pub fn take_messages(&mut self) -> Vec<DapMessage> {
        std::mem::take(&mut self.queued)
    }

    fn next_seq(&mut self) -> i64 {
        let current = self.seq;
        self.seq += 1;
        current
    }

    pub fn respond(&mut self, request: &Request, body: Value) {
        let message = DapMessage::Response(Response {
            base: ProtocolMessage {
                seq: self.next_seq(),
                type_: "response".to_string(),
            },
            request_seq: request.base.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body,
        });
        self.queued.push(message);
    }

    pub fn respond_error(&mut self, request: &Request, code: i64, text: &str) {
        let body = dap_types::ErrorResponseBody {
            error: Some(dap_types::Message {
                id: code,
                format: text.to_string(),
                show_user: Some(true),
            }),
        };
        let message = DapMessage::Response(Response {
            base: ProtocolMessage {
                seq: self.next_seq(),
                type_: "response".to_string(),
            },
            request_seq: request.base.seq,
            success: false,
            command: request.command.clone(),
            message: Some(text.to_string()),
            body: json!(body),
        });
        self.queued.push(message);
    }

    fn event(&mut self, name: &str, body: Value) {
        let message = DapMessage::Event(Event {
            base: ProtocolMessage {
                seq: self.next_seq(),
                type_: "event".to_string(),
            },
            event: name.to_string(),
            body,
        });
        self.queued.push(message);
    }

    pub fn event_initialized(&mut self) {
        self.event("initialized", json!({}));
    }

    /// The backend stops the world, so `allThreadsStopped` is always true.
    pub fn event_stopped(&mut self, reason: &str, goroutine_id: i64) {
        let body = dap_types::StoppedEventBody {
            reason: reason.to_string(),
            thread_id: Some(goroutine_id),
            all_threads_stopped: Some(true),
            description: None,
            text: None,
        };
        self.event("stopped", json!(body));
    }

    pub fn event_terminated(&mut self) {
        self.event("terminated", json!(dap_types::TerminatedEventBody::default()));
    }

    pub fn event_output(&mut self, category: &str, output: &str) {
        let body = dap_types::OutputEventBody {
            category: Some(category.to_string()),
            output: output.to_string(),
            source: None,
            line: None,
        };
        self.event("output", json!(body));
    }
}
