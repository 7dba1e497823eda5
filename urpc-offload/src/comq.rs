//! The three command queues of a context: request, in-flight, completion.
//!
//! Requests are pushed by any caller thread and popped by the progress
//! pump. The in-flight queue matches submitted remote commands against
//! incoming replies purely by FIFO order, which the SPSC transport
//! guarantees. Completions are keyed by request id; waiters poll them
//! while driving the pump themselves.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::command::{Command, CommandStatus, RequestId};

pub(crate) struct ComQ {
    request: Mutex<VecDeque<Command>>,
    in_flight: Mutex<VecDeque<Command>>,
    completion: Mutex<HashMap<RequestId, Command>>,
}

impl ComQ {
    pub(crate) fn new() -> Self {
        ComQ {
            request: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(VecDeque::new()),
            completion: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn push_request(&self, cmd: Command) {
        self.request.lock().push_back(cmd);
    }

    /// Pop the next submittable request. A host-only command at the head is
    /// left in place while remote work is still in flight, so it keeps its
    /// position as a fence.
    pub(crate) fn pop_submittable(&self) -> Option<Command> {
        let mut request = self.request.lock();
        let head = request.front()?;
        if head.is_host() && !self.in_flight.lock().is_empty() {
            return None;
        }
        request.pop_front()
    }

    pub(crate) fn request_is_empty(&self) -> bool {
        self.request.lock().is_empty()
    }

    pub(crate) fn push_in_flight(&self, cmd: Command) {
        self.in_flight.lock().push_back(cmd);
    }

    pub(crate) fn pop_in_flight(&self) -> Option<Command> {
        self.in_flight.lock().pop_front()
    }

    pub(crate) fn in_flight_is_empty(&self) -> bool {
        self.in_flight.lock().is_empty()
    }

    pub(crate) fn push_completion(&self, cmd: Command) {
        self.completion.lock().insert(cmd.id, cmd);
    }

    pub(crate) fn take_completion(&self, id: RequestId) -> Option<Command> {
        self.completion.lock().remove(&id)
    }

    /// Drain the request and in-flight queues, completing every pending
    /// command with status `Error` so its waiters unblock. Returns how many
    /// commands were cancelled.
    pub(crate) fn cancel_all(&self) -> usize {
        let mut cancelled: Vec<Command> = Vec::new();
        cancelled.extend(self.request.lock().drain(..));
        cancelled.extend(self.in_flight.lock().drain(..));

        let count = cancelled.len();
        let mut completion = self.completion.lock();
        for mut cmd in cancelled {
            if cmd.status == CommandStatus::Unfinished {
                cmd.set_result(0, CommandStatus::Error);
            }
            completion.insert(cmd.id, cmd);
        }
        count
    }
}
