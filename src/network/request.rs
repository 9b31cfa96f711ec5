// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::network::{Connection, Message, Router};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandleStep {
    PreHandle,
    Handle,
    PostHandle,
    /// terminal
    Done,
}

impl HandleStep {
    fn next(self) -> HandleStep {
        match self {
            HandleStep::PreHandle => HandleStep::Handle,
            HandleStep::Handle => HandleStep::PostHandle,
            HandleStep::PostHandle | HandleStep::Done => HandleStep::Done,
        }
    }
}

/// What happens once the running stage returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// move on to the next stage
    Advance,
    /// stay where the stage left the pipeline, set by `abort` and `goto`
    Hold,
}

#[derive(Debug)]
struct StageState {
    step: HandleStep,
    pending: Transition,
}

impl StageState {
    fn apply_pending(&mut self) {
        self.step = match self.pending {
            Transition::Advance => self.step.next(),
            Transition::Hold => self.step,
        };
        self.pending = Transition::Advance;
    }
}

/// One decoded message together with the connection it arrived on.
///
/// The request carries its own pipeline state: which stage runs next, and how the
/// running stage asked the pipeline to continue.
pub struct Request {
    connection: Arc<Connection>,
    message: Message,
    router: Option<Arc<dyn Router>>,
    // never held across an await, stages call abort/goto while `call` is running
    stage: Mutex<StageState>,
}

impl Request {
    pub fn new(connection: Arc<Connection>, message: Message) -> Self {
        Request {
            connection,
            message,
            router: None,
            stage: Mutex::new(StageState {
                step: HandleStep::PreHandle,
                pending: Transition::Advance,
            }),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn data(&self) -> &Bytes {
        self.message.data()
    }

    pub fn msg_id(&self) -> u32 {
        self.message.id()
    }

    /// The stage currently running, or the one that runs next.
    pub fn current_step(&self) -> HandleStep {
        self.stage.lock().step
    }

    pub fn bind_router(&mut self, router: Arc<dyn Router>) {
        self.router = Some(router);
    }

    /// Runs the bound router stage by stage until the pipeline reaches `Done`.
    /// Without a router this does nothing.
    pub async fn call(&self) {
        let Some(router) = self.router.clone() else {
            return;
        };
        loop {
            let step = self.stage.lock().step;
            match step {
                HandleStep::PreHandle => router.pre_handle(self).await,
                HandleStep::Handle => router.handle(self).await,
                HandleStep::PostHandle => router.post_handle(self).await,
                HandleStep::Done => break,
            }
            self.stage.lock().apply_pending();
        }
    }

    /// Ends the pipeline. The running stage finishes its own code, nothing after it runs.
    pub fn abort(&self) {
        let mut stage = self.stage.lock();
        stage.step = HandleStep::Done;
        stage.pending = Transition::Hold;
    }

    /// Moves the pipeline to `step`, which runs once the current stage returns instead of
    /// the stage after it. `current_step` reports `step` right away.
    ///
    /// Jumping backwards on every pass never terminates; that is up to the router.
    pub fn goto(&self, step: HandleStep) {
        let mut stage = self.stage.lock();
        stage.step = step;
        stage.pending = Transition::Hold;
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("connection_id", &self.connection.id())
            .field("msg_id", &self.message.id())
            .field("len", &self.message.len())
            .field("routed", &self.router.is_some())
            .field("stage", &*self.stage.lock())
            .finish()
    }
}
