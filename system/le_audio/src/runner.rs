// Copyright 2024, The Android Open Source Project
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

//! Event loop of the state machine. All the inputs of the state machine
//! are serialized into a dedicated thread, together with its timers.

use crate::state_machine::{GroupStateMachine, TimerEvent};

use log::{error, info, warn};
use std::thread;
use thiserror::Error;
use tokio::runtime::Builder;
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

/// Work to run on the state machine thread
pub type BoxedStateMachineCallback = Box<dyn FnOnce(&mut GroupStateMachine) + Send + 'static>;

/// Errors of the runner
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunnerError {
    #[error("Not started yet")]
    #[allow(missing_docs)]
    NotStarted,
    #[error("Already started")]
    #[allow(missing_docs)]
    AlreadyStarted,
    #[error("Runner ended")]
    #[allow(missing_docs)]
    Ended,
    #[error("Cannot spawn the state machine thread: {0}")]
    #[allow(missing_docs)]
    Spawn(String),
}

#[derive(Default, Debug)]
enum RunnerState {
    /// Not started yet
    #[default]
    NotStarted,
    /// Event loop running, use [`LeAudioRunner::post`] to queue work
    Running { tx: mpsc::UnboundedSender<BoxedStateMachineCallback> },
    /// The event loop has ended, no further work can be queued
    Ended,
}

/// Owner of the state machine thread. The thread stops once the queued
/// work is processed, when the runner is stopped or dropped.
#[derive(Default)]
pub struct LeAudioRunner {
    state: RunnerState,
    thread: Option<thread::JoinHandle<()>>,
}

impl LeAudioRunner {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the event loop. `build` runs on the new thread, within the
    /// runtime, and gets the sender the timers of the state machine report
    /// on.
    pub fn start(
        &mut self,
        build: impl FnOnce(mpsc::UnboundedSender<TimerEvent>) -> GroupStateMachine + Send + 'static,
    ) -> Result<(), RunnerError> {
        match self.state {
            RunnerState::NotStarted => {}
            RunnerState::Running { .. } => return Err(RunnerError::AlreadyStarted),
            RunnerState::Ended => return Err(RunnerError::Ended),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let thread = thread::Builder::new()
            .name("le_audio".to_string())
            .spawn(move || run(build, rx))
            .map_err(|e| RunnerError::Spawn(e.to_string()))?;
        self.thread = Some(thread);
        self.state = RunnerState::Running { tx };
        Ok(())
    }

    /// Queue work for the state machine thread
    pub fn post(
        &self,
        f: impl FnOnce(&mut GroupStateMachine) + Send + 'static,
    ) -> Result<(), RunnerError> {
        match &self.state {
            RunnerState::NotStarted => Err(RunnerError::NotStarted),
            RunnerState::Ended => Err(RunnerError::Ended),
            RunnerState::Running { tx } => tx.send(Box::new(f)).map_err(|_| RunnerError::Ended),
        }
    }

    /// Stop the event loop once the queued work is done, and wait for it
    pub fn stop(&mut self) {
        if matches!(self.state, RunnerState::NotStarted) {
            return;
        }
        self.state = RunnerState::Ended;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("State machine thread panicked");
            }
        }
    }
}

impl Drop for LeAudioRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    build: impl FnOnce(mpsc::UnboundedSender<TimerEvent>) -> GroupStateMachine,
    mut rx: mpsc::UnboundedReceiver<BoxedStateMachineCallback>,
) {
    crate::utils::init_logging();

    let rt = match Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start the tokio runtime: {}", e);
            return;
        }
    };
    let local = LocalSet::new();

    local.block_on(&rt, async move {
        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let mut state_machine = build(timer_tx);

        info!("starting event loop");
        loop {
            select! {
                f = rx.recv() => match f {
                    Some(f) => f(&mut state_machine),
                    None => break,
                },
                Some(event) = timer_rx.recv() => state_machine.on_timer_event(event),
            }
        }
        info!("event loop stopped");
    });
}
