//! Scripted executor for tests.
//!
//! Commands must arrive in the scripted order; anything else fails the
//! command and is recorded so the test can report it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{render, CommandRunner, Tool};
use crate::error::{Error, Result};

struct Expected {
    command: String,
    output: std::result::Result<String, String>,
}

#[derive(Default)]
struct State {
    expected: VecDeque<Expected>,
    called: Vec<String>,
    unexpected: Vec<String>,
}

#[derive(Clone, Default)]
pub struct FakeExec {
    state: Arc<Mutex<State>>,
}

impl FakeExec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expects `command` and answers with `output`.
    pub fn expect(&self, command: impl Into<String>, output: impl Into<String>) -> &Self {
        self.push(command.into(), Ok(output.into()))
    }

    /// Expects each command in order, answering with empty output.
    pub fn expect_ok<S: AsRef<str>>(&self, commands: &[S]) -> &Self {
        for command in commands {
            self.push(command.as_ref().to_string(), Ok(String::new()));
        }
        self
    }

    /// Expects `command` and fails it with `stderr`.
    pub fn expect_err(&self, command: impl Into<String>, stderr: impl Into<String>) -> &Self {
        self.push(command.into(), Err(stderr.into()))
    }

    fn push(&self, command: String, output: std::result::Result<String, String>) -> &Self {
        self.state
            .lock()
            .unwrap()
            .expected
            .push_back(Expected { command, output });
        self
    }

    pub fn called(&self) -> Vec<String> {
        self.state.lock().unwrap().called.clone()
    }

    /// Number of device-mutating commands issued so far.
    pub fn mutations(&self) -> usize {
        self.called()
            .iter()
            .filter(|c| c.contains(" add-flow ") || c.contains(" del-flows "))
            .count()
    }

    /// Panics unless every scripted command ran and nothing else did.
    pub fn assert_done(&self) {
        let state = self.state.lock().unwrap();
        assert!(
            state.unexpected.is_empty(),
            "unexpected commands: {:#?}",
            state.unexpected
        );
        let pending: Vec<_> = state.expected.iter().map(|e| &e.command).collect();
        assert!(pending.is_empty(), "commands never run: {:#?}", pending);
    }
}

#[async_trait]
impl CommandRunner for FakeExec {
    async fn run(&self, tool: Tool, args: &[&str]) -> Result<String> {
        let command = render(tool, args);
        let mut state = self.state.lock().unwrap();
        state.called.push(command.clone());

        let matches = state
            .expected
            .front()
            .map(|e| e.command == command)
            .unwrap_or(false);
        if !matches {
            state.unexpected.push(command.clone());
            return Err(Error::Command {
                command,
                stderr: "unexpected command".into(),
            });
        }

        match state.expected.pop_front().map(|e| e.output) {
            Some(Ok(stdout)) => Ok(stdout),
            Some(Err(stderr)) => Err(Error::Command { command, stderr }),
            None => unreachable!("front was checked above"),
        }
    }
}
