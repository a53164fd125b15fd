//! Access to the local Open vSwitch / OVN command line tools.
//!
//! Everything the agent does to the bridge goes through one [`Device`]. The
//! device hands out a [`Session`] that holds the executor lock, so a bootstrap
//! run or a convergence pass is never interleaved with another one.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{Mutex, MutexGuard};

use crate::cookie::FlowCookie;
use crate::error::Result;
use crate::flow::Flow;

pub mod exec;
#[cfg(test)]
pub mod fake;

pub use exec::ExecRunner;

/// The command line tools the agent drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Vsctl,
    Ofctl,
    Nbctl,
    Ip,
}

impl Tool {
    pub fn program(self) -> &'static str {
        match self {
            Tool::Vsctl => "ovs-vsctl",
            Tool::Ofctl => "ovs-ofctl",
            Tool::Nbctl => "ovn-nbctl",
            Tool::Ip => "ip",
        }
    }

    /// Whether the tool takes a database `--timeout=<secs>` option.
    pub fn takes_timeout(self) -> bool {
        matches!(self, Tool::Vsctl | Tool::Nbctl)
    }
}

/// Renders a command the way it would be typed in a shell.
pub fn render(tool: Tool, args: &[&str]) -> String {
    let mut line = tool.program().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `tool` with `args` and returns its standard output.
    async fn run(&self, tool: Tool, args: &[&str]) -> Result<String>;
}

/// Shared handle to the command executor.
#[derive(Clone)]
pub struct Device {
    runner: Arc<Mutex<Box<dyn CommandRunner>>>,
}

impl Device {
    pub fn new<R: CommandRunner + 'static>(runner: R) -> Self {
        Self {
            runner: Arc::new(Mutex::new(Box::new(runner))),
        }
    }

    /// Waits for exclusive use of the executor.
    pub async fn session(&self) -> Session<'_> {
        Session {
            runner: self.runner.lock().await,
        }
    }
}

/// Exclusive access to the executor for the lifetime of the value.
pub struct Session<'a> {
    runner: MutexGuard<'a, Box<dyn CommandRunner>>,
}

impl Session<'_> {
    async fn run(&self, tool: Tool, args: &[&str]) -> Result<String> {
        debug!("Running: {}", render(tool, args));
        self.runner.run(tool, args).await
    }

    pub async fn vsctl(&self, args: &[&str]) -> Result<String> {
        self.run(Tool::Vsctl, args).await
    }

    pub async fn ofctl(&self, args: &[&str]) -> Result<String> {
        self.run(Tool::Ofctl, args).await
    }

    pub async fn nbctl(&self, args: &[&str]) -> Result<String> {
        self.run(Tool::Nbctl, args).await
    }

    pub async fn ip(&self, args: &[&str]) -> Result<String> {
        self.run(Tool::Ip, args).await
    }

    pub async fn dump_flows(&self, bridge: &str, table: u8) -> Result<String> {
        let table = format!("table={}", table);
        self.ofctl(&["dump-flows", bridge, &table]).await
    }

    /// Adds `flow`, replacing any rule with the same table, priority and match.
    pub async fn add_flow(&self, bridge: &str, flow: &Flow) -> Result<()> {
        let flow = flow.to_string();
        self.ofctl(&["add-flow", bridge, &flow]).await.map(drop)
    }

    /// Deletes every rule in `table` tagged with exactly `cookie`.
    pub async fn del_flows(&self, bridge: &str, table: u8, cookie: FlowCookie) -> Result<()> {
        let filter = format!("table={},cookie={}/0x{:08x}", table, cookie, FlowCookie::MASK);
        self.ofctl(&["del-flows", bridge, &filter]).await.map(drop)
    }
}
