//! Host kernel backend driving `nft` and `ip`
//!
//! Filter rules go through `nft --json -f -`, one small batch per primitive so
//! a failure is attributed to exactly one op. Ordering inside a chain is kept
//! by listing the chain and inserting ahead of the first managed rule with a
//! greater key.

use super::{KernelBackend, KernelOp, KernelSnapshot, iproute, nft};
use crate::core::error::{Error, KernelErrorPattern, Result};
use crate::core::firewall::Family;
use crate::elevation::{Tool, create_elevated_command};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Captured result of one tool invocation
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs kernel tools. Swapped out in tests.
pub trait CommandRunner: Send + Sync {
    fn run(&self, tool: Tool, args: &[String], stdin: Option<&str>) -> Result<CommandOutput>;
}

/// Runs tools through [`create_elevated_command`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ElevatedRunner;

impl CommandRunner for ElevatedRunner {
    fn run(&self, tool: Tool, args: &[String], stdin: Option<&str>) -> Result<CommandOutput> {
        let mut cmd =
            create_elevated_command(tool, args).map_err(|e| Error::Elevation(e.to_string()))?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|e| {
            let message = format!("failed to spawn {tool}: {e}");
            match tool {
                Tool::Nft => Error::from_nft_stderr(&message, None),
                Tool::Ip => Error::from_ip_stderr(&message, None),
            }
        })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }

        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub struct SystemKernel {
    table: String,
    protocol: u32,
    proc_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl SystemKernel {
    pub fn new(table: impl Into<String>, protocol: u32, proc_root: impl Into<PathBuf>) -> Self {
        Self::with_runner(table, protocol, proc_root, Arc::new(ElevatedRunner))
    }

    pub fn with_runner(
        table: impl Into<String>,
        protocol: u32,
        proc_root: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            table: table.into(),
            protocol,
            proc_root: proc_root.into(),
            runner,
        }
    }

    fn nft_batch(&self, batch: &Value) -> Result<()> {
        let input = serde_json::to_string(batch)?;
        let args = vec!["--json".to_string(), "-f".to_string(), "-".to_string()];
        let out = self.runner.run(Tool::Nft, &args, Some(&input))?;
        if out.success {
            Ok(())
        } else {
            Err(Error::from_nft_stderr(&out.stderr, out.exit_code))
        }
    }

    /// Lists a chain or the whole table; `None` when the table does not exist.
    fn nft_list(&self, chain: Option<&str>) -> Result<Option<Value>> {
        let table = self.table.as_str();
        let args: Vec<String> = match chain {
            Some(chain) => vec!["--json", "-a", "list", "chain", "inet", table, chain],
            None => vec!["--json", "-a", "list", "table", "inet", table],
        }
        .into_iter()
        .map(String::from)
        .collect();
        let out = self.runner.run(Tool::Nft, &args, None)?;
        if !out.success {
            if KernelErrorPattern::is_absent(&out.stderr) {
                return Ok(None);
            }
            return Err(Error::from_nft_stderr(&out.stderr, out.exit_code));
        }
        Ok(Some(serde_json::from_str(&out.stdout)?))
    }

    /// Runs `ip` with `args`; with `tolerate_absent`, a "not there" failure is success.
    fn ip(&self, args: &[String], tolerate_absent: bool) -> Result<String> {
        let out = self.runner.run(Tool::Ip, args, None)?;
        if out.success || (tolerate_absent && KernelErrorPattern::is_absent(&out.stderr)) {
            return Ok(out.stdout);
        }
        Err(Error::from_ip_stderr(&out.stderr, out.exit_code))
    }

    fn ip_json(&self, args: &[String]) -> Result<Value> {
        let stdout = self.ip(args, false)?;
        if stdout.trim().is_empty() {
            return Ok(Value::Array(Vec::new()));
        }
        Ok(serde_json::from_str(&stdout)?)
    }

    fn write_proc(&self, relative: &str, value: &str) -> Result<()> {
        let path = self.proc_root.join(relative);
        std::fs::write(&path, value).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::PermissionDenied(format!("cannot write {}", path.display()))
            } else {
                Error::Io(e)
            }
        })
    }
}

impl KernelBackend for SystemKernel {
    fn prepare(&self) -> Result<()> {
        debug!("Ensuring nftables table inet {}", self.table);
        self.nft_batch(&nft::table_setup(&self.table))
    }

    fn execute(&self, op: &KernelOp) -> Result<()> {
        debug!("Kernel op: {}", op.describe());
        match op {
            KernelOp::AddFilter(entry) => {
                let chain = entry.rule.chain.nft_chain();
                let before = match &entry.key {
                    Some(key) => {
                        let listed = self
                            .nft_list(Some(chain))?
                            .map(|l| nft::parse_listing(&l))
                            .unwrap_or_default();
                        super::insertion_index(listed.iter().map(nft::ListedRule::key), key)
                            .and_then(|pos| listed[pos].handle)
                    }
                    None => None,
                };
                self.nft_batch(&nft::add_rule(&self.table, entry, before))
            }
            KernelOp::DeleteFilter(entry) => {
                let chain = entry.rule.chain.nft_chain();
                let Some(listing) = self.nft_list(Some(chain))? else {
                    return Ok(());
                };
                let handle = nft::parse_listing(&listing)
                    .into_iter()
                    .find(|r| r.entry.as_ref().ok() == Some(entry))
                    .and_then(|r| r.handle);
                match handle {
                    Some(handle) => self.nft_batch(&nft::delete_rule(&self.table, chain, handle)),
                    None => {
                        debug!("Filter already absent: {}", entry.describe());
                        Ok(())
                    }
                }
            }
            KernelOp::AddPolicy(entry) => self
                .ip(&iproute::policy_args("add", entry, self.protocol), false)
                .map(drop),
            KernelOp::DeletePolicy(entry) => self
                .ip(&iproute::policy_args("del", entry, self.protocol), true)
                .map(drop),
            KernelOp::AddRoute(entry) => self
                .ip(&iproute::route_args("add", entry, self.protocol), false)
                .map(drop),
            KernelOp::DeleteRoute(entry) => self
                .ip(&iproute::route_args("del", entry, self.protocol), true)
                .map(drop),
        }
    }

    fn snapshot(&self) -> Result<KernelSnapshot> {
        let mut snapshot = KernelSnapshot::default();
        if let Some(listing) = self.nft_list(None)? {
            for listed in nft::parse_listing(&listing) {
                match listed.entry {
                    Ok(entry) => snapshot.filters.push(entry),
                    Err(foreign) => snapshot.foreign.push(foreign),
                }
            }
        }
        for family in [Family::Ipv4, Family::Ipv6] {
            let rules = self.ip_json(&iproute::list_policy_args(family))?;
            snapshot
                .policies
                .extend(iproute::parse_policies(family, &rules, self.protocol));
            let routes = self.ip_json(&iproute::list_route_args(family, self.protocol))?;
            snapshot.routes.extend(iproute::parse_routes(family, &routes));
        }
        Ok(snapshot)
    }

    fn flush_filter_table(&self) -> Result<()> {
        match self.nft_batch(&nft::flush_table(&self.table)) {
            Err(Error::Nftables {
                stderr: Some(stderr),
                ..
            }) if KernelErrorPattern::is_absent(&stderr) => Ok(()),
            other => other,
        }
    }

    fn flush_managed_routes(&self) -> Result<()> {
        let live = self.snapshot()?;
        let count = live.policies.len() + live.routes.len();
        for policy in &live.policies {
            self.execute(&KernelOp::DeletePolicy(policy.clone()))?;
        }
        for route in &live.routes {
            self.execute(&KernelOp::DeleteRoute(route.clone()))?;
        }
        if count > 0 {
            info!("Removed {count} managed routing entries");
        }
        Ok(())
    }

    fn flush_route_cache(&self) -> Result<()> {
        self.write_proc("sys/net/ipv4/route/flush", "1")?;
        if let Err(e) = self.write_proc("sys/net/ipv6/route/flush", "1") {
            warn!("IPv6 route cache flush skipped: {e}");
        }
        Ok(())
    }

    fn set_ip_forward(&self, enabled: bool) -> Result<()> {
        let relative = "sys/net/ipv4/ip_forward";
        let wanted = if enabled { "1" } else { "0" };
        let current = std::fs::read_to_string(self.proc_root.join(relative)).unwrap_or_default();
        if current.trim() == wanted {
            return Ok(());
        }
        info!("Setting net.ipv4.ip_forward = {wanted}");
        self.write_proc(relative, wanted)
    }
}
