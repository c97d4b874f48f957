//! phantom-fw - operator CLI
//!
//! Drives the reconciliation engine against the host kernel (or, with
//! `--dry-run`, against an in-memory kernel and a scratch copy of the store).
//!
//! # Usage
//!
//! ```bash
//! phantom-fw status
//! phantom-fw group create vpn1 --type custom --priority 10
//! phantom-fw rule add vpn1 --chain nat --action masquerade --source 10.0.0.0/24 --out-iface eth0
//! phantom-fw group enable vpn1
//! phantom-fw verify --diff             # exit code 2 on drift
//! phantom-fw preset kill-switch --wg-port 51820 --wg-iface wg0
//! phantom-fw --dry-run group enable vpn1
//! ```
//!
//! # Exit codes
//!
//! - `0`: success
//! - `1`: the operation failed
//! - `2`: `verify` found drift

use clap::{Args, Parser, Subcommand};
use phantom_fw::config;
use phantom_fw::core::error::KernelErrorPattern;
use phantom_fw::core::firewall::{Family, FirewallRule, RoutingRule, RuleGroup};
use phantom_fw::core::kernel::MemoryKernel;
use phantom_fw::core::rule_constraints::{RouteText, RuleText};
use phantom_fw::utils::{self, truncate_string};
use phantom_fw::{Engine, Error};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "phantom-fw")]
#[command(about = "Stateful nftables and policy-routing manager", long_about = None)]
#[command(version)]
struct Cli {
    /// State database (default: <data_dir>/phantom-fw.db)
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// Use an in-memory kernel and a scratch copy of the store
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show lifecycle state and rule counts
    Status,
    /// Rebuild the kernel state from the store
    Start,
    /// Withdraw every managed kernel entry
    Stop,
    /// Manage rule groups
    #[command(subcommand)]
    Group(GroupCommand),
    /// Manage firewall rules
    #[command(subcommand)]
    Rule(RuleCommand),
    /// Manage policy routing rules and routes
    #[command(subcommand)]
    Route(RouteCommand),
    /// Apply or remove presets
    #[command(subcommand)]
    Preset(PresetCommand),
    /// Print the live managed kernel state as JSON
    KernelState,
    /// Compare the kernel against the store
    Verify {
        /// Print a line diff of expected vs live state
        #[arg(long)]
        diff: bool,
    },
    /// Remove every rule from the managed nftables table
    FlushTable,
    /// Flush the kernel route cache
    FlushRouteCache,
    /// Enable IPv4 forwarding
    IpForward,
}

#[derive(Subcommand)]
enum GroupCommand {
    List,
    Show {
        name: String,
    },
    Create {
        name: String,
        #[arg(long = "type", default_value = "custom")]
        group_type: String,
        #[arg(long, default_value_t = 100, allow_negative_numbers = true)]
        priority: i32,
    },
    Delete {
        name: String,
    },
    Enable {
        name: String,
    },
    Disable {
        name: String,
    },
}

#[derive(Subcommand)]
enum RuleCommand {
    /// Add a firewall rule to a group
    Add(RuleArgs),
    Remove {
        id: i64,
    },
    List {
        #[arg(long)]
        group: Option<String>,
    },
}

#[derive(Args)]
struct RuleArgs {
    group: String,
    /// input, output, forward or nat
    #[arg(long)]
    chain: String,
    /// accept, drop or masquerade
    #[arg(long)]
    action: String,
    #[arg(long, default_value_t = Family::Ipv4)]
    family: Family,
    /// tcp, udp, icmp, icmpv6
    #[arg(long, default_value = "")]
    proto: String,
    #[arg(long, default_value_t = 0)]
    dport: u16,
    #[arg(long, default_value = "")]
    source: String,
    #[arg(long, default_value = "")]
    destination: String,
    #[arg(long, default_value = "")]
    in_iface: String,
    #[arg(long, default_value = "")]
    out_iface: String,
    /// Conntrack states, e.g. established,related
    #[arg(long, default_value = "")]
    state: String,
}

#[derive(Subcommand)]
enum RouteCommand {
    /// Add a policy rule or route to a group
    Add(RouteArgs),
    Remove {
        id: i64,
    },
    List {
        #[arg(long)]
        group: Option<String>,
    },
}

#[derive(Args)]
struct RouteArgs {
    group: String,
    /// policy or route
    #[arg(long = "type")]
    rule_type: String,
    #[arg(long, default_value = "")]
    from: String,
    #[arg(long, default_value = "")]
    to: String,
    /// Table by name (main, rt_tables entries); alternative to --table
    #[arg(long, default_value = "")]
    table_name: String,
    #[arg(long, default_value_t = 0)]
    table: u32,
    #[arg(long, default_value_t = 0)]
    priority: u32,
    /// Route destination; omitted or `default` for the default route
    #[arg(long, default_value = "")]
    destination: String,
    #[arg(long, default_value = "")]
    device: String,
    #[arg(long, default_value = "0", value_parser = parse_mark)]
    fwmark: u32,
}

#[derive(Subcommand)]
enum PresetCommand {
    /// WireGuard server: tunnel port, forwarding, masquerade
    Vpn {
        name: String,
        #[arg(long)]
        wg_iface: String,
        #[arg(long)]
        wg_port: u16,
        #[arg(long)]
        wg_subnet: ipnetwork::IpNetwork,
        #[arg(long)]
        out_iface: String,
    },
    /// Chain two tunnels through a dedicated routing table
    Multihop {
        name: String,
        #[arg(long)]
        in_iface: String,
        #[arg(long)]
        out_iface: String,
        #[arg(long, default_value = "0", value_parser = parse_mark)]
        fwmark: u32,
        #[arg(long)]
        table: u32,
        #[arg(long)]
        subnet: ipnetwork::IpNetwork,
    },
    /// Block all egress except through the tunnel
    KillSwitch {
        #[arg(long)]
        wg_port: u16,
        #[arg(long, default_value_t = 0)]
        wstunnel_port: u16,
        #[arg(long)]
        wg_iface: String,
    },
    /// Restrict DNS to the tunnel and loopback
    Dns {
        #[arg(long)]
        wg_iface: String,
        #[arg(long = "dns-server")]
        dns_servers: Vec<IpAddr>,
    },
    /// Drop all IPv6 traffic
    Ipv6Block,
    /// Remove an applied preset
    Remove {
        name: String,
    },
}

/// Accepts decimal or `0x`-prefixed hex marks
fn parse_mark(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid mark '{text}': {e}"))
}

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            if e.is_kernel() {
                for hint in KernelErrorPattern::match_error(&e.to_string()).suggestions {
                    eprintln!("  hint: {hint}");
                }
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    // Set up logging to file
    if let Some(mut log_path) = utils::get_state_dir() {
        log_path.push("phantom-fw.log");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path);
        if let Ok(file) = file {
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
}

/// Holds the scratch store of a dry run until the command is done
struct Session {
    engine: Engine,
    dry_kernel: Option<MemoryKernel>,
    _scratch: Option<tempfile::TempDir>,
}

fn open(cli: &Cli) -> Result<Session, Error> {
    let config = config::load_config();
    let db = match &cli.db {
        Some(path) => path.clone(),
        None => utils::default_db_path()
            .ok_or_else(|| Error::InvalidState("cannot determine data directory".into()))?,
    };

    if !cli.dry_run {
        let engine = Engine::system(config)?;
        engine.init(&db.to_string_lossy())?;
        return Ok(Session {
            engine,
            dry_kernel: None,
            _scratch: None,
        });
    }

    let scratch = tempfile::tempdir()?;
    let copy = scratch.path().join(utils::DB_FILE_NAME);
    if db.exists() {
        std::fs::copy(&db, &copy)?;
    }
    let kernel = MemoryKernel::new();
    let engine = Engine::new(config, Arc::new(kernel.clone())).with_audit(None);
    // init reconciles the empty kernel, so it mirrors what the host holds
    engine.init(&copy.to_string_lossy())?;
    Ok(Session {
        engine,
        dry_kernel: Some(kernel),
        _scratch: Some(scratch),
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_groups(groups: &[RuleGroup]) {
    println!("{:<24} {:<14} {:>9}  ENABLED", "NAME", "TYPE", "PRIORITY");
    for g in groups {
        println!(
            "{:<24} {:<14} {:>9}  {}",
            truncate_string(&g.name, 24),
            truncate_string(&g.group_type, 14),
            g.priority,
            if g.enabled { "yes" } else { "no" }
        );
    }
}

fn print_rules(rules: &[FirewallRule]) {
    for r in rules {
        println!("{:>6}  {:<20} {}", r.id, truncate_string(&r.group_name, 20), r.spec.summary());
    }
}

fn print_routes(routes: &[RoutingRule]) {
    for r in routes {
        println!("{:>6}  {:<20} {}", r.id, truncate_string(&r.group_name, 20), r.spec.summary());
    }
}

fn run(cli: Cli) -> Result<ExitCode, Error> {
    let session = open(&cli)?;
    let engine = &session.engine;
    let before = session.dry_kernel.as_ref().map(MemoryKernel::executed);

    let code = match cli.command {
        Commands::Status => {
            print_json(&engine.status_report()?)?;
            ExitCode::SUCCESS
        }
        Commands::Start => {
            engine.start()?;
            println!("Started");
            ExitCode::SUCCESS
        }
        Commands::Stop => {
            engine.stop()?;
            println!("Stopped");
            ExitCode::SUCCESS
        }
        Commands::Group(cmd) => {
            run_group(engine, cmd)?;
            ExitCode::SUCCESS
        }
        Commands::Rule(cmd) => {
            run_rule(engine, cmd)?;
            ExitCode::SUCCESS
        }
        Commands::Route(cmd) => {
            run_route(engine, cmd)?;
            ExitCode::SUCCESS
        }
        Commands::Preset(cmd) => {
            run_preset(engine, cmd)?;
            ExitCode::SUCCESS
        }
        Commands::KernelState => {
            print_json(&engine.get_kernel_state()?)?;
            ExitCode::SUCCESS
        }
        Commands::Verify { diff } => {
            let (report, text) = engine.verify_with_diff()?;
            if report.in_sync {
                println!("In sync ({})", &report.live_fingerprint[..12]);
                ExitCode::SUCCESS
            } else {
                println!(
                    "Drift: {} missing, {} unexpected",
                    report.missing.len(),
                    report.unexpected.len()
                );
                for item in &report.missing {
                    println!("  missing     {}", item.describe());
                }
                for item in &report.unexpected {
                    println!("  unexpected  {}", item.describe());
                }
                if diff {
                    print!("{text}");
                }
                ExitCode::from(2)
            }
        }
        Commands::FlushTable => {
            engine.flush_firewall_table()?;
            println!("Managed table flushed");
            ExitCode::SUCCESS
        }
        Commands::FlushRouteCache => {
            engine.flush_route_cache()?;
            println!("Route cache flushed");
            ExitCode::SUCCESS
        }
        Commands::IpForward => {
            engine.enable_ip_forward()?;
            println!("IPv4 forwarding enabled");
            ExitCode::SUCCESS
        }
    };

    if let (Some(kernel), Some(before)) = (&session.dry_kernel, before) {
        println!(
            "[dry run] {} kernel operations, nothing written to the host or the store",
            kernel.executed() - before
        );
    }
    engine.close()?;
    Ok(code)
}

fn run_group(engine: &Engine, cmd: GroupCommand) -> Result<(), Error> {
    match cmd {
        GroupCommand::List => print_groups(&engine.list_groups()?),
        GroupCommand::Show { name } => {
            print_json(&engine.get_group(&name)?)?;
            print_rules(&engine.list_rules(Some(&name))?);
            print_routes(&engine.list_routes(Some(&name))?);
        }
        GroupCommand::Create {
            name,
            group_type,
            priority,
        } => {
            engine.create_group(&name, &group_type, priority)?;
            println!("Created group '{name}' (disabled)");
        }
        GroupCommand::Delete { name } => {
            engine.delete_group(&name)?;
            println!("Deleted group '{name}'");
        }
        GroupCommand::Enable { name } => {
            engine.enable_group(&name)?;
            println!("Enabled group '{name}'");
        }
        GroupCommand::Disable { name } => {
            engine.disable_group(&name)?;
            println!("Disabled group '{name}'");
        }
    }
    Ok(())
}

fn run_rule(engine: &Engine, cmd: RuleCommand) -> Result<(), Error> {
    match cmd {
        RuleCommand::Add(args) => {
            let spec = RuleText {
                chain: &args.chain,
                rule_type: &args.action,
                family: args.family,
                proto: &args.proto,
                dport: args.dport,
                source: &args.source,
                destination: &args.destination,
                in_iface: &args.in_iface,
                out_iface: &args.out_iface,
                state_match: &args.state,
            }
            .parse()?;
            let rule = engine.add_rule(&args.group, spec)?;
            println!("{}", rule.id);
        }
        RuleCommand::Remove { id } => engine.remove_rule(id)?,
        RuleCommand::List { group } => print_rules(&engine.list_rules(group.as_deref())?),
    }
    Ok(())
}

fn run_route(engine: &Engine, cmd: RouteCommand) -> Result<(), Error> {
    match cmd {
        RouteCommand::Add(args) => {
            let spec = RouteText {
                rule_type: &args.rule_type,
                from_network: &args.from,
                to_network: &args.to,
                table_name: &args.table_name,
                table_id: args.table,
                priority: args.priority,
                destination: &args.destination,
                device: &args.device,
                fwmark: args.fwmark,
            }
            .parse()?;
            let route = engine.add_route(&args.group, spec)?;
            println!("{}", route.id);
        }
        RouteCommand::Remove { id } => engine.remove_route(id)?,
        RouteCommand::List { group } => print_routes(&engine.list_routes(group.as_deref())?),
    }
    Ok(())
}

fn run_preset(engine: &Engine, cmd: PresetCommand) -> Result<(), Error> {
    let group = match cmd {
        PresetCommand::Vpn {
            name,
            wg_iface,
            wg_port,
            wg_subnet,
            out_iface,
        } => engine.apply_preset_vpn(&name, &wg_iface, wg_port, wg_subnet, &out_iface)?,
        PresetCommand::Multihop {
            name,
            in_iface,
            out_iface,
            fwmark,
            table,
            subnet,
        } => engine.apply_preset_multihop(&name, &in_iface, &out_iface, fwmark, table, subnet)?,
        PresetCommand::KillSwitch {
            wg_port,
            wstunnel_port,
            wg_iface,
        } => engine.apply_preset_kill_switch(wg_port, wstunnel_port, &wg_iface)?,
        PresetCommand::Dns {
            wg_iface,
            dns_servers,
        } => engine.apply_preset_dns_protection(&dns_servers, &wg_iface)?,
        PresetCommand::Ipv6Block => engine.apply_preset_ipv6_block()?,
        PresetCommand::Remove { name } => {
            engine.remove_preset(&name)?;
            println!("Removed preset '{name}'");
            return Ok(());
        }
    };
    println!("Applied preset as group '{}'", group.name);
    print_rules(&engine.list_rules(Some(&group.name))?);
    print_routes(&engine.list_routes(Some(&group.name))?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use phantom_fw::core::kernel::KernelBackend;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_mark() {
        assert_eq!(parse_mark("100"), Ok(100));
        assert_eq!(parse_mark("0x64"), Ok(0x64));
        assert!(parse_mark("0xzz").is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "phantom-fw", "group", "create", "vpn1", "--priority", "-5", "--dry-run", "--db", "/tmp/x.db",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        assert!(matches!(
            cli.command,
            Commands::Group(GroupCommand::Create { priority: -5, .. })
        ));
    }

    #[test]
    fn test_dry_run_mirrors_expected_state() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state.db");
        let kernel = MemoryKernel::new();
        let engine = Engine::new(config::EngineConfig::default(), Arc::new(kernel.clone()))
            .with_audit(None);
        engine.init(&db.to_string_lossy()).unwrap();
        engine.create_group("web", "custom", 10).unwrap();
        engine
            .add_rule(
                "web",
                RuleText {
                    chain: "input",
                    rule_type: "accept",
                    proto: "tcp",
                    dport: 443,
                    ..RuleText::default()
                }
                .parse()
                .unwrap(),
            )
            .unwrap();
        engine.enable_group("web").unwrap();
        engine.close().unwrap();

        let db_arg = db.to_string_lossy().into_owned();
        let cli = Cli::try_parse_from(["phantom-fw", "--dry-run", "--db", db_arg.as_str(), "verify"])
        .unwrap();
        let session = open(&cli).unwrap();
        assert!(session.engine.verify_rules().unwrap().in_sync);
        assert_eq!(session.dry_kernel.unwrap().snapshot().unwrap().filters.len(), 1);
    }
}
