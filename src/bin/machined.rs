//! machined - machine registry inspection tool
//!
//! Drives the registry from the command line for diagnostics.
//!
//! ## Usage
//!
//! ```sh
//! machined addresses <name> <leader-pid>   # addresses inside a container
//! machined host-addresses                  # addresses of the host
//! machined whois <pid>                     # fingerprint and owning unit
//! machined list                            # registered machines (JSON)
//! ```
//!
//! Log verbosity comes from `MACHINED_LOG` (error, warn, info, debug, trace).

use machined::{Error, MachineClass, MachineRegistration, Manager, ManagerConfig};
use std::process::ExitCode;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

/// Crate version for `machined version`.
const VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Addresses { name: String, pid: i32 },
    HostAddresses,
    Whois { pid: i32 },
    List,
    Version,
    Help,
}

fn parse_pid(arg: Option<&String>) -> Result<i32, String> {
    let raw = arg.ok_or_else(|| "missing <pid>".to_string())?;
    match raw.parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(format!("invalid pid '{raw}'")),
    }
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "addresses" => {
            let name = args
                .get(2)
                .cloned()
                .ok_or_else(|| "addresses requires <name> <pid>".to_string())?;
            let pid = parse_pid(args.get(3))?;
            Ok(Command::Addresses { name, pid })
        }
        "host-addresses" => Ok(Command::HostAddresses),
        "whois" => Ok(Command::Whois {
            pid: parse_pid(args.get(2))?,
        }),
        "list" => Ok(Command::List),
        "version" | "--version" | "-V" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command '{other}'")),
    }
}

fn print_help() {
    println!(
        "machined {VERSION}

USAGE:
    machined <COMMAND>

COMMANDS:
    addresses <name> <pid>   Show addresses inside the container led by <pid>
    host-addresses           Show addresses of the host
    whois <pid>              Show fingerprint and owning unit of <pid>
    list                     List registered machines as JSON
    version                  Print version
    help                     Print this help

ENVIRONMENT:
    MACHINED_LOG             Log level (default: warn)"
    );
}

fn init_logging() {
    let level = std::env::var("MACHINED_LOG")
        .ok()
        .and_then(|v| v.parse::<Level>().ok())
        .unwrap_or(Level::WARN);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

// =============================================================================
// Commands
// =============================================================================

fn run(command: Command) -> machined::Result<()> {
    match command {
        Command::Version => {
            println!("machined {VERSION}");
            return Ok(());
        }
        Command::Help => {
            print_help();
            return Ok(());
        }
        _ => {}
    }

    let manager = Manager::new(ManagerConfig::default().with_gc_on_idle(false))?;

    match command {
        Command::Addresses { name, pid } => {
            let machine = manager.register(
                MachineRegistration::new(name, MachineClass::Container).with_leader(pid),
            )?;
            match manager.resolve_addresses(&machine) {
                Ok(addresses) => {
                    for a in addresses {
                        println!("{a}");
                    }
                }
                Err(e) if e.is_topology() => {
                    println!("{}: shares the host network", machine.name());
                }
                Err(e) => return Err(e),
            }
        }
        Command::HostAddresses => {
            let host = manager
                .machine(machined::HOST_MACHINE_NAME)
                .ok_or_else(|| Error::NoSuchMachine(machined::HOST_MACHINE_NAME.to_string()))?;
            for a in manager.resolve_addresses(&host)? {
                println!("{a}");
            }
        }
        Command::Whois { pid } => {
            let handle = manager.procfs().handle(pid)?;
            let unit = manager.procfs().unit_of(pid).unwrap_or(None);
            println!("pid:        {}", handle.pid());
            println!("start time: {}", handle.start_time());
            println!("unit:       {}", unit.as_deref().unwrap_or("-"));
            match manager.find_machine_for_pid(pid) {
                Some(m) => println!("machine:    {}", m.name()),
                None => println!("machine:    -"),
            }
        }
        Command::List => {
            let json = serde_json::to_string_pretty(&manager.list_machines())
                .map_err(|e| Error::Internal(e.to_string()))?;
            println!("{json}");
        }
        Command::Version | Command::Help => {}
    }
    Ok(())
}

fn main() -> ExitCode {
    init_logging();

    let command = match parse_args() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            print_help();
            return ExitCode::from(2);
        }
    };

    match run(command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, errno = e.errno(), "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
