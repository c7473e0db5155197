//! Text admin commands.
//!
//! A peer that opens a line with anything but a zero byte is talking the
//! admin protocol: one command per line, one textual reply. List replies
//! end with a line holding a single `.`.

use foreman_jobs::JobManager;

/// A parsed admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Status,
    PriorityStatus,
    Workers,
    MaxQueue {
        function_name: String,
        max_size: Option<usize>,
    },
    Version,
    Shutdown,
    Unknown(String),
}

impl AdminCommand {
    /// Parses a trimmed line. The command word is case-insensitive.
    pub fn parse(line: &str) -> Self {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return AdminCommand::Unknown(String::new());
        };

        match command.to_ascii_lowercase().as_str() {
            "status" => AdminCommand::Status,
            "priority-status" => AdminCommand::PriorityStatus,
            "workers" => AdminCommand::Workers,
            "version" => AdminCommand::Version,
            "shutdown" => AdminCommand::Shutdown,
            "maxqueue" => {
                let Some(function_name) = words.next() else {
                    return AdminCommand::Unknown(line.to_string());
                };
                let max_size = match words.next() {
                    None => None,
                    Some(size) => match size.parse() {
                        Ok(size) => Some(size),
                        Err(_) => return AdminCommand::Unknown(line.to_string()),
                    },
                };
                AdminCommand::MaxQueue {
                    function_name: function_name.to_string(),
                    max_size,
                }
            }
            _ => AdminCommand::Unknown(line.to_string()),
        }
    }
}

/// Result of running an admin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminReply {
    pub text: String,
    pub shutdown: bool,
}

impl AdminReply {
    fn text(text: String) -> Self {
        Self {
            text,
            shutdown: false,
        }
    }
}

/// One line per item, closed by a lone `.`.
fn listing(lines: impl Iterator<Item = String>) -> AdminReply {
    let mut out: String = lines.map(|line| line + "\n").collect();
    out.push_str(".\n");
    AdminReply::text(out)
}

/// Runs a command against the broker state.
pub fn execute(command: &AdminCommand, manager: &JobManager) -> AdminReply {
    match command {
        AdminCommand::Status => listing(manager.function_stats().into_iter().map(|stats| {
            format!(
                "{}\t{}\t{}\t{}",
                stats.function_name, stats.queued, stats.running, stats.workers
            )
        })),
        AdminCommand::PriorityStatus => {
            listing(manager.function_stats().into_iter().map(|stats| {
                format!(
                    "{}\t{}\t{}\t{}\t{}",
                    stats.function_name, stats.high, stats.normal, stats.low, stats.workers
                )
            }))
        }
        AdminCommand::Workers => listing(manager.sessions().into_iter().map(|session| {
            let client_id = session.client_id().unwrap_or_else(|| "-".to_string());
            let mut line = format!("{} {} {} :", session.id(), session.peer(), client_id);
            for function_name in session.abilities() {
                line.push(' ');
                line.push_str(&function_name);
            }
            line
        })),
        AdminCommand::MaxQueue {
            function_name,
            max_size,
        } => {
            manager.set_max_queue(function_name, max_size.unwrap_or(0));
            AdminReply::text("OK\n".to_string())
        }
        AdminCommand::Version => AdminReply::text(format!("OK {}\n", env!("CARGO_PKG_VERSION"))),
        AdminCommand::Shutdown => AdminReply {
            text: "OK\n".to_string(),
            shutdown: true,
        },
        AdminCommand::Unknown(_) => {
            AdminReply::text("ERR UNKNOWN_COMMAND Unknown+server+command\n".to_string())
        }
    }
}
