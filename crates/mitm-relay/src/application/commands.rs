//! Chat commands typed by the player.
//!
//! The command handler watches outbound `Text` packets.  A line starting with
//! the configured prefix (default `!`) is intercepted so the server never
//! sees it, and the result is sent back to the client as a system chat line.
//!
//! Built-in commands:
//!
//! | Command          | Effect                                          |
//! |------------------|-------------------------------------------------|
//! | `help`           | Lists the available commands                    |
//! | `modules`        | Lists registered handlers and whether they run  |
//! | `toggle <name>`  | Enables or disables every handler called `name` |
//!
//! More can be added with [`CommandHandler::with_command`].

use std::collections::BTreeMap;

use mitm_core::intercept::{
    Direction, HandlerContext, HandlerError, HandlerRegistry, InterceptablePacket, PacketHandler,
};
use mitm_core::protocol::packets::{GamePacket, TextPacket};
use tracing::{debug, info};

use crate::application::{COMMANDS, SYSTEM_HANDLERS};

/// Result of running a command: the reply line, or an error line.
pub type CommandResult = Result<String, String>;

/// Signature of a command implementation.  Receives the arguments after the
/// command name.
pub type CommandFn = dyn Fn(&[&str], &HandlerContext<'_>) -> CommandResult + Send + Sync;

struct Command {
    description: String,
    run: Box<CommandFn>,
}

pub struct CommandHandler {
    prefix: String,
    commands: BTreeMap<String, Command>,
}

impl CommandHandler {
    /// Creates a handler with the built-in commands.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            commands: BTreeMap::new(),
        }
        .with_command("modules", "list modules and their state", list_modules)
        .with_command("toggle", "toggle <name>: switch a module on or off", toggle_module)
    }

    /// Adds (or replaces) a command.
    pub fn with_command<F>(mut self, name: &str, description: &str, run: F) -> Self
    where
        F: Fn(&[&str], &HandlerContext<'_>) -> CommandResult + Send + Sync + 'static,
    {
        self.commands.insert(
            name.to_ascii_lowercase(),
            Command {
                description: description.to_string(),
                run: Box::new(run),
            },
        );
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Runs one command line (without the prefix) and returns the reply.
    pub fn dispatch(&self, line: &str, ctx: &HandlerContext<'_>) -> String {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return format!("type {}help for a list of commands", self.prefix);
        };
        let name = name.to_ascii_lowercase();
        let args: Vec<&str> = words.collect();

        if name == "help" {
            return self.help();
        }
        match self.commands.get(&name) {
            Some(command) => match (command.run)(&args, ctx) {
                Ok(reply) => reply,
                Err(err) => format!("{}{name}: {err}", self.prefix),
            },
            None => format!(
                "unknown command {:?}; type {}help for a list",
                name, self.prefix
            ),
        }
    }

    fn help(&self) -> String {
        let mut lines = vec![format!("{}help - show this list", self.prefix)];
        lines.extend(
            self.commands
                .iter()
                .map(|(name, cmd)| format!("{}{name} - {}", self.prefix, cmd.description)),
        );
        lines.join("\n")
    }
}

impl PacketHandler for CommandHandler {
    fn handle(
        &self,
        packet: &mut InterceptablePacket,
        ctx: &HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        let line = match packet.packet() {
            GamePacket::Text(text) => match text.message.strip_prefix(self.prefix.as_str()) {
                Some(rest) => rest.to_string(),
                None => return Ok(()),
            },
            _ => return Ok(()),
        };

        packet.intercept();
        debug!("chat command: {}", line.split_whitespace().next().unwrap_or(""));
        let reply = self.dispatch(&line, ctx);
        ctx.send_to_client(GamePacket::Text(TextPacket::system(reply)));
        Ok(())
    }
}

// ── Built-in commands ─────────────────────────────────────────────────────────

fn list_modules(_args: &[&str], ctx: &HandlerContext<'_>) -> CommandResult {
    let mut names: Vec<(String, bool)> = Vec::new();
    for info in ctx.registry.registrations() {
        match names.iter_mut().find(|(name, _)| *name == info.name) {
            Some((_, enabled)) => *enabled |= info.enabled,
            None => names.push((info.name, info.enabled)),
        }
    }
    if names.is_empty() {
        return Ok("no modules registered".to_string());
    }
    Ok(names
        .iter()
        .map(|(name, enabled)| format!("{name}: {}", if *enabled { "on" } else { "off" }))
        .collect::<Vec<_>>()
        .join("\n"))
}

fn toggle_module(args: &[&str], ctx: &HandlerContext<'_>) -> CommandResult {
    let [name] = args else {
        return Err("expected exactly one module name".to_string());
    };
    if SYSTEM_HANDLERS.contains(name) {
        return Err(format!("{name} is part of the relay and cannot be toggled"));
    }
    let current = ctx
        .registry
        .is_enabled_by_name(name)
        .ok_or_else(|| format!("no module called {name:?}"))?;
    ctx.registry
        .set_enabled_by_name(name, !current)
        .map_err(|e| e.to_string())?;
    let state = if current { "off" } else { "on" };
    info!("module {name} switched {state} by chat command");
    Ok(format!("{name} is now {state}"))
}

/// Registers `handler` for outbound traffic under the system name.
pub fn register(handler: CommandHandler, registry: &HandlerRegistry) {
    registry.register(COMMANDS, Direction::Outbound, handler);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
