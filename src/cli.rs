//! CLI surface (spec.md §6: `agentd [-F] [-c <path>] <command>`).
//!
//! Grounded on the teacher's own `structopt`-derived command enum
//! (`exonum-cli`'s `Command`): one top-level struct carrying global flags,
//! with a subcommand enum for the public commands, plus a hidden `-P`
//! private-mode switch used only by the supervisor when it execs a child.

use structopt::StructOpt;

/// Public subcommands (spec.md §6).
#[derive(Debug, StructOpt, PartialEq, Eq)]
pub enum Command {
    /// Print usage information.
    Help,
    /// Read and validate the configuration file without starting any
    /// service.
    Readconfig,
    /// Start the full supervised service tree.
    Start,
}

/// Private subcommands selected by `-P`, one per forked service (spec.md
/// §6: "`-P <subcommand>` switches the process into private mode").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivateCommand {
    Readconfig,
    Dataservice,
    Listenservice,
    Random,
    UnauthorizedProtocolService,
    CanonizationService,
    Supervisor,
}

impl std::str::FromStr for PrivateCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "readconfig" => Self::Readconfig,
            "dataservice" => Self::Dataservice,
            "listenservice" => Self::Listenservice,
            "random" => Self::Random,
            "unauthorized_protocol_service" => Self::UnauthorizedProtocolService,
            "canonization_service" => Self::CanonizationService,
            "supervisor" => Self::Supervisor,
            other => return Err(format!("unrecognized private subcommand: {other}")),
        })
    }
}

/// Top-level CLI (spec.md §6).
#[derive(Debug, StructOpt)]
#[structopt(name = "agentd", about = "Privilege-separated blockchain agent daemon")]
pub struct Cli {
    /// Run in the foreground instead of daemonizing.
    #[structopt(short = "F", long = "foreground")]
    pub foreground: bool,

    /// Path to the agent configuration file.
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    pub config_path: Option<std::path::PathBuf>,

    /// Switches into private mode for a single forked service; used only
    /// by the supervisor, never by an interactive invocation.
    #[structopt(short = "P", long = "private")]
    pub private: Option<String>,

    #[structopt(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// Resolves the effective action: a private-mode subcommand takes
    /// priority over the public `command` when both are somehow present,
    /// matching the original binary's own argument precedence.
    pub fn resolve(&self) -> Result<Action, String> {
        if let Some(private) = &self.private {
            return Ok(Action::Private(private.parse()?));
        }
        match &self.command {
            Some(Command::Help) | None => Ok(Action::Help),
            Some(Command::Readconfig) => Ok(Action::Readconfig),
            Some(Command::Start) => Ok(Action::Start),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Help,
    Readconfig,
    Start,
    Private(PrivateCommand),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_command_resolves_to_help() {
        let cli = Cli {
            foreground: false,
            config_path: None,
            private: None,
            command: None,
        };
        assert_eq!(cli.resolve(), Ok(Action::Help));
    }

    #[test]
    fn private_flag_overrides_public_command() {
        let cli = Cli {
            foreground: false,
            config_path: None,
            private: Some("random".into()),
            command: Some(Command::Start),
        };
        assert_eq!(
            cli.resolve(),
            Ok(Action::Private(PrivateCommand::Random))
        );
    }

    #[test]
    fn unknown_private_subcommand_is_rejected() {
        let cli = Cli {
            foreground: false,
            config_path: None,
            private: Some("bogus".into()),
            command: None,
        };
        assert!(cli.resolve().is_err());
    }
}
