//! Remote command tree.
//!
//! The same command surface is reachable over SSH sessions and the HTTP
//! `run-command` endpoint. The tree itself is declarative; dispatch lives in
//! [`exec`].

pub mod exec;

use clap::{Arg, ArgAction, Command};

/// Build the command tree. Parsing never exits the process and help/errors
/// render into strings the session prints.
pub fn root_command() -> Command {
    Command::new("catch")
        .no_binary_name(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .disable_colored_help(true)
        .subcommands([
            run_cmd(),
            stage_cmd(),
            Command::new("start").about("Start a service"),
            Command::new("stop").about("Stop a service"),
            Command::new("restart").about("Restart a service"),
            Command::new("rollback").about("Roll a service back one generation"),
            Command::new("enable").about("Enable a service"),
            Command::new("disable").about("Disable a service"),
            Command::new("remove").about("Remove a service"),
            edit_cmd(),
            Command::new("env").about("Print the environment file"),
            logs_cmd(),
            status_cmd(),
            events_cmd(),
            cron_cmd(),
            mount_cmd(),
            Command::new("umount")
                .about("Unmount a directory")
                .arg(Arg::new("name").required(true)),
            Command::new("ip").about("Show the IP addresses of a service"),
            Command::new("ts")
                .about("Run a mesh client command against the service's instance")
                .arg(
                    Arg::new("args")
                        .num_args(0..)
                        .allow_hyphen_values(true)
                        .trailing_var_arg(true),
                ),
            Command::new("version")
                .about("Show the daemon version")
                .arg(flag("json", "Output as JSON")),
        ])
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .help(help)
        .action(ArgAction::SetTrue)
}

/// Flags shared by `run` and `stage`: network attachment plus free-form
/// service arguments after `--`.
fn with_install_flags(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("net")
            .long("net")
            .value_parser(["none", "ts", "macvlan"])
            .help("Network namespace mode"),
    )
    .arg(Arg::new("ts-ver").long("ts-ver").help("Mesh client version; when net=ts"))
    .arg(
        Arg::new("ts-tags")
            .long("ts-tags")
            .action(ArgAction::Append)
            .help("Mesh tags to advertise; when net=ts"),
    )
    .arg(Arg::new("ts-exit").long("ts-exit").help("Mesh exit node; when net=ts"))
    .arg(
        Arg::new("ts-auth-key")
            .long("ts-auth-key")
            .help("Mesh auth key; when net=ts"),
    )
    .arg(
        Arg::new("macvlan-parent")
            .long("macvlan-parent")
            .help("Macvlan parent interface; when net=macvlan"),
    )
    .arg(
        Arg::new("macvlan-mac")
            .long("macvlan-mac")
            .help("Macvlan MAC address; when net=macvlan"),
    )
    .arg(
        Arg::new("macvlan-vlan")
            .long("macvlan-vlan")
            .value_parser(clap::value_parser!(u16))
            .help("Macvlan VLAN id; when net=macvlan"),
    )
    .arg(
        Arg::new("restart")
            .long("restart")
            .value_parser(clap::value_parser!(bool))
            .num_args(0..=1)
            .default_value("true")
            .default_missing_value("true")
            .help("Whether to (re)start the service afterwards"),
    )
    .arg(
        Arg::new("args")
            .num_args(0..)
            .allow_hyphen_values(true)
            .trailing_var_arg(true)
            .help("Arguments passed to the service"),
    )
}

fn run_cmd() -> Command {
    with_install_flags(
        Command::new("run").about("Install a service from the payload received on stdin"),
    )
}

fn stage_cmd() -> Command {
    with_install_flags(
        Command::new("stage")
            .about("Stage a service without starting it")
            .subcommand(
                Command::new("show")
                    .about("Show the staged configuration")
                    .arg(flag("env", "Show the staged environment file")),
            )
            .subcommand(Command::new("clear").about("Clear the staged configuration"))
            .subcommand(
                Command::new("commit")
                    .about("Commit the staged configuration")
                    .arg(
                        Arg::new("restart")
                            .long("restart")
                            .value_parser(clap::value_parser!(bool))
                            .num_args(0..=1)
                            .default_value("true")
                            .default_missing_value("true")
                            .help("Whether to restart the service after committing"),
                    ),
            ),
    )
}

fn edit_cmd() -> Command {
    Command::new("edit")
        .about("Open an editor on the service's artifacts")
        .arg(flag("env", "Edit the environment file"))
        .arg(flag("config", "Edit the raw service record"))
        .arg(flag("ts", "Edit the mesh network configuration"))
        .arg(
            Arg::new("restart")
                .long("restart")
                .value_parser(clap::value_parser!(bool))
                .num_args(0..=1)
                .default_value("true")
                .default_missing_value("true")
                .help("Whether to restart the service after editing"),
        )
}

fn logs_cmd() -> Command {
    Command::new("logs")
        .about("Show logs of a service")
        .arg(
            Arg::new("follow")
                .short('f')
                .long("follow")
                .action(ArgAction::SetTrue)
                .help("Follow the logs"),
        )
        .arg(
            Arg::new("lines")
                .short('n')
                .long("lines")
                .value_parser(clap::value_parser!(i64))
                .default_value("-1")
                .help("Number of lines to show from the end of the logs"),
        )
}

fn status_cmd() -> Command {
    Command::new("status").about("Show status of a service").arg(
        Arg::new("format")
            .long("format")
            .value_parser(["table", "json", "json-pretty"])
            .default_value("table")
            .help("Output format"),
    )
}

fn events_cmd() -> Command {
    Command::new("events")
        .about("Stream events for a service")
        .arg(flag("all", "Show events for all services"))
}

fn cron_cmd() -> Command {
    Command::new("cron")
        .about("Install a periodic service from the payload received on stdin")
        .arg(
            Arg::new("args")
                .num_args(1..)
                .allow_hyphen_values(true)
                .trailing_var_arg(true)
                .required(true)
                .help("Five cron fields, then arguments after --"),
        )
}

fn mount_cmd() -> Command {
    Command::new("mount")
        .about("Mount a directory from a host")
        .arg(
            Arg::new("type")
                .short('t')
                .long("type")
                .default_value("nfs")
                .help("Filesystem type"),
        )
        .arg(
            Arg::new("opts")
                .short('o')
                .long("opts")
                .default_value("defaults")
                .help("Mount options"),
        )
        .arg(
            Arg::new("deps")
                .long("deps")
                .value_delimiter(',')
                .help("Unit names this mount depends on"),
        )
        .arg(Arg::new("source").help("host:path source"))
        .arg(Arg::new("name").help("Mount name; defaults to the source basename"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> clap::error::Result<clap::ArgMatches> {
        root_command().try_get_matches_from(args)
    }

    #[test]
    fn run_accepts_network_flags_and_trailing_args() {
        let m = parse(&[
            "run",
            "--net",
            "ts",
            "--ts-tags",
            "tag:prod",
            "--",
            "--port=8080",
            "-v",
        ])
        .unwrap();
        let (name, sub) = m.subcommand().unwrap();
        assert_eq!(name, "run");
        assert_eq!(sub.get_one::<String>("net").unwrap(), "ts");
        let args: Vec<&String> = sub.get_many::<String>("args").unwrap().collect();
        assert_eq!(args, ["--port=8080", "-v"]);
        assert!(sub.get_one::<bool>("restart").copied().unwrap());
    }

    #[test]
    fn stage_commit_parses_restart_flag() {
        let m = parse(&["stage", "commit", "--restart=false"]).unwrap();
        let (_, stage) = m.subcommand().unwrap();
        let (name, commit) = stage.subcommand().unwrap();
        assert_eq!(name, "commit");
        assert!(!commit.get_one::<bool>("restart").copied().unwrap());
    }

    #[test]
    fn cron_requires_expression_fields() {
        assert!(parse(&["cron"]).is_err());
        let m = parse(&["cron", "*/5", "*", "*", "*", "*", "--", "--flag"]).unwrap();
        let (_, cron) = m.subcommand().unwrap();
        let args: Vec<&String> = cron.get_many::<String>("args").unwrap().collect();
        assert_eq!(args.len(), 6);
    }

    #[test]
    fn unknown_subcommand_is_an_error() {
        assert!(parse(&["frobnicate"]).is_err());
    }

    #[test]
    fn logs_flags() {
        let m = parse(&["logs", "-f", "-n", "50"]).unwrap();
        let (_, logs) = m.subcommand().unwrap();
        assert!(logs.get_flag("follow"));
        assert_eq!(logs.get_one::<i64>("lines").copied().unwrap(), 50);
    }
}
