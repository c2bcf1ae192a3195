//! reality-admin CLI tool
//!
//! Manual recovery for a running reality-node.
//!
//! Usage:
//!   reality-admin ping
//!   reality-admin status
//!   reality-admin resume
//!   reality-admin clear-alarm
//!   reality-admin reload-behavior

use nomic_reality::admin_socket::{AdminCommand, AdminResponse};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

fn print_usage() {
    eprintln!("reality-admin - Recover and inspect a Nomic reality node");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  reality-admin ping              Check if the node is running");
    eprintln!("  reality-admin status            Print the game state as JSON");
    eprintln!("  reality-admin resume            Leave the halted phase after repair");
    eprintln!("  reality-admin clear-alarm       Acknowledge the active alarm");
    eprintln!("  reality-admin reload-behavior   Load the behavior from trunk again");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  REALITY_ADMIN_SOCKET  Path to admin socket (default: ./reality-data/admin.sock)");
}

fn get_socket_path() -> PathBuf {
    std::env::var("REALITY_ADMIN_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(nomic_reality::admin_socket::default_socket_path()))
}

fn send_command(cmd: &AdminCommand) -> Result<AdminResponse, String> {
    let socket_path = get_socket_path();

    let mut stream = UnixStream::connect(&socket_path).map_err(|e| {
        format!(
            "Failed to connect to reality-node at {:?}: {}\n\
             Is the reality-node running?",
            socket_path, e
        )
    })?;

    let cmd_json = serde_json::to_string(cmd).map_err(|e| e.to_string())?;
    writeln!(stream, "{}", cmd_json).map_err(|e| e.to_string())?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .map_err(|e| e.to_string())?;

    serde_json::from_str(&response_line).map_err(|e| format!("Invalid response: {}", e))
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let Some(command) = args.get(1) else {
        print_usage();
        std::process::exit(1);
    };

    let cmd = match command.as_str() {
        "ping" => AdminCommand::Ping,
        "status" => AdminCommand::Status,
        "resume" => AdminCommand::Resume,
        "clear-alarm" => AdminCommand::ClearAlarm,
        "reload-behavior" => AdminCommand::ReloadBehavior,
        "-h" | "--help" | "help" => {
            print_usage();
            std::process::exit(0);
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    };

    match send_command(&cmd) {
        Ok(AdminResponse::Ok { message }) => println!("{}", message),
        Ok(AdminResponse::Error { error }) => {
            eprintln!("Error: {}", error);
            std::process::exit(1);
        }
        Ok(AdminResponse::State { state }) => match serde_json::to_string_pretty(&state) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        Ok(AdminResponse::Pong) => println!("pong - reality-node is running"),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
