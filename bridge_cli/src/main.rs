//! Funchaiku - line-driven host for the haiku language server bridge.
//!
//! Usage: funchaiku [--config FILE] [--root DIR]
//!
//! Reads commands from stdin:
//!   show FILE LINE COL       present the haiku at a position (1-based)
//!   generate FILE LINE COL   ask the server for a haiku, discard the result
//!   status                   print session state and recent notifications
//!   quit

use funchaiku_host::{
    Bridge, BridgeCommand, CommandOutcome, EditorHost, Notification, NotificationManager,
};
use funchaiku_lsp::{BridgeConfig, PositionRequest};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Command line options.
#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    config: Option<PathBuf>,
    root: Option<PathBuf>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Options, String> {
    let mut options = Options::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().ok_or("--config needs a file")?;
                options.config = Some(PathBuf::from(path));
            }
            "--root" => {
                let path = args.next().ok_or("--root needs a directory")?;
                options.root = Some(PathBuf::from(path));
            }
            other => return Err(format!("unexpected argument '{}'", other)),
        }
    }
    Ok(options)
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Trigger {
        command: BridgeCommand,
        path: PathBuf,
        line: u32,
        column: u32,
    },
    Status,
    Quit,
}

fn parse_input(line: &str) -> Result<Option<Input>, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let (command, rest) = match parts.split_first() {
        Some((command, rest)) => (*command, rest),
        None => return Ok(None),
    };

    match command {
        "status" => Ok(Some(Input::Status)),
        "quit" | "exit" => Ok(Some(Input::Quit)),
        "show" | "generate" => {
            let &[path, line, column] = rest else {
                return Err(format!("usage: {} FILE LINE COL", command));
            };
            let number = |s: &str| {
                s.parse::<u32>()
                    .map_err(|_| format!("'{}' is not a line or column number", s))
            };
            Ok(Some(Input::Trigger {
                command: if command == "show" {
                    BridgeCommand::Show
                } else {
                    BridgeCommand::Generate
                },
                path: PathBuf::from(path),
                // Positions are 0-based on the wire
                line: number(line)?.saturating_sub(1),
                column: number(column)?.saturating_sub(1),
            }))
        }
        other => Err(format!("unknown command '{}'", other)),
    }
}

/// Host backed by the terminal.
#[derive(Default)]
struct CliHost {
    cursor: Mutex<Option<PositionRequest>>,
    notifications: Mutex<NotificationManager>,
}

impl CliHost {
    fn move_cursor(&self, cursor: Option<PositionRequest>) {
        if let Ok(mut current) = self.cursor.lock() {
            *current = cursor;
        }
    }

    fn print_status(&self, bridge: &Bridge) {
        println!("session: {}", bridge.session().state());
        println!("sync batches: {}", bridge.session().sync_notifications_received());
        if let Ok(mut notifications) = self.notifications.lock() {
            notifications.update();
            for notification in notifications.visible() {
                println!("  {}", notification);
            }
        }
    }
}

impl EditorHost for CliHost {
    fn active_cursor(&self) -> Option<PositionRequest> {
        self.cursor.lock().ok().and_then(|cursor| cursor.clone())
    }

    fn present(&self, notification: Notification) {
        println!("{}", notification);
        if let Ok(mut notifications) = self.notifications.lock() {
            notifications.push(notification);
        }
    }
}

fn load_config(options: &Options) -> Result<BridgeConfig, String> {
    let mut config = match &options.config {
        Some(path) => BridgeConfig::load(path).map_err(|e| e.to_string())?,
        None => BridgeConfig::default(),
    };

    if let Some(root) = &options.root {
        config.workspace_root = Some(root.clone());
    }
    if config.workspace_root.is_none() {
        config.workspace_root = env::current_dir().ok();
    }
    // The watcher and file URIs want absolute paths
    config.workspace_root = config
        .workspace_root
        .map(|root| root.canonicalize().unwrap_or(root));
    Ok(config)
}

fn resolve(root: Option<&Path>, path: &Path) -> PathBuf {
    match root {
        Some(root) if path.is_relative() => root.join(path),
        _ => path.to_path_buf(),
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let options = match parse_args(env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("funchaiku: {}", e);
            eprintln!("usage: funchaiku [--config FILE] [--root DIR]");
            std::process::exit(2);
        }
    };
    let config = match load_config(&options) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };
    let root = config.workspace_root.clone();

    log::info!("Starting Funchaiku with `{}`", config.server.command);
    let host = Arc::new(CliHost::default());
    let mut bridge = Bridge::start_bridge(config, host.clone()).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Failed to read stdin: {}", e);
                        break;
                    }
                };

                match parse_input(&line) {
                    Ok(None) => {}
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(Input::Status)) => host.print_status(&bridge),
                    Ok(Some(Input::Trigger { command, path, line, column })) => {
                        let path = resolve(root.as_deref(), &path);
                        host.move_cursor(PositionRequest::for_path(&path, line, column));

                        let dispatcher = bridge.dispatcher();
                        tokio::spawn(async move {
                            match dispatcher.execute(command).await {
                                CommandOutcome::NothingToShow => println!("(nothing to show)"),
                                CommandOutcome::NoCursor => println!("(no document)"),
                                outcome => log::debug!("{}: {:?}", command.id(), outcome),
                            }
                        });
                    }
                    Err(e) => eprintln!("{}", e),
                }
            }
            _ = ticker.tick() => {
                bridge.poll();
            }
        }
    }

    bridge.stop_bridge().await;
    bridge.poll();
    log::info!("Funchaiku exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        assert_eq!(parse_args(args(&[])), Ok(Options::default()));
        assert_eq!(
            parse_args(args(&["--root", "/ws", "--config", "haiku.toml"])),
            Ok(Options {
                config: Some(PathBuf::from("haiku.toml")),
                root: Some(PathBuf::from("/ws")),
            })
        );
        assert!(parse_args(args(&["--root"])).is_err());
        assert!(parse_args(args(&["--verbose"])).is_err());
    }

    #[test]
    fn test_parse_trigger_converts_to_zero_based() {
        assert_eq!(
            parse_input("show main.go 3 7"),
            Ok(Some(Input::Trigger {
                command: BridgeCommand::Show,
                path: PathBuf::from("main.go"),
                line: 2,
                column: 6,
            }))
        );
        assert!(matches!(
            parse_input("generate a.py 1 1"),
            Ok(Some(Input::Trigger {
                command: BridgeCommand::Generate,
                ..
            }))
        ));
    }

    #[test]
    fn test_parse_other_input() {
        assert_eq!(parse_input("   "), Ok(None));
        assert_eq!(parse_input("status"), Ok(Some(Input::Status)));
        assert_eq!(parse_input("quit"), Ok(Some(Input::Quit)));
        assert!(parse_input("show main.go 3").is_err());
        assert!(parse_input("show main.go x 1").is_err());
        assert!(parse_input("dance").is_err());
    }

    #[test]
    fn test_resolve_relative_paths_against_root() {
        assert_eq!(
            resolve(Some(Path::new("/ws")), Path::new("src/main.go")),
            PathBuf::from("/ws/src/main.go")
        );
        assert_eq!(
            resolve(Some(Path::new("/ws")), Path::new("/abs/a.py")),
            PathBuf::from("/abs/a.py")
        );
        assert_eq!(resolve(None, Path::new("a.py")), PathBuf::from("a.py"));
    }

    #[test]
    fn test_cli_host_records_notifications() {
        let host = CliHost::default();
        assert!(host.active_cursor().is_none());

        host.move_cursor(PositionRequest::for_path(Path::new("/ws/a.py"), 0, 0));
        assert!(host.active_cursor().is_some());

        host.present(Notification::info("Content 🌸 pond"));
        assert!(host.notifications.lock().unwrap().has_notifications());
    }
}
