//! Command-line interface for farsight.

use std::env;

#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    /// Run the VR cycle without a window or GPU for a fixed frame count.
    Headless { frames: u32 },
    /// Run with the companion window.
    Run,
}

pub struct Cli {
    pub command: CliCommand,
}

impl Cli {
    /// Parse command-line arguments.
    ///
    /// Supported commands:
    /// - `./farsight headless <frames>` - Drive the wait/poll cycle headless
    /// - `./farsight` (no args) - Run with the companion window
    pub fn parse() -> Self {
        let args: Vec<String> = env::args().collect();

        let command = if args.len() >= 2 && args[1] == "headless" {
            let frames = args
                .get(2)
                .and_then(|s| s.parse().ok())
                .unwrap_or(90);
            CliCommand::Headless { frames }
        } else if args.len() >= 2 {
            eprintln!("Unknown command: {}. Running normally.", args[1]);
            CliCommand::Run
        } else {
            CliCommand::Run
        };

        Cli { command }
    }
}
