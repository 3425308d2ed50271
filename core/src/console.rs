use std::io::{self, BufRead, Write};

/// Where user-facing messages go. Diagnostics go through `tracing` instead.
pub trait Console: Send {
    fn info(&mut self, message: &str);
    fn error(&mut self, message: &str);
    /// Block until the user acknowledges.
    fn wait_for_key(&mut self);
}

/// stdout/stderr console; waits for Enter on stdin.
#[derive(Debug, Default)]
pub struct StdConsole;

impl Console for StdConsole {
    fn info(&mut self, message: &str) {
        println!("{}", message);
    }

    fn error(&mut self, message: &str) {
        eprintln!("{}", message);
    }

    fn wait_for_key(&mut self) {
        let _ = io::stdout().flush();
        let mut line = String::new();
        // EOF or a closed stdin simply returns
        let _ = io::stdin().lock().read_line(&mut line);
    }
}
