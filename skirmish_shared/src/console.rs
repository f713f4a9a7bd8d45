//! Operator console input.
//!
//! Both binaries read commands from stdin on a plain thread and hand them to
//! their async loop through a channel.

use std::{
    io::{BufRead, Write},
    thread::JoinHandle,
};

use tokio::sync::mpsc;

/// Forwards trimmed, non-empty lines from `input` until EOF, a read error,
/// or the receiver going away. Writes `] ` to `prompt` before each line.
pub fn forward_lines<R: BufRead, W: Write>(mut input: R, mut prompt: W, tx: &mpsc::Sender<String>) {
    loop {
        let _ = write!(prompt, "] ");
        let _ = prompt.flush();
        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim();
        if !line.is_empty() && tx.blocking_send(line.to_string()).is_err() {
            break;
        }
    }
}

/// Spawns the stdin reader thread.
pub fn spawn_stdin_reader(tx: mpsc::Sender<String>) -> JoinHandle<()> {
    std::thread::spawn(move || forward_lines(std::io::stdin().lock(), std::io::stdout(), &tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{sink, Cursor};

    #[test]
    fn stops_at_end_of_input() {
        let (tx, mut rx) = mpsc::channel(8);
        let reader = std::thread::spawn(move || {
            forward_lines(Cursor::new("status\n\n  spawn 2  \nquit"), sink(), &tx)
        });
        reader.join().unwrap();

        let mut lines = Vec::new();
        while let Some(line) = rx.blocking_recv() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["status", "spawn 2", "quit"]);
    }

    #[test]
    fn stops_when_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        forward_lines(Cursor::new("a\nb\nc\n"), sink(), &tx);
    }
}
