//! Console front end
//!
//! Prints every status change and turns typed lines into session commands.

use crate::domain::models::SessionStatus;
use crate::domain::error::SessionError;
use crate::infrastructure::bluetooth::SessionHandle;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Pulse,
    Scan,
    Status,
    Help,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_lowercase().as_str() {
            "pulse" | "p" => Some(Self::Pulse),
            "scan" | "s" => Some(Self::Scan),
            "status" => Some(Self::Status),
            "help" | "h" | "?" => Some(Self::Help),
            "quit" | "q" | "exit" => Some(Self::Quit),
            _ => None,
        }
    }
}

const HELP: &str = "commands: pulse (p), scan (s), status, help, quit (q)";

fn render(status: &SessionStatus) -> String {
    let button = if status.connected { "[Pulse]" } else { "[-----]" };
    format!("{} {}", button, status)
}

/// Print status changes until the session goes away.
pub async fn print_status(mut status: watch::Receiver<SessionStatus>) {
    println!("{}", render(&status.borrow_and_update()));
    while status.changed().await.is_ok() {
        println!("{}", render(&status.borrow_and_update()));
    }
    debug!("Status stream closed");
}

/// Read commands from `input` until EOF or `quit`.
pub async fn run<R>(
    input: R,
    session: SessionHandle,
    status: watch::Receiver<SessionStatus>,
) -> Result<(), SessionError>
where
    R: AsyncBufRead + Unpin,
{
    println!("{}", HELP);
    let mut lines = input.lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read input: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match ConsoleCommand::parse(&line) {
            Some(ConsoleCommand::Pulse) => {
                // Only Ready sessions act on it; mirror the disabled button.
                if !status.borrow().connected {
                    println!("Not connected");
                }
                session.trigger_pulse()?;
            }
            Some(ConsoleCommand::Scan) => session.start_scanning()?,
            Some(ConsoleCommand::Status) => println!("{}", render(&status.borrow())),
            Some(ConsoleCommand::Help) => println!("{}", HELP),
            Some(ConsoleCommand::Quit) => break,
            None => println!("Unknown command: {}", line.trim()),
        }
    }

    session.shutdown()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::SessionCommand;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("pulse"), Some(ConsoleCommand::Pulse));
        assert_eq!(ConsoleCommand::parse(" P "), Some(ConsoleCommand::Pulse));
        assert_eq!(ConsoleCommand::parse("s"), Some(ConsoleCommand::Scan));
        assert_eq!(ConsoleCommand::parse("quit"), Some(ConsoleCommand::Quit));
        assert_eq!(ConsoleCommand::parse("vibrate"), None);
    }

    #[test]
    fn test_render_disables_button_until_connected() {
        let mut status = SessionStatus::default();
        assert!(render(&status).starts_with("[-----]"));
        status.connected = true;
        assert!(render(&status).starts_with("[Pulse]"));
    }

    #[tokio::test]
    async fn test_run_forwards_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_status_tx, status_rx) = watch::channel(SessionStatus::default());
        let input: &[u8] = b"scan\n\nnonsense\npulse\nquit\nscan\n";

        run(input, SessionHandle::new(tx), status_rx).await.unwrap();

        assert!(matches!(rx.try_recv(), Ok(SessionCommand::StartScanning)));
        assert!(matches!(rx.try_recv(), Ok(SessionCommand::TriggerPulse)));
        assert!(matches!(rx.try_recv(), Ok(SessionCommand::Shutdown)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_reports_closed_session() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let (_status_tx, status_rx) = watch::channel(SessionStatus::default());
        let input: &[u8] = b"pulse\n";

        let result = run(input, SessionHandle::new(tx), status_rx).await;
        assert!(matches!(result, Err(SessionError::MailboxClosed)));
    }
}
