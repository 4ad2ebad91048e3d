//! # Console Front-End
//!
//! Line-based stand-in for the measuring screen. Reads commands from stdin,
//! forwards them to the [`SessionHandle`] and prints the connection status and
//! current reading whenever the session view changes.

pub mod commands;

use std::io::Write as _;
use std::path::PathBuf;

use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::{debug, info, warn};

use crate::config::Theme;
use crate::mqtt::ConnectionStatus;
use crate::report::SummaryReport;
use crate::session::{
    Confirm, Lifecycle, PendingMeasurement, SessionContext, SessionError, SessionHandle,
    SessionView,
};
use commands::{is_yes, Command, HELP};

pub type InputLines<R> = Lines<BufReader<R>>;

pub fn input_lines<R: AsyncRead + Unpin>(reader: R) -> InputLines<R> {
    BufReader::new(reader).lines()
}

/// An answer collected before the action was sent to the session.
struct Answered(bool);

impl Confirm for Answered {
    fn confirm(&self, _prompt: &str) -> bool {
        self.0
    }
}

enum Input {
    Interrupt,
    ViewChanged,
    ViewClosed,
    Line(std::io::Result<Option<String>>),
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

fn prompt(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

/// Asks for client and address until both are filled in. The visit date is
/// today's and is not asked for. `None` on end of input.
pub async fn entry_form<R: AsyncRead + Unpin>(
    lines: &mut InputLines<R>,
) -> Result<Option<SessionContext>> {
    loop {
        let Some(client) = ask(lines, "Client name: ").await? else {
            return Ok(None);
        };
        let Some(address) = ask(lines, "Address: ").await? else {
            return Ok(None);
        };

        match SessionContext::from_form(&client, &address, None) {
            Ok(context) => {
                println!("Visit date: {}", context.visit_date());
                return Ok(Some(context));
            }
            Err(e) => println!("{}", e),
        }
    }
}

async fn ask<R: AsyncRead + Unpin>(
    lines: &mut InputLines<R>,
    question: &str,
) -> Result<Option<String>> {
    prompt(question);
    Ok(lines.next_line().await?)
}

pub struct Console {
    handle: SessionHandle,
    theme: Theme,
    report_dir: Option<PathBuf>,
    shown: Option<SessionView>,
}

impl Console {
    pub fn new(handle: SessionHandle, theme: Theme, report_dir: Option<PathBuf>) -> Self {
        Self {
            handle,
            theme,
            report_dir,
            shown: None,
        }
    }

    /// Runs until `quit`, `finish`, Ctrl-C or end of input, then shuts the session down.
    pub async fn run<R: AsyncRead + Unpin>(mut self, mut lines: InputLines<R>) -> Result<()> {
        let mut view_rx = self.handle.watch_view();
        println!("{}", HELP);
        let initial = view_rx.borrow_and_update().clone();
        self.show_changes(&initial);

        loop {
            prompt("> ");
            let input = tokio::select! {
                _ = tokio::signal::ctrl_c() => Input::Interrupt,
                changed = view_rx.changed() => match changed {
                    Ok(()) => Input::ViewChanged,
                    Err(_) => Input::ViewClosed,
                },
                line = lines.next_line() => Input::Line(line),
            };

            let flow = match input {
                Input::Interrupt => {
                    info!("Interrupted");
                    Flow::Exit
                }
                Input::ViewClosed => {
                    warn!("Session worker stopped");
                    Flow::Exit
                }
                Input::ViewChanged => {
                    let view = view_rx.borrow_and_update().clone();
                    self.show_changes(&view);
                    Flow::Continue
                }
                Input::Line(line) => match line? {
                    None => Flow::Exit,
                    Some(line) => match line.parse::<Command>() {
                        Ok(command) => self.execute(command, &mut lines).await?,
                        Err(e) => {
                            println!("{}", e);
                            Flow::Continue
                        }
                    },
                },
            };

            if flow == Flow::Exit {
                break;
            }
        }

        self.handle.shutdown().await;
        Ok(())
    }

    async fn execute<R: AsyncRead + Unpin>(
        &mut self,
        command: Command,
        lines: &mut InputLines<R>,
    ) -> Result<Flow> {
        debug!("Command {:?}", command);
        let outcome = match command {
            Command::Measure => self.handle.request_measurement().await,
            Command::Label(label) => self.handle.set_draft_label(label).await,
            Command::Commit(label) => self.handle.commit_reading(label).await,
            Command::Discard => self.handle.discard_pending().await,
            Command::Edit(index) => self.handle.edit_reading(index).await.map(|entry| {
                println!("Editing '{}', measure again or commit to put it back", entry);
            }),
            Command::Delete(index) => {
                let view = self.handle.view();
                let Some(entry) = view.readings.get(index) else {
                    self.report_error(&SessionError::IndexOutOfRange {
                        index,
                        len: view.readings.len(),
                    });
                    return Ok(Flow::Continue);
                };
                prompt(&format!("Remove '{}'? [y/N] ", entry));
                let answer = lines.next_line().await?.unwrap_or_default();
                self.handle
                    .delete_reading(index, Box::new(Answered(is_yes(&answer))))
                    .await
                    .map(|removed| println!("Removed '{}'", removed))
            }
            Command::List => {
                self.print_list(&self.handle.view());
                Ok(())
            }
            Command::Status => {
                let view = self.handle.view();
                self.print_status(&view);
                println!("Label: {}", display_label(&view.draft_label));
                Ok(())
            }
            Command::Reconnect => self.handle.reconnect().await,
            Command::Finish => match self.handle.finalize().await {
                Ok(finalized) => {
                    let report = SummaryReport::from_session(&finalized);
                    self.print_report(&report).await;
                    return Ok(Flow::Exit);
                }
                Err(e) => Err(e),
            },
            Command::Help => {
                println!("{}", HELP);
                Ok(())
            }
            Command::Quit => return Ok(Flow::Exit),
        };

        match outcome {
            Ok(()) => Ok(Flow::Continue),
            Err(SessionError::Closed | SessionError::WorkerGone) => {
                println!("{}", SessionError::Closed);
                Ok(Flow::Exit)
            }
            Err(e) => {
                self.report_error(&e);
                Ok(Flow::Continue)
            }
        }
    }

    fn report_error(&self, error: &SessionError) {
        let message = match error {
            SessionError::IndexOutOfRange { index, len } => {
                format!("No reading number {} (list has {})", index + 1, len)
            }
            other => other.to_string(),
        };
        println!("{}", Theme::paint(self.theme.failed, &message));
    }

    /// Prints what differs from the last view shown.
    fn show_changes(&mut self, view: &SessionView) {
        let previous = self.shown.replace(view.clone());
        let status_changed = previous.as_ref().map(|p| p.status) != Some(view.status);
        let pending_changed = previous.as_ref().map(|p| &p.pending) != Some(&view.pending);

        if view.lifecycle != Lifecycle::Active {
            return;
        }
        if status_changed {
            self.print_status(view);
            if view.status == ConnectionStatus::ConnectFailed {
                println!("Type 'reconnect' to try again");
            }
        }
        if pending_changed {
            match &view.pending {
                PendingMeasurement::AwaitingResponse => println!("Measuring..."),
                PendingMeasurement::Value(value) => println!(
                    "Reading: {}",
                    Theme::paint(self.theme.highlight, &value.with_unit())
                ),
                PendingMeasurement::NoValue => {}
            }
        }
    }

    fn print_status(&self, view: &SessionView) {
        let color = self.theme.status_color(view.status);
        println!(
            "{} {}  | reading {}",
            Theme::paint(color, "●"),
            view.status,
            view.pending
        );
    }

    fn print_list(&self, view: &SessionView) {
        if view.readings.is_empty() {
            println!("No readings yet");
            return;
        }
        for (number, entry) in view.readings.iter().enumerate() {
            println!("{:>3}. {}", number + 1, entry);
        }
    }

    async fn print_report(&self, report: &SummaryReport) {
        println!();
        println!("{}", Theme::paint(self.theme.highlight, report.title()));
        println!("{}", report.text());

        let Some(dir) = &self.report_dir else {
            return;
        };
        match report.share(dir).await {
            Ok(path) => println!("Saved to {}", path.display()),
            Err(e) => println!("{}", Theme::paint(self.theme.failed, &e.to_string())),
        }
    }
}

fn display_label(label: &str) -> &str {
    if label.is_empty() {
        "(none)"
    } else {
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::{
        ChannelError, ChannelEvent, CommandChannel, ConnectionEpoch, LinkEvent, MQTTMessage,
        MqttConfig,
    };
    use crate::session::context::format_visit_date;
    use crate::session::MeasurementSession;
    use tokio::sync::mpsc;

    struct Loopback {
        replies: mpsc::Sender<ChannelEvent>,
    }

    impl CommandChannel for Loopback {
        fn connect(&mut self) -> Result<ConnectionEpoch, ChannelError> {
            let epoch = ConnectionEpoch::default().next();
            let _ = self.replies.try_send(ChannelEvent {
                epoch,
                kind: LinkEvent::Connected,
            });
            Ok(epoch)
        }

        fn send(&mut self, _payload: &str) -> Result<(), ChannelError> {
            let _ = self.replies.try_send(ChannelEvent {
                epoch: ConnectionEpoch::default().next(),
                kind: LinkEvent::Message(MQTTMessage::from_topic(
                    "projeto_trena/resultado".into(),
                    "2500".into(),
                )),
            });
            Ok(())
        }

        fn disconnect(&mut self) {}

        fn status(&self) -> ConnectionStatus {
            ConnectionStatus::Connected
        }
    }

    fn handle() -> SessionHandle {
        let (tx, rx) = mpsc::channel(16);
        let context = SessionContext::from_form("Ana", "Rua A", Some("16/10/2026")).unwrap();
        let session =
            MeasurementSession::new(context, Box::new(Loopback { replies: tx }), &MqttConfig::default());
        SessionHandle::spawn(session, rx)
    }

    #[tokio::test]
    async fn entry_form_reprompts_on_blank_fields() {
        let input: &[u8] = b"  \nRua A\nAna\nRua A\n01/02/2026\n";
        let mut lines = input_lines(input);
        let context = entry_form(&mut lines).await.unwrap().unwrap();
        assert_eq!(context.client_name(), "Ana");
        assert_eq!(context.address(), "Rua A");
        assert_eq!(
            context.visit_date(),
            format_visit_date(chrono::Local::now().date_naive())
        );
        // the date is never read from input
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("01/02/2026"));
    }

    #[tokio::test]
    async fn entry_form_stops_at_end_of_input() {
        let input: &[u8] = b"Ana\n";
        let mut lines = input_lines(input);
        assert!(entry_form(&mut lines).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn declined_delete_keeps_reading() {
        let handle = handle();
        let mut view = handle.watch_view();
        view.wait_for(|v| v.status == ConnectionStatus::Connected)
            .await
            .unwrap();
        handle.request_measurement().await.unwrap();
        view.wait_for(|v| v.pending.value().is_some()).await.unwrap();
        handle.commit_reading(Some("Wall A".into())).await.unwrap();

        let mut console = Console::new(handle, Theme::default(), None);
        let input: &[u8] = b"n\n";
        let mut lines = input_lines(input);
        let flow = console.execute(Command::Delete(0), &mut lines).await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(console.handle.view().readings.len(), 1);

        let input: &[u8] = b"y\n";
        let mut lines = input_lines(input);
        console.execute(Command::Delete(0), &mut lines).await.unwrap();
        assert!(console.handle.view().readings.is_empty());
    }

    #[tokio::test]
    async fn finish_writes_report_and_exits() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle();
        let mut view = handle.watch_view();
        view.wait_for(|v| v.status == ConnectionStatus::Connected)
            .await
            .unwrap();

        let mut console = Console::new(handle, Theme::default(), Some(dir.path().to_path_buf()));
        let mut lines = input_lines(&b""[..]);
        assert_eq!(
            console.execute(Command::Finish, &mut lines).await.unwrap(),
            Flow::Continue
        );

        console.execute(Command::Measure, &mut lines).await.unwrap();
        view.wait_for(|v| v.pending.value().is_some()).await.unwrap();
        console
            .execute(Command::Commit(Some("Wall A".into())), &mut lines)
            .await
            .unwrap();
        assert_eq!(
            console.execute(Command::Finish, &mut lines).await.unwrap(),
            Flow::Exit
        );

        let written = std::fs::read_to_string(dir.path().join("Ana-16_10_2026.txt")).unwrap();
        assert!(written.ends_with("1. Wall A: 2500 mm\n"));
    }
}
