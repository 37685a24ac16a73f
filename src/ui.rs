use crate::chat::{ChatSession, ChatState, SubmitRejected};
use crate::client::{ChatError, CoachClient, StreamEnd, read_deltas};
use crate::protocol::Message;
use crossterm::cursor::MoveTo;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Paragraph, Widget, Wrap};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};
use std::io;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type TuiTerminal = Terminal<CrosstermBackend<io::Stdout>>;

const INPUT_HEIGHT: u16 = 6;
const REPLY_HEIGHT: u16 = 8;

pub const SUGGESTED_PROMPTS: [&str; 3] = [
    "Give me my daily/weekly overview",
    "What can I improve on",
    "Pre-match tips",
];

// Restores terminal settings even if the loop exits early.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = io::stdout().flush();
    }
}

#[derive(Debug, Clone)]
enum ChatLine {
    User(String),
    Coach(String),
    Info(String),
}

impl ChatLine {
    fn styled_lines(&self) -> Vec<(String, Style)> {
        let (header, color, body) = match self {
            ChatLine::User(body) => ("You:", Color::Blue, body),
            ChatLine::Coach(body) => ("Coach:", Color::Yellow, body),
            ChatLine::Info(body) => {
                let style = Style::default()
                    .fg(Color::Gray)
                    .add_modifier(Modifier::ITALIC);
                return vec![(format!("ℹ {}", body), style)];
            }
        };

        let header_style = Style::default().fg(color).add_modifier(Modifier::BOLD);
        let body_style = Style::default().fg(color);
        let mut lines = vec![(header.to_string(), header_style)];
        for line in body.lines() {
            lines.push((format!("  {}", line), body_style));
        }
        lines
    }

    fn to_text(&self) -> Text<'static> {
        let lines = self
            .styled_lines()
            .into_iter()
            .map(|(text, style)| Line::from(Span::styled(text, style)))
            .collect::<Vec<_>>();
        Text::from(lines)
    }

    fn rendered_height(&self, width: u16) -> u16 {
        let width = width.max(1) as usize;
        let total: usize = self
            .styled_lines()
            .iter()
            .map(|(text, _)| text.chars().count().max(1).div_ceil(width))
            .sum();
        total.min(u16::MAX as usize) as u16
    }
}

#[derive(Debug)]
enum UiEvent {
    Started,
    Delta(String),
    Finished(StreamEnd),
    Failed(ChatError),
}

/// Multi-line input with a character-based cursor.
struct InputBuffer {
    lines: Vec<String>,
    cursor_x: usize,
    cursor_y: usize,
}

impl InputBuffer {
    fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor_x: 0,
            cursor_y: 0,
        }
    }

    fn clear(&mut self) {
        self.lines = vec![String::new()];
        self.cursor_x = 0;
        self.cursor_y = 0;
    }

    fn set(&mut self, text: &str) {
        self.clear();
        for ch in text.chars() {
            self.insert_char(ch);
        }
    }

    fn line_len(&self, y: usize) -> usize {
        self.lines[y].chars().count()
    }

    fn byte_offset(&self) -> usize {
        let line = &self.lines[self.cursor_y];
        line.char_indices()
            .nth(self.cursor_x)
            .map(|(idx, _)| idx)
            .unwrap_or(line.len())
    }

    fn insert_char(&mut self, c: char) {
        let at = self.byte_offset();
        self.lines[self.cursor_y].insert(at, c);
        self.cursor_x += 1;
    }

    fn delete_char(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
            let at = self.byte_offset();
            self.lines[self.cursor_y].remove(at);
        } else if self.cursor_y > 0 {
            let tail = self.lines.remove(self.cursor_y);
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
            self.lines[self.cursor_y].push_str(&tail);
        }
    }

    fn new_line(&mut self) {
        let at = self.byte_offset();
        let tail = self.lines[self.cursor_y].split_off(at);
        self.lines.insert(self.cursor_y + 1, tail);
        self.cursor_y += 1;
        self.cursor_x = 0;
    }

    fn move_left(&mut self) {
        if self.cursor_x > 0 {
            self.cursor_x -= 1;
        } else if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.line_len(self.cursor_y);
        }
    }

    fn move_right(&mut self) {
        if self.cursor_x < self.line_len(self.cursor_y) {
            self.cursor_x += 1;
        } else if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = 0;
        }
    }

    fn move_up(&mut self) {
        if self.cursor_y > 0 {
            self.cursor_y -= 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn move_down(&mut self) {
        if self.cursor_y < self.lines.len() - 1 {
            self.cursor_y += 1;
            self.cursor_x = self.cursor_x.min(self.line_len(self.cursor_y));
        }
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }

    fn render(&self) -> Text<'static> {
        if self.is_empty() {
            return Text::from(Span::styled(
                "Ask your coach... (Tab for a suggestion)",
                Style::default().fg(Color::DarkGray),
            ));
        }
        Text::from(
            self.lines
                .iter()
                .map(|l| Line::from(l.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

pub struct App {
    session: ChatSession,
    input: InputBuffer,
    client: Arc<CoachClient>,
    sender: mpsc::UnboundedSender<UiEvent>,
    receiver: mpsc::UnboundedReceiver<UiEvent>,
    turn: Option<JoinHandle<()>>,
    next_suggestion: usize,
    should_quit: bool,
}

impl App {
    pub fn new(client: CoachClient) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            session: ChatSession::new(),
            input: InputBuffer::new(),
            client: Arc::new(client),
            sender,
            receiver,
            turn: None,
            next_suggestion: 0,
            should_quit: false,
        }
    }

    fn draw(&mut self, f: &mut Frame) {
        let [reply_area, input_area] =
            Layout::vertical([Constraint::Min(0), Constraint::Length(INPUT_HEIGHT)])
                .areas(f.area());

        self.draw_reply(f, reply_area);

        let title = match self.session.state() {
            ChatState::Idle => " Input (Enter to send, Esc to quit) ",
            ChatState::Sending { .. } => " Input (Enter to send, Esc to quit) [Thinking...] ",
            ChatState::Streaming { .. } => " Input (Enter to send, Esc to quit) [Replying...] ",
        };

        let input_paragraph = Paragraph::new(self.input.render())
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(title)
                    .border_style(Style::default().fg(Color::DarkGray)),
            )
            .wrap(Wrap { trim: false });

        f.render_widget(input_paragraph, input_area);

        let cursor_x = (self.input.cursor_x + 1) as u16;
        let cursor_y = self.input.cursor_y as u16;
        let x = (input_area.x + cursor_x).min(input_area.x + input_area.width - 2);
        let y = (input_area.y + 1 + cursor_y).min(input_area.y + input_area.height - 2);
        f.set_cursor_position((x, y));
    }

    // The reply being streamed lives in the viewport until it is final.
    fn draw_reply(&self, f: &mut Frame, area: Rect) {
        let Some(reply) = self.session.pending_reply() else {
            return;
        };

        if reply.content.is_empty() {
            let waiting = Paragraph::new(Span::styled(
                "Coach is typing...",
                Style::default().fg(Color::DarkGray),
            ));
            f.render_widget(waiting, area);
            return;
        }

        let line = ChatLine::Coach(reply.content.clone());
        let overflow = line.rendered_height(area.width).saturating_sub(area.height);
        let paragraph = Paragraph::new(line.to_text())
            .wrap(Wrap { trim: false })
            .scroll((overflow, 0));
        f.render_widget(paragraph, area);
    }

    fn append_line(&mut self, terminal: &mut TuiTerminal, line: ChatLine) -> anyhow::Result<()> {
        let width = terminal.size()?.width;
        let height = line.rendered_height(width).saturating_add(1);
        let mut text = line.to_text();
        text.extend(Text::raw("\n"));
        // Insert above the inline viewport so the log stays in scrollback.
        terminal.insert_before(height, |buf| {
            let paragraph = Paragraph::new(text).wrap(Wrap { trim: false });
            paragraph.render(buf.area, buf);
        })?;
        Ok(())
    }

    fn submit(&mut self, terminal: &mut TuiTerminal) -> anyhow::Result<()> {
        let payload = match self.session.submit(&self.input.text()) {
            Ok(payload) => payload,
            Err(SubmitRejected::Empty | SubmitRejected::Busy) => return Ok(()),
        };

        if let Some(Message { content, .. }) = payload.last() {
            self.append_line(terminal, ChatLine::User(content.clone()))?;
        }
        self.input.clear();

        let client = Arc::clone(&self.client);
        let sender = self.sender.clone();
        self.turn = Some(tokio::spawn(async move {
            let event = match stream_turn(&client, &payload, &sender).await {
                Ok(end) => UiEvent::Finished(end),
                Err(err) => UiEvent::Failed(err),
            };
            let _ = sender.send(event);
        }));
        Ok(())
    }

    fn apply(&mut self, terminal: &mut TuiTerminal, event: UiEvent) -> anyhow::Result<()> {
        let transition = match event {
            UiEvent::Started => self.session.begin_streaming(),
            UiEvent::Delta(delta) => self.session.apply_delta(&delta),
            UiEvent::Finished(end) => {
                self.turn = None;
                tracing::debug!(?end, "reply finished");
                match self.session.finalize() {
                    Ok(reply) => {
                        let line = ChatLine::Coach(reply.content.clone());
                        self.append_line(terminal, line)?;
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            UiEvent::Failed(err) => {
                self.turn = None;
                match self.session.rollback(&err) {
                    Ok(notice) => {
                        self.append_line(terminal, ChatLine::Info(notice.text().to_string()))?;
                        Ok(())
                    }
                    Err(transition) => Err(transition),
                }
            }
        };

        if let Err(err) = transition {
            tracing::error!(%err, "chat view out of sync");
        }
        Ok(())
    }

    // Closing the in-flight response goes through the same rollback as a
    // transport failure.
    fn cancel_turn(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.abort();
        }
        if self.session.is_busy() {
            let _ = self.session.rollback(&ChatError::Cancelled);
        }
    }

    fn handle_events(&mut self, terminal: &mut TuiTerminal) -> anyhow::Result<bool> {
        while let Ok(event) = self.receiver.try_recv() {
            self.apply(terminal, event)?;
        }

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c')
                {
                    self.should_quit = true;
                    return Ok(false);
                }

                match key.code {
                    KeyCode::Esc => {
                        self.should_quit = true;
                        return Ok(false);
                    }
                    KeyCode::Enter => {
                        if key.modifiers.contains(KeyModifiers::SHIFT) {
                            self.input.new_line();
                        } else {
                            self.submit(terminal)?;
                        }
                    }
                    KeyCode::Tab if self.input.is_empty() => {
                        let prompt = SUGGESTED_PROMPTS[self.next_suggestion];
                        self.next_suggestion = (self.next_suggestion + 1) % SUGGESTED_PROMPTS.len();
                        self.input.set(prompt);
                    }
                    KeyCode::Char(c) => self.input.insert_char(c),
                    KeyCode::Backspace => self.input.delete_char(),
                    KeyCode::Left => self.input.move_left(),
                    KeyCode::Right => self.input.move_right(),
                    KeyCode::Up => self.input.move_up(),
                    KeyCode::Down => self.input.move_down(),
                    KeyCode::Home => self.input.cursor_x = 0,
                    KeyCode::End => self.input.cursor_x = self.input.line_len(self.input.cursor_y),
                    _ => {}
                }
            }
        }

        Ok(true)
    }
}

async fn stream_turn(
    client: &CoachClient,
    payload: &[Message],
    sender: &mpsc::UnboundedSender<UiEvent>,
) -> Result<StreamEnd, ChatError> {
    let response = client.open(payload).await?;
    let _ = sender.send(UiEvent::Started);
    let end = read_deltas(response.bytes_stream(), |delta| {
        let _ = sender.send(UiEvent::Delta(delta.to_string()));
    })
    .await?;
    Ok(end)
}

pub fn run_tui(client: CoachClient) -> anyhow::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    let (_, rows) = size()?;
    if rows > 0 {
        // Push existing screen content into scrollback without clearing it.
        for _ in 0..rows {
            writeln!(stdout)?;
        }
        stdout.flush()?;
    }
    execute!(stdout, MoveTo(0, 0))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::with_options(
        backend,
        TerminalOptions {
            viewport: Viewport::Inline(REPLY_HEIGHT + INPUT_HEIGHT),
        },
    )?;

    let _guard = TerminalGuard;
    let mut app = App::new(client);

    app.append_line(
        &mut terminal,
        ChatLine::Info(format!("Connected to {}", app.client.endpoint())),
    )?;
    for prompt in SUGGESTED_PROMPTS {
        app.append_line(&mut terminal, ChatLine::Info(format!("Try: {}", prompt)))?;
    }

    terminal.draw(|f| app.draw(f))?;

    while !app.should_quit {
        if !app.handle_events(&mut terminal)? {
            break;
        }

        terminal.draw(|f| app.draw(f))?;

        std::thread::sleep(Duration::from_millis(10));
    }

    app.cancel_turn();
    disable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.flush()?;

    Ok(())
}
