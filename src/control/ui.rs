use std::error::Error;
use std::io::stdout;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table, Wrap};

use crate::config::CommsConfig;
use crate::control::api::{self, StationStatus};
use crate::station::LoopbackSession;
use crate::tone::ToneGenerator;
use crate::{push_log, recent_logs};

const MAX_CATCH_UP: Duration = Duration::from_millis(250);
const LOG_LINES: usize = 6;
const CLIP_SECONDS: f32 = 0.75;

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    #[default]
    Experimenter,
    Participant,
}

impl Side {
    fn flip(self) -> Self {
        match self {
            Side::Experimenter => Side::Participant,
            Side::Participant => Side::Experimenter,
        }
    }
}

struct AppState {
    session: LoopbackSession,
    sample_rate: u32,
    side: Side,
    selected: usize,
    tone_on: bool,
    message: Option<String>,
}

impl AppState {
    fn station_mut(&mut self) -> &mut crate::station::Station {
        match self.side {
            Side::Experimenter => &mut self.session.experimenter,
            Side::Participant => &mut self.session.participant,
        }
    }

    fn mic(&self) -> &crate::capture::MicrophoneControl {
        match self.side {
            Side::Experimenter => &self.session.experimenter_mic,
            Side::Participant => &self.session.participant_mic,
        }
    }
}

/// Run the console over an in-process experimenter/participant session.
pub fn run(config: &CommsConfig) -> Result<(), Box<dyn Error>> {
    let mut session = LoopbackSession::new(config);
    if !session.connect(Duration::from_secs(1))? {
        return Err("loopback session did not connect".into());
    }

    setup_terminal()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let mut app = AppState {
        session,
        sample_rate: config.sample_rate,
        side: Side::default(),
        selected: 0,
        tone_on: false,
        message: None,
    };
    let result = event_loop(&mut terminal, &mut app, config.stream_count);

    app.session.experimenter.teardown();
    app.session.participant.teardown();
    restore_terminal()?;
    result
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    app: &mut AppState,
    stream_count: usize,
) -> Result<(), Box<dyn Error>> {
    let mut last = Instant::now();
    loop {
        let now = Instant::now();
        let behind = now.duration_since(last).min(MAX_CATCH_UP);
        last = now;
        app.session.advance(behind)?;

        let experimenter = api::station_status(&app.session.experimenter);
        let participant = api::station_status(&app.session.participant);
        terminal.draw(|frame| draw(frame, app, &experimenter, &participant))?;

        if event::poll(Duration::from_millis(10))? {
            if let CEvent::Key(key) = event::read()? {
                if handle_key(app, key, stream_count) {
                    return Ok(());
                }
            }
        }
    }
}

fn setup_terminal() -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    Ok(())
}

fn restore_terminal() -> Result<(), Box<dyn Error>> {
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

fn handle_key(app: &mut AppState, key: KeyEvent, stream_count: usize) -> bool {
    let channel = app.selected;
    let outcome = match key.code {
        KeyCode::Char('q') => return true,
        KeyCode::Up => {
            app.selected = app.selected.saturating_sub(1);
            return false;
        }
        KeyCode::Down => {
            if app.selected + 1 < stream_count {
                app.selected += 1;
            }
            return false;
        }
        KeyCode::Tab => {
            app.side = app.side.flip();
            return false;
        }
        KeyCode::Char(' ') => api::toggle_transmit(app.station_mut(), channel)
            .map(|on| format!("ch {channel} {}", if on { "keyed" } else { "released" })),
        KeyCode::Char('m') => api::toggle_monitoring(app.station_mut(), channel)
            .map(|on| format!("ch {channel} monitor {}", if on { "on" } else { "off" })),
        KeyCode::Char('t') => {
            app.tone_on = !app.tone_on;
            let sample_rate = app.sample_rate;
            if app.tone_on {
                app.mic().set_tone(sample_rate, 1_000.0, 0.5);
            } else {
                app.mic().silence();
            }
            Ok(format!("mic tone {}", if app.tone_on { "on" } else { "off" }))
        }
        KeyCode::Char('c') => {
            let mut clip = vec![0.0f32; (app.sample_rate as f32 * CLIP_SECONDS) as usize];
            ToneGenerator::new(app.sample_rate, 800.0, 0.5).fill(&mut clip);
            app.station_mut()
                .play_clip(channel, Arc::from(clip))
                .map(|_| format!("clip queued on ch {channel}"))
        }
        _ => return false,
    };
    let message = match outcome {
        Ok(message) => message,
        Err(err) => format!("error: {err}"),
    };
    push_log(message.clone());
    app.message = Some(message);
    false
}

fn draw(
    frame: &mut ratatui::Frame<'_>,
    app: &AppState,
    experimenter: &StationStatus,
    participant: &StationStatus,
) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Min(8),
            Constraint::Length(LOG_LINES as u16 + 2),
            Constraint::Length(3),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], experimenter, participant);

    let tables = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(chunks[1]);
    draw_channels(frame, tables[0], experimenter, app, app.side == Side::Experimenter);
    draw_channels(frame, tables[1], participant, app, app.side == Side::Participant);

    draw_logs(frame, chunks[2]);
    draw_footer(frame, chunks[3], app);
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: Rect, a: &StationStatus, b: &StationStatus) {
    let line = |status: &StationStatus| {
        let color = match status.connection.as_str() {
            "connected" => Color::Green,
            "failed" | "disconnected" => Color::Red,
            _ => Color::Yellow,
        };
        Line::from(vec![
            Span::styled(
                format!("{:<13}", status.name),
                Style::default().add_modifier(Modifier::BOLD),
            ),
            Span::styled(format!("{:<14}", status.connection), Style::default().fg(color)),
            Span::raw(format!(
                "negotiation {:<22} mic {:<22} contexts {}",
                status.negotiation, status.capture, status.open_contexts
            )),
            if status.speaking {
                Span::styled("  voice", Style::default().fg(Color::Cyan))
            } else {
                Span::raw("")
            },
        ])
    };
    let block = Block::default()
        .title(format!("Radio Comms Console  t={:.1}s", a.elapsed_ms as f32 / 1_000.0))
        .borders(Borders::ALL);
    frame.render_widget(Paragraph::new(vec![line(a), line(b)]).block(block), area);
}

fn draw_channels(
    frame: &mut ratatui::Frame<'_>,
    area: Rect,
    status: &StationStatus,
    app: &AppState,
    focused: bool,
) {
    let border = if focused {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    };
    let block = Block::default()
        .title(status.name.clone())
        .borders(Borders::ALL)
        .border_style(border);

    let header = Row::new(vec!["", "Ch", "Mon", "PTT", "Tx", "Rx", "Position"])
        .style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD));
    let flag = |on: bool| if on { "*" } else { "." };

    let rows = status.channels.iter().map(|row| {
        let selected = focused && row.channel == app.selected;
        let position = row
            .position
            .map(|[x, y, z]| format!("{x:+.2} {y:+.2} {z:+.2}"))
            .unwrap_or_else(|| "-".to_string());
        let mut table_row = Row::new(vec![
            Cell::from(if selected { ">" } else { "" }),
            Cell::from(row.channel.to_string()),
            Cell::from(flag(row.monitoring)),
            Cell::from(flag(row.transmitting)),
            Cell::from(flag(row.sending)),
            Cell::from(flag(row.receiving)),
            Cell::from(position),
        ]);
        if row.receiving {
            table_row = table_row.style(Style::default().fg(Color::Green));
        }
        if selected {
            table_row = table_row.style(Style::default().fg(Color::Yellow));
        }
        table_row
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(2),
            Constraint::Length(3),
            Constraint::Length(4),
            Constraint::Length(4),
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(18),
        ],
    )
    .header(header)
    .block(block)
    .column_spacing(1);

    frame.render_widget(table, area);
}

fn draw_logs(frame: &mut ratatui::Frame<'_>, area: Rect) {
    let lines: Vec<Line> = recent_logs(LOG_LINES).into_iter().map(Line::from).collect();
    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Log"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: Rect, app: &AppState) {
    let mut spans = vec![Span::raw(
        "Tab: station  Up/Down: channel  Space: PTT  m: monitor  t: mic tone  c: clip  q: quit",
    )];
    if let Some(message) = &app.message {
        spans.push(Span::styled(
            format!("   {message}"),
            Style::default().fg(Color::Green),
        ));
    }
    let paragraph = Paragraph::new(Line::from(spans))
        .block(Block::default().borders(Borders::ALL).title("Help"));
    frame.render_widget(paragraph, area);
}
