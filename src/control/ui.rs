use std::error::Error;
use std::io::stdout;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use crossbeam_channel::unbounded;
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
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, Wrap};

use crate::control::api::{self, DeviceStatus, HotplugEntry, HotplugLog, KindStatus};
use crate::device::{DeviceEvent, DeviceKind, DeviceRecord, media_devices};

const TICK_RATE: Duration = Duration::from_millis(250);
const LOG_CAPACITY: usize = 64;

#[derive(Default)]
struct AppState {
    status: Option<DeviceStatus>,
    events: Vec<HotplugEntry>,
    kind: usize,
    selected: usize,
    mode: Mode,
    last_update: Option<Instant>,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    #[default]
    Normal,
    Details,
}

impl AppState {
    fn current_kind(&self) -> Option<&KindStatus> {
        self.status.as_ref()?.kinds.get(self.kind)
    }

    fn current_device(&self) -> Option<&DeviceRecord> {
        self.current_kind()?.devices.get(self.selected)
    }

    fn clamp_selection(&mut self) {
        let len = self.current_kind().map(|k| k.devices.len()).unwrap_or(0);
        self.selected = self.selected.min(len.saturating_sub(1));
    }
}

/// Run the device and hotplug console over the process-wide device manager.
pub fn run() -> Result<(), Box<dyn Error>> {
    let manager = Arc::clone(media_devices());
    let log = HotplugLog::attach(&manager, LOG_CAPACITY);

    setup_terminal()?;

    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let (status_tx, status_rx) = unbounded();
    let poll_log = Arc::clone(&log);
    std::thread::spawn(move || {
        loop {
            let update = (api::get_status(&manager), poll_log.entries());
            if status_tx.send(update).is_err() {
                break;
            }
            std::thread::sleep(TICK_RATE);
        }
    });

    let mut app = AppState::default();

    let outcome = event_loop(&mut terminal, &mut app, &status_rx);
    restore_terminal()?;
    drop(log);
    outcome
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    app: &mut AppState,
    updates: &Receiver<(DeviceStatus, Vec<HotplugEntry>)>,
) -> Result<(), Box<dyn Error>> {
    loop {
        terminal.draw(|frame| draw(frame, app))?;

        if let Some((status, events)) = try_recv_latest(updates) {
            app.status = Some(status);
            app.events = events;
            app.last_update = Some(Instant::now());
            app.clamp_selection();
        }

        if event::poll(Duration::from_millis(10))? {
            if let CEvent::Key(key) = event::read()? {
                if handle_key(app, key) {
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

fn try_recv_latest<T>(rx: &Receiver<T>) -> Option<T> {
    let mut last = None;
    while let Ok(value) = rx.try_recv() {
        last = Some(value);
    }
    last
}

/// Returns true when the console should exit.
fn handle_key(app: &mut AppState, key: KeyEvent) -> bool {
    match app.mode {
        Mode::Normal => match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Tab | KeyCode::Right => {
                app.kind = (app.kind + 1) % DeviceKind::ALL.len();
                app.selected = 0;
            }
            KeyCode::BackTab | KeyCode::Left => {
                app.kind = (app.kind + DeviceKind::ALL.len() - 1) % DeviceKind::ALL.len();
                app.selected = 0;
            }
            KeyCode::Up => {
                app.selected = app.selected.saturating_sub(1);
            }
            KeyCode::Down => {
                app.selected += 1;
                app.clamp_selection();
            }
            KeyCode::Enter => {
                if app.current_device().is_some() {
                    app.mode = Mode::Details;
                }
            }
            _ => {}
        },
        Mode::Details => match key.code {
            KeyCode::Char('q') => return true,
            KeyCode::Esc | KeyCode::Enter => app.mode = Mode::Normal,
            _ => {}
        },
    }
    false
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &AppState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(10),
            Constraint::Length(3),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], app);
    draw_devices(frame, chunks[1], app);
    draw_events(frame, chunks[2], app);
    draw_footer(frame, chunks[3], app);

    if app.mode == Mode::Details {
        if let Some(device) = app.current_device() {
            draw_details(frame, device);
        }
    }
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: Rect, app: &AppState) {
    let block = Block::default().title("Media Devices").borders(Borders::ALL);

    let content = match &app.status {
        Some(status) => {
            let mut spans = vec![Span::raw(format!("Backend: {}    ", status.backend))];
            for (idx, kind) in status.kinds.iter().enumerate() {
                let label = format!(" {} ({}) ", kind.kind.label(), kind.devices.len());
                let style = if idx == app.kind {
                    Style::default().fg(Color::Black).bg(Color::Cyan)
                } else {
                    Style::default()
                };
                spans.push(Span::styled(label, style));
            }
            spans.push(Span::raw(format!("    Listeners: {}", status.listeners)));
            Paragraph::new(Line::from(spans))
        }
        None => Paragraph::new(Line::from(vec![Span::styled(
            "Enumerating devices...",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )])),
    };

    frame.render_widget(content.block(block), area);
}

fn draw_devices(frame: &mut ratatui::Frame<'_>, area: Rect, app: &AppState) {
    let Some(kind) = app.current_kind() else {
        let block = Block::default().title("Devices").borders(Borders::ALL);
        frame.render_widget(Paragraph::new("").block(block), area);
        return;
    };
    let block = Block::default()
        .title(format!("Devices: {}", kind.kind.label()))
        .borders(Borders::ALL);

    if let Some(err) = &kind.error {
        let text = Span::styled(err.clone(), Style::default().fg(Color::Red));
        frame.render_widget(Paragraph::new(Line::from(text)).block(block), area);
        return;
    }

    let header = Row::new(vec![
        Cell::from(""),
        Cell::from("Name"),
        Cell::from("Descriptor"),
        Cell::from("Default"),
        Cell::from("Formats"),
    ])
    .style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD));

    let default = kind.default.as_ref().map(|d| d.descriptor.as_str());
    let rows = kind.devices.iter().enumerate().map(|(idx, device)| {
        let indicator = if idx == app.selected { ">" } else { "" };
        let mut row = Row::new(vec![
            Cell::from(indicator),
            Cell::from(device.name.clone()),
            Cell::from(device.descriptor.clone()),
            Cell::from(if Some(device.descriptor.as_str()) == default { "Yes" } else { "" }),
            Cell::from(device.capabilities.len().to_string()),
        ]);
        if idx == app.selected {
            row = row.style(Style::default().fg(Color::Yellow));
        }
        row
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(2),
            Constraint::Percentage(40),
            Constraint::Percentage(40),
            Constraint::Length(8),
            Constraint::Length(8),
        ],
    )
    .header(header)
    .block(block)
    .column_spacing(2);

    frame.render_widget(table, area);
}

fn draw_events(frame: &mut ratatui::Frame<'_>, area: Rect, app: &AppState) {
    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = app
        .events
        .iter()
        .rev()
        .take(visible)
        .map(|entry| {
            let (tag, color) = match entry.event {
                DeviceEvent::Connected => ("+", Color::Green),
                DeviceEvent::Disconnected => ("-", Color::Red),
            };
            Line::from(vec![
                Span::styled(
                    format!("{:>12.3}s ", entry.timestamp_ns as f64 / 1e9),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(format!("{tag} "), Style::default().fg(color)),
                Span::raw(format!("{} ({})", entry.device, entry.device.kind.label())),
            ])
        })
        .collect();

    let paragraph =
        Paragraph::new(lines).block(Block::default().title("Hotplug").borders(Borders::ALL));
    frame.render_widget(paragraph, area);
}

fn draw_details(frame: &mut ratatui::Frame<'_>, device: &DeviceRecord) {
    let area = centered(frame.size(), 60, 50);
    let mut lines = vec![
        Line::from(format!("Name:       {}", device.name)),
        Line::from(format!("Descriptor: {}", device.descriptor)),
        Line::from(format!("Kind:       {}", device.kind.label())),
    ];
    if device.capabilities.is_empty() {
        lines.push(Line::from(Span::styled(
            "No advertised capture formats",
            Style::default().fg(Color::DarkGray),
        )));
    }
    for cap in &device.capabilities {
        lines.push(Line::from(format!(
            "  {}x{} @ {} fps  {:?}",
            cap.width, cap.height, cap.max_fps, cap.fourcc
        )));
    }

    let block = Block::default()
        .title("Device (Esc to close)")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));
    let paragraph = Paragraph::new(lines).block(block).wrap(Wrap { trim: false });

    frame.render_widget(Clear, area);
    frame.render_widget(paragraph, area);
}

fn centered(area: Rect, percent_x: u16, percent_y: u16) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: Rect, app: &AppState) {
    let info = "Tab/Left/Right: Kind  •  Up/Down: Select  •  Enter: Details  •  q: Quit";
    let mut spans = vec![Span::raw(info)];
    if let Some(updated) = app.last_update {
        let ago = updated.elapsed().as_secs_f32();
        spans.push(Span::styled(
            format!("    updated {:.1}s ago", ago),
            Style::default().fg(Color::DarkGray),
        ));
    }

    let paragraph = Paragraph::new(Line::from(spans))
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyModifiers;

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn app_with_devices(count: usize) -> AppState {
        let devices: Vec<DeviceRecord> = (0..count)
            .map(|i| {
                DeviceRecord::new(DeviceKind::AudioCapture, format!("Mic {i}"), format!("mic{i}"))
            })
            .collect();
        let kinds = DeviceKind::ALL
            .into_iter()
            .map(|kind| KindStatus {
                kind,
                devices: if kind == DeviceKind::AudioCapture {
                    devices.clone()
                } else {
                    Vec::new()
                },
                default: None,
                error: None,
            })
            .collect();
        AppState {
            status: Some(DeviceStatus {
                backend: "virtual",
                kinds,
                listeners: 0,
            }),
            ..AppState::default()
        }
    }

    #[test]
    fn selection_stays_within_the_current_kind() {
        let mut app = app_with_devices(2);
        handle_key(&mut app, key(KeyCode::Down));
        handle_key(&mut app, key(KeyCode::Down));
        assert_eq!(app.selected, 1);

        handle_key(&mut app, key(KeyCode::Tab));
        assert_eq!((app.kind, app.selected), (1, 0));
        handle_key(&mut app, key(KeyCode::Enter));
        assert_eq!(app.mode, Mode::Normal);

        handle_key(&mut app, key(KeyCode::BackTab));
        handle_key(&mut app, key(KeyCode::Enter));
        assert_eq!(app.mode, Mode::Details);
        assert!(!handle_key(&mut app, key(KeyCode::Esc)));
        assert!(handle_key(&mut app, key(KeyCode::Char('q'))));
    }

    #[test]
    fn latest_update_wins() {
        let (tx, rx) = unbounded();
        for i in 0..3 {
            tx.send(i).expect("send");
        }
        assert_eq!(try_recv_latest(&rx), Some(2));
        assert_eq!(try_recv_latest(&rx), None);
    }
}
