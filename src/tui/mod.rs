//! Terminal dashboard: a live view of the `ls` table.

use crate::config::Config;
use crate::error::Result;
use crate::git;
use crate::state::{FileStore, Status};
use crate::status::{build_entries, StatusEntry};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Paragraph, Row, Table};
use ratatui::Frame;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const REFRESH_INTERVAL: Duration = Duration::from_secs(2);
const INPUT_POLL: Duration = Duration::from_millis(250);

pub struct Dashboard {
    config: Arc<Config>,
    store: Arc<FileStore>,
    cwd: PathBuf,
    entries: Vec<StatusEntry>,
    last_error: Option<String>,
    last_refresh: Option<Instant>,
}

/// Run the dashboard until the user quits with `q`, Esc, or Ctrl-C.
pub async fn run(config: Arc<Config>, store: Arc<FileStore>, cwd: PathBuf) -> Result<()> {
    let mut terminal = ratatui::init();
    let mut app = Dashboard {
        config,
        store,
        cwd,
        entries: Vec::new(),
        last_error: None,
        last_refresh: None,
    };
    let result = app.run_loop(&mut terminal).await;
    ratatui::restore();
    result
}

impl Dashboard {
    async fn run_loop(&mut self, terminal: &mut ratatui::DefaultTerminal) -> Result<()> {
        loop {
            if self
                .last_refresh
                .is_none_or(|at| at.elapsed() >= REFRESH_INTERVAL)
            {
                self.refresh().await;
            }

            terminal.draw(|frame| self.draw(frame))?;

            if event::poll(INPUT_POLL)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    let ctrl_c = key.code == KeyCode::Char('c')
                        && key.modifiers.contains(KeyModifiers::CONTROL);
                    if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) || ctrl_c {
                        return Ok(());
                    }
                    if key.code == KeyCode::Char('r') {
                        self.refresh().await;
                    }
                }
            }
        }
    }

    async fn refresh(&mut self) {
        self.last_refresh = Some(Instant::now());

        let trees = match git::list_worktrees(&self.cwd) {
            Ok(trees) => trees,
            Err(e) => {
                self.last_error = Some(e.to_string());
                return;
            }
        };
        let state = match self.store.with_lock(|| self.store.load()).await {
            Ok(state) => state,
            Err(e) => {
                self.last_error = Some(e.to_string());
                return;
            }
        };

        self.last_error = None;
        self.entries = build_entries(&trees, &self.config, &state);
    }

    fn draw(&self, frame: &mut Frame) {
        let [table_area, footer_area] =
            Layout::vertical([Constraint::Min(3), Constraint::Length(1)]).areas(frame.area());

        self.draw_table(frame, table_area);
        self.draw_footer(frame, footer_area);
    }

    fn draw_table(&self, frame: &mut Frame, area: Rect) {
        let header = Row::new(["WORKTREE", "SERVICE", "PORT", "STATUS", "PID", "URL"])
            .style(Style::default().add_modifier(Modifier::BOLD));

        let rows: Vec<Row> = self
            .entries
            .iter()
            .map(|e| {
                let status_style = match e.status {
                    Status::Running => Style::default().fg(Color::Green),
                    Status::Stopped => Style::default().fg(Color::DarkGray),
                };
                Row::new(vec![
                    e.worktree.clone(),
                    e.service.clone(),
                    if e.port > 0 { e.port.to_string() } else { "—".to_string() },
                    e.status.to_string(),
                    if e.pid > 0 { e.pid.to_string() } else { "—".to_string() },
                    e.url.clone().or_else(|| e.direct_url.clone()).unwrap_or_default(),
                ])
                .style(status_style)
            })
            .collect();

        let widths = [
            Constraint::Fill(2),
            Constraint::Length(10),
            Constraint::Length(6),
            Constraint::Length(8),
            Constraint::Length(8),
            Constraint::Fill(3),
        ];
        let table = Table::new(rows, widths).header(header).block(
            Block::default()
                .borders(Borders::ALL)
                .title(" portree dash "),
        );
        frame.render_widget(table, area);
    }

    fn draw_footer(&self, frame: &mut Frame, area: Rect) {
        let line = match &self.last_error {
            Some(err) => Line::styled(format!(" error: {err}"), Style::default().fg(Color::Red)),
            None => Line::styled(
                " q quit · r refresh · refreshes every 2s",
                Style::default().fg(Color::DarkGray),
            ),
        };
        frame.render_widget(Paragraph::new(line), area);
    }
}
