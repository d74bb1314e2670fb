use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind};
use ratatui::layout::Rect;

use crate::core::{Action, Module, NotifyLevel};
use crate::infrastructure::runtime::{BridgeStats, RunContext};

pub const ANSWER: &str = "The answer is 42.";
pub const QUESTION: &str = "What do you get if you multiply six by nine?";
pub const BUTTON: &str = "What is the question?";

const HISTORY_LIMIT: usize = 8;

/// Shared handle injected into the guest entry point
pub type AppHandle = Rc<RefCell<App>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

impl From<NotifyLevel> for StatusLevel {
    fn from(level: NotifyLevel) -> Self {
        match level {
            NotifyLevel::Info => StatusLevel::Info,
            NotifyLevel::Warn => StatusLevel::Warn,
            NotifyLevel::Error => StatusLevel::Error,
        }
    }
}

#[derive(Debug)]
pub struct App {
    pub label: String,
    pub status: String,
    pub status_level: StatusLevel,
    pub history: VecDeque<String>,
    pub bridge: Option<BridgeStats>,
    pub guest_name: &'static str,
    /// Where the button was last drawn, for mouse hit-testing
    pub button_area: Option<Rect>,
}

impl Default for App {
    fn default() -> Self {
        Self {
            label: ANSWER.to_string(),
            status: "Press Enter to ask".to_string(),
            status_level: StatusLevel::Info,
            history: VecDeque::new(),
            bridge: None,
            guest_name: "local",
            button_area: None,
        }
    }
}

impl App {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(self) -> AppHandle {
        Rc::new(RefCell::new(self))
    }

    pub fn set_status(&mut self, message: impl Into<String>, level: StatusLevel) {
        self.status = message.into();
        self.status_level = level;
    }

    /// Append a line to the run history, dropping the oldest past the limit
    pub fn note(&mut self, line: impl Into<String>) {
        self.history.push_back(line.into());
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    fn button_hit(&self, column: u16, row: u16) -> bool {
        self.button_area.map_or(false, |area| {
            column >= area.x
                && column < area.x + area.width
                && row >= area.y
                && row < area.y + area.height
        })
    }
}

impl Module for App {
    fn handle_key(&mut self, key: KeyEvent) -> Action {
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            return Action::Quit;
        }
        match key.code {
            KeyCode::Enter | KeyCode::Char(' ') => Action::StartGuest,
            KeyCode::Char('c') => Action::CompleteRun,
            KeyCode::Char('q') | KeyCode::Esc => Action::Quit,
            KeyCode::Char('r') => {
                self.label = ANSWER.to_string();
                Action::Notify("Label reset".into(), NotifyLevel::Info)
            }
            _ => Action::None,
        }
    }

    fn handle_mouse(&mut self, mouse: MouseEvent) -> Action {
        match mouse.kind {
            MouseEventKind::Down(MouseButton::Left) if self.button_hit(mouse.column, mouse.row) => {
                Action::StartGuest
            }
            _ => Action::None,
        }
    }
}

/// Demo entry point: wait on the guest scheduler, then change the label.
///
/// `pause` is called from inside the guest so scheduler-bound timers are created
/// in the right context.
pub async fn ask_question<P, F>(ctx: RunContext<AppHandle>, pause: P) -> anyhow::Result<()>
where
    P: FnOnce() -> F,
    F: Future<Output = ()>,
{
    ctx.app.borrow_mut().note(format!("run {}: thinking", ctx.run));
    pause().await;
    {
        let mut app = ctx.app.borrow_mut();
        app.label = QUESTION.to_string();
        app.note(format!("run {}: asked", ctx.run));
    }
    ctx.completion.complete();
    Ok(())
}
