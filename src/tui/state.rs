use crate::engine::EngineCommand;
use crate::model::{ConsoleEvent, MigrationState, Record, RecordId, Stage};
use std::collections::{BTreeSet, VecDeque};

pub const TAB_RECORDS: usize = 0;
pub const TAB_FAILED: usize = 1;
pub const TAB_ENGINE: usize = 2;
pub const TAB_HELP: usize = 3;
pub const TAB_COUNT: usize = 4;

const ACTIVITY_CAP: usize = 200;

pub struct UiState {
    pub tab: usize,
    pub info: String,

    // Records tab
    pub run_idx: usize,
    pub cursor: usize,
    pub selected: BTreeSet<RecordId>,
    pub migration_running: bool,
    pub migrating_record: Option<RecordId>,

    // Failed tab
    pub failed_stage: Stage,
    pub failed_scroll: usize,

    // Engine tab
    pub engine_configured: bool,
    pub pending_command: Option<EngineCommand>,

    /// Most-recent-first console activity (stage reports, command outcomes).
    pub activity: VecDeque<String>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: TAB_RECORDS,
            info: String::new(),
            run_idx: 0,
            cursor: 0,
            selected: BTreeSet::new(),
            migration_running: false,
            migrating_record: None,
            failed_stage: Stage::Validate,
            failed_scroll: 0,
            engine_configured: false,
            pending_command: None,
            activity: VecDeque::new(),
        }
    }
}

impl UiState {
    pub fn note(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        self.info = msg.clone();
        self.activity.push_front(msg);
        self.activity.truncate(ACTIVITY_CAP);
    }

    pub fn next_tab(&mut self) {
        self.tab = (self.tab + 1) % TAB_COUNT;
    }

    /// Keep indexes in range after runs or records changed underneath.
    pub fn clamp(&mut self, run_count: usize, record_count: usize) {
        self.run_idx = self.run_idx.min(run_count.saturating_sub(1));
        self.cursor = self.cursor.min(record_count.saturating_sub(1));
    }

    pub fn switch_run(&mut self, delta: isize, run_count: usize) {
        if run_count == 0 {
            return;
        }
        let next = (self.run_idx as isize + delta).clamp(0, run_count as isize - 1) as usize;
        if next != self.run_idx {
            self.run_idx = next;
            self.cursor = 0;
            self.selected.clear();
        }
    }

    /// Jump to the newest run, used right after one was created.
    pub fn focus_last_run(&mut self, run_count: usize) {
        if run_count > 0 && self.run_idx != run_count - 1 {
            self.run_idx = run_count - 1;
            self.cursor = 0;
            self.selected.clear();
        }
    }

    /// A run disappeared, so indexes may now point at a different one.
    pub fn forget_selection(&mut self) {
        self.cursor = 0;
        self.selected.clear();
    }

    pub fn move_cursor(&mut self, delta: isize, len: usize) {
        if len == 0 {
            self.cursor = 0;
            return;
        }
        self.cursor = (self.cursor as isize + delta).clamp(0, len as isize - 1) as usize;
    }

    pub fn toggle_at_cursor(&mut self, records: &[Record]) {
        if let Some(r) = records.get(self.cursor) {
            if !self.selected.remove(&r.id) {
                self.selected.insert(r.id.clone());
            }
        }
    }

    /// Select every record of the run, or clear the selection if all are selected.
    pub fn toggle_all(&mut self, records: &[Record]) {
        if !records.is_empty() && records.iter().all(|r| self.selected.contains(&r.id)) {
            self.selected.clear();
        } else {
            self.selected = records.iter().map(|r| r.id.clone()).collect();
        }
    }

    /// Ids the next stage action applies to, in run order. An empty selection
    /// means the record under the cursor.
    pub fn action_selection(&self, records: &[Record]) -> Vec<RecordId> {
        if self.selected.is_empty() {
            return records
                .get(self.cursor)
                .map(|r| vec![r.id.clone()])
                .unwrap_or_default();
        }
        records
            .iter()
            .filter(|r| self.selected.contains(&r.id))
            .map(|r| r.id.clone())
            .collect()
    }

    /// An engine command may be sent only when none is outstanding.
    pub fn command_allowed(&self, dispatcher_busy: bool) -> bool {
        self.engine_configured && self.pending_command.is_none() && !dispatcher_busy
    }

    pub fn apply_event(&mut self, ev: ConsoleEvent) {
        match ev {
            ConsoleEvent::StageStarted { stage, records, .. } => {
                if stage == Stage::Migrate {
                    self.migration_running = true;
                }
                self.info = format!("{stage}: {records} selected");
            }
            ConsoleEvent::RecordMigrating { record_id, .. } => {
                self.info = format!("Migrating {record_id}…");
                self.migrating_record = Some(record_id);
            }
            ConsoleEvent::RecordMigrated {
                record_id, state, ..
            } => {
                if self.migrating_record.as_deref() == Some(record_id.as_str()) {
                    self.migrating_record = None;
                }
                let outcome = if state == MigrationState::Success {
                    "migrated"
                } else {
                    "migration failed"
                };
                self.note(format!("{record_id}: {outcome}"));
            }
            ConsoleEvent::StageFinished(report) => {
                self.selected.clear();
                self.note(report.to_message());
            }
            ConsoleEvent::MigrationEnded { .. } => {
                self.migration_running = false;
                self.migrating_record = None;
            }
            ConsoleEvent::CommandFinished { command, result } => {
                if self.pending_command == Some(command) {
                    self.pending_command = None;
                }
                match result {
                    Ok(msg) => self.note(msg),
                    Err(e) => self.note(format!("{command} failed: {e}")),
                }
            }
            ConsoleEvent::Info(msg) => self.note(msg),
        }
    }
}
