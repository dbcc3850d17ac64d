use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Elevate,
    Gate,
    Copy,
    Normalize,
    Records,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Resolve => "resolve",
            Stage::Elevate => "elevate",
            Stage::Gate => "gate",
            Stage::Copy => "copy",
            Stage::Normalize => "normalize",
            Stage::Records => "records",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// One progress or diagnostic message from a pipeline stage.
///
/// The core never writes to the console; whoever drives it decides how (and
/// whether) to show these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub stage: Stage,
    pub level: Level,
    pub message: String,
    pub path: Option<PathBuf>,
}

pub trait EventSink {
    fn emit(&mut self, event: Event);
}

impl Event {
    pub fn new(
        stage: Stage,
        level: Level,
        message: impl Into<String>,
        path: Option<&Path>,
    ) -> Self {
        Self {
            stage,
            level,
            message: message.into(),
            path: path.map(Path::to_path_buf),
        }
    }

    pub fn info(stage: Stage, message: impl Into<String>, path: Option<&Path>) -> Self {
        Self::new(stage, Level::Info, message, path)
    }

    pub fn warn(stage: Stage, message: impl Into<String>, path: Option<&Path>) -> Self {
        Self::new(stage, Level::Warn, message, path)
    }

    pub fn error(stage: Stage, message: impl Into<String>, path: Option<&Path>) -> Self {
        Self::new(stage, Level::Error, message, path)
    }
}

impl EventSink for Vec<Event> {
    fn emit(&mut self, event: Event) {
        self.push(event);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: Event) {}
}
