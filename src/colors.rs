use crossterm::style::Stylize;

/// Semantic color class of a cell.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Tone {
    Healthy,
    Transitional,
    Error,
    Warning,
}

/// How a column's cells are colorized, derived from its header.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ColumnRole {
    Status,
    Ready,
    Plain,
}

impl ColumnRole {
    pub fn from_header(header: &str) -> Self {
        match header.trim().to_ascii_uppercase().as_str() {
            "STATUS" => Self::Status,
            "READY" => Self::Ready,
            _ => Self::Plain,
        }
    }
}

/// Exact-match lookup against the status vocabulary.
pub fn status_tone(value: &str) -> Option<Tone> {
    match value {
        "Running" | "Ready" | "Active" | "Succeeded" | "Completed" => Some(Tone::Healthy),
        "Pending" | "ContainerCreating" | "PodInitializing" => Some(Tone::Transitional),
        "Failed" | "Error" | "CrashLoopBackOff" | "ImagePullBackOff" => Some(Tone::Error),
        "Warning" | "Unknown" => Some(Tone::Warning),
        _ => None,
    }
}

/// `a/b` is healthy when both sides match and transitional otherwise.
/// Anything that is not exactly two `/`-separated parts has no tone.
pub fn ready_tone(value: &str) -> Option<Tone> {
    let mut parts = value.split('/');
    let (Some(ready), Some(total), None) = (parts.next(), parts.next(), parts.next()) else {
        return None;
    };

    if ready == total {
        Some(Tone::Healthy)
    } else {
        Some(Tone::Transitional)
    }
}

pub fn tone_for(role: ColumnRole, value: &str) -> Option<Tone> {
    match role {
        ColumnRole::Status => status_tone(value),
        ColumnRole::Ready => ready_tone(value),
        ColumnRole::Plain => None,
    }
}

/// Cell decorator. A disabled palette returns the raw text untouched.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Palette {
    enabled: bool,
}

impl Palette {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn plain() -> Self {
        Self::new(false)
    }

    pub fn decorate(self, role: ColumnRole, text: &str) -> String {
        match tone_for(role, text) {
            Some(tone) if self.enabled => paint(tone, text),
            _ => text.to_string(),
        }
    }
}

fn paint(tone: Tone, text: &str) -> String {
    match tone {
        Tone::Healthy => text.green().to_string(),
        Tone::Transitional => text.yellow().to_string(),
        Tone::Error => text.red().bold().to_string(),
        Tone::Warning => text.dark_yellow().to_string(),
    }
}
