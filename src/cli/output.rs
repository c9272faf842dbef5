use colored::Colorize;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Success,
    Warning,
    Error,
}

/// Result of a CLI command, rendered either as colored text or as JSON.
#[derive(Debug, Clone)]
pub struct Output {
    pub kind: OutputKind,
    pub text: String,
    pub data: Option<Value>,
}

impl Output {
    pub fn success<S: Into<String>>(text: S) -> Self {
        Self {
            kind: OutputKind::Success,
            text: text.into(),
            data: None,
        }
    }

    pub fn warning<S: Into<String>>(text: S) -> Self {
        Self {
            kind: OutputKind::Warning,
            text: text.into(),
            data: None,
        }
    }

    pub fn error<S: Into<String>>(text: S) -> Self {
        Self {
            kind: OutputKind::Error,
            text: text.into(),
            data: None,
        }
    }

    /// Attaches the structured payload printed in `--json` mode.
    pub fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == OutputKind::Error
    }

    pub fn render(&self, json: bool) -> String {
        if json {
            let payload = self.data.clone().unwrap_or_else(|| {
                serde_json::json!({
                    "status": self.status(),
                    "message": self.text,
                })
            });
            return serde_json::to_string_pretty(&payload).unwrap_or_else(|_| self.text.clone());
        }

        match self.kind {
            OutputKind::Success => self.text.clone(),
            OutputKind::Warning => format!("{} {}", "warning:".yellow().bold(), self.text),
            OutputKind::Error => format!("{} {}", "error:".red().bold(), self.text),
        }
    }

    fn status(&self) -> &'static str {
        match self.kind {
            OutputKind::Success => "ok",
            OutputKind::Warning => "warning",
            OutputKind::Error => "error",
        }
    }
}
