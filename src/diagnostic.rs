//! Diagnostics carried by error-state async values and emitted through the
//! host context's sink.

use std::fmt;

/// Source coordinates attached to a diagnostic.
///
/// The host context never interprets this; producers fill in whatever
/// coordinates their front end tracks and sinks format it as they like.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
}

/// A decoded error message, optionally pinned to a location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub location: Option<Location>,
}

impl Diagnostic {
    /// Create a diagnostic from a bare message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: None,
        }
    }

    /// Attach a location to the diagnostic.
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => {
                let file = location.file.as_deref().unwrap_or("<unknown>");
                write!(
                    f,
                    "{}:{}:{}: {}",
                    file, location.line, location.column, self.message
                )
            }
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<&str> for Diagnostic {
    fn from(message: &str) -> Self {
        Diagnostic::new(message)
    }
}

impl From<String> for Diagnostic {
    fn from(message: String) -> Self {
        Diagnostic::new(message)
    }
}

/// Callback invoked for every diagnostic emitted through a host context.
///
/// Installed once at construction; must be safe to call from any thread.
pub type DiagnosticHandler = Box<dyn Fn(&Diagnostic) + Send + Sync>;
