//! Runtime error values.

use orus_core::ErrorKind;

/// A runtime failure: an error kind, a message, and the source location
/// recovered from the chunk's line table for the faulting instruction.
///
/// Non-fatal errors are caught by an active exception frame (the message
/// string becomes the catch binding). Fatal errors (operand-stack or frame
/// exhaustion, corrupted bytecode) always halt.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    pub line: u32,
    pub column: u32,
    pub fatal: bool,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            message: message.into(),
            line: 0,
            column: 0,
            fatal: false,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    /// Fatal errors bypass exception frames.
    pub fn fatal(message: impl Into<String>) -> Self {
        let mut error = Self::new(ErrorKind::Runtime, message);
        error.fatal = true;
        error
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = line;
        self.column = column;
        self
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} error: {} [line {}:{}]",
            self.kind.label(),
            self.message,
            self.line,
            self.column
        )
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_location() {
        let error = RuntimeError::runtime("array index 5 out of bounds (len 1)").at(3, 14);
        assert_eq!(
            error.to_string(),
            "runtime error: array index 5 out of bounds (len 1) [line 3:14]"
        );
    }

    #[test]
    fn test_fatal_flag() {
        assert!(RuntimeError::fatal("call stack overflow").fatal);
        assert!(!RuntimeError::runtime("division by zero").fatal);
    }
}
