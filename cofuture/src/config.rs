//! Runtime configuration

/// Options for a [crate::Runtime]
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Stack size for coroutine threads, or platform default if `None`
    pub stack_size: Option<usize>,
    /// Prefix of coroutine thread names
    pub thread_name: String,
    /// Capture a full backtrace whenever a future is tracked for leaks
    pub capture_backtraces: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: None,
            thread_name: "coroutine".to_string(),
            capture_backtraces: false,
        }
    }
}

impl Config {
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    pub fn capture_backtraces(mut self, capture: bool) -> Self {
        self.capture_backtraces = capture;
        self
    }
}
