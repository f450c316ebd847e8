//! Remote typing indicator.

/// Whether the partner is currently typing. Last write wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct TypingTracker {
    typing: bool,
}

impl TypingTracker {
    #[must_use]
    pub const fn new() -> Self {
        Self { typing: false }
    }

    /// The partner started typing.
    pub const fn set_typing(&mut self) {
        self.typing = true;
    }

    /// The partner stopped typing.
    pub const fn set_stopped(&mut self) {
        self.typing = false;
    }

    /// Forget any indicator, e.g. at a session boundary.
    pub const fn reset(&mut self) {
        self.typing = false;
    }

    #[must_use]
    pub const fn is_typing(&self) -> bool {
        self.typing
    }
}
