use std::borrow::Cow;

/// A status line for long-running steps, in the spirit of a terminal spinner:
/// a mutable one-line message while the step runs, finished off with a symbol
/// and a persisted summary.
pub struct Status {
    bar: indicatif::ProgressBar,
}

impl Status {
    pub fn spinner(message: impl Into<Cow<'static, str>>) -> Self {
        let bar = indicatif::ProgressBar::new_spinner();
        bar.enable_steady_tick(100);
        bar.set_message(message);
        Self { bar }
    }

    /// Prints a persisted `• header` line, used to announce a new
    /// environment or experiment.
    pub fn header(message: impl AsRef<str>) {
        println!("• {}", message.as_ref());
    }

    pub fn set(&self, message: impl Into<Cow<'static, str>>) {
        self.bar.set_message(message);
    }

    pub fn succeed(&self, message: impl AsRef<str>) {
        self.persist('✔', message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.persist('ℹ', message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.persist('⚠', message);
    }

    pub fn fail(&self, message: impl AsRef<str>) {
        self.persist('✖', message);
    }

    fn persist(&self, symbol: char, message: impl AsRef<str>) {
        self.bar.println(format!("{} {}", symbol, message.as_ref()));
        self.bar.finish_and_clear();
    }
}

impl Drop for Status {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}
