pub use anyhow::Error;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;

/// Like debug_assert, but bails instead of panicking.
///
/// Returning an error often allows us to give more context as to what we were trying to do, e.g.
/// which section / symbol we were processing, whereas a panic just gives us a function backtrace,
/// which is less useful.
#[macro_export]
macro_rules! debug_assert_bail {
    ($e:expr, $($rest:tt)*) => {
        if cfg!(debug_assertions) && !$e {
            anyhow::bail!($($rest)*);
        }
    };
}

/// The sink for recoverable diagnostics. Scanning pushes errors and warnings here and keeps
/// going, so that a single link invocation reports as many problems as possible. Fatal internal
/// invariant breaches don't come through here, they unwind as `anyhow` errors.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<String>,
    warnings: Vec<String>,

    /// Demotes `error_or_warn` to a warning (`--noinhibit-exec`).
    errors_are_warnings: bool,
}

impl Diagnostics {
    pub fn new(noinhibit_exec: bool) -> Self {
        Diagnostics {
            errors: Vec::new(),
            warnings: Vec::new(),
            errors_are_warnings: noinhibit_exec,
        }
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(target: "keel", "{message}");
        self.errors.push(message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(target: "keel", "{message}");
        self.warnings.push(message);
    }

    /// Reports an error that the user may downgrade to a warning.
    pub fn error_or_warn(&mut self, message: impl Into<String>) {
        if self.errors_are_warnings {
            self.warn(message);
        } else {
            self.error(message);
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}
