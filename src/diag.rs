use nix::errno::Errno;
use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fmt, io, result,
};

pub struct Error {
    error: String,
    errno: Option<i32>,
    backtrace: Backtrace,
}

impl Error {
    fn new(error: String, errno: Option<i32>) -> Self {
        Self {
            error,
            errno,
            backtrace: Backtrace::capture(),
        }
    }

    /// Build the error used by the interceptor to flag behavior it cannot
    /// model. The whole execution becomes uncacheable when one surfaces.
    ///
    /// # Arguments
    ///
    /// * `reason` - Human-readable description of what was observed.
    pub fn unsupported(reason: impl fmt::Display) -> Self {
        Self::new(
            format!("{}: {reason}", Errno::ECHILD),
            Some(Errno::ECHILD as i32),
        )
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.error
    }

    #[must_use]
    /// The raw errno carried by the error, when it came from a system call.
    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    #[must_use]
    /// Whether the error means "cannot cache this" rather than "failed".
    ///
    /// `ESRCH` is included: a tracee vanishing under a ptrace request is a
    /// benign race, not a tracer failure.
    pub fn is_unsupported(&self) -> bool {
        matches!(self.errno, Some(e) if e == Errno::ECHILD as i32 || e == Errno::ESRCH as i32)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if self.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\nBacktrace:\n{}", self.backtrace)
        } else {
            Ok(())
        }
    }
}

impl<E: fmt::Display + 'static> From<E> for Error {
    fn from(e: E) -> Error {
        let any = &e as &dyn Any;
        let errno = any
            .downcast_ref::<Errno>()
            .map(|errno| *errno as i32)
            .or_else(|| any.downcast_ref::<io::Error>().and_then(io::Error::raw_os_error));
        Error::new(e.to_string(), errno)
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Destination for engine diagnostics.
///
/// Components receive a sink explicitly instead of writing to a global
/// stream. `Silent` drops everything; `Log` forwards to `tracing`.
pub trait Sink: Sync {
    fn emit(&self, message: fmt::Arguments<'_>);
}

pub struct Silent;

impl Sink for Silent {
    fn emit(&self, _: fmt::Arguments<'_>) {}
}

pub struct Log;

impl Sink for Log {
    fn emit(&self, message: fmt::Arguments<'_>) {
        tracing::debug!(target: "memo", "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ctor::ctor;
    use std::sync::Mutex;

    #[ctor]
    fn init() {
        std::env::set_var("RUST_BACKTRACE", "1");
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl Sink for Collect {
        fn emit(&self, message: fmt::Arguments<'_>) {
            if let Ok(mut lines) = self.0.lock() {
                lines.push(message.to_string());
            }
        }
    }

    #[test]
    fn test_error_new() {
        let error = Error::new("Test error".to_string(), None);
        assert_eq!(error.error, "Test error");
        assert!(error.backtrace.status() == BacktraceStatus::Captured);
    }

    #[test]
    fn test_error_from() {
        let error: Error = "Test error".to_string().into();
        assert_eq!(error.error, "Test error");
        assert_eq!(error.errno(), None);
        assert!(error.backtrace.status() == BacktraceStatus::Captured);
    }

    #[test]
    fn test_error_from_errno() {
        let error = Error::from(Errno::ENOENT);
        assert_eq!(error.errno(), Some(libc::ENOENT));
        assert!(!error.is_unsupported());
    }

    #[test]
    fn test_error_from_io() {
        let error = Error::from(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(error.errno(), Some(libc::EACCES));
    }

    #[test]
    fn test_error_unsupported() {
        let error = Error::unsupported("socket");
        assert!(error.is_unsupported());
        assert!(error.message().contains("socket"));
        assert!(Error::from(Errno::ESRCH).is_unsupported());
    }

    #[test]
    fn test_error_debug() {
        let error = Error::new("Test error".to_string(), None);
        let debug_output = format!("{:?}", error);
        assert!(debug_output.contains("Test error"));
        assert!(debug_output.contains("Backtrace"));
    }

    #[test]
    fn test_result_err() {
        let result: Result<u32> = Err("Test error".to_string().into());
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().error, "Test error");
    }

    #[test]
    fn test_sinks() {
        let collect = Collect::default();
        collect.emit(format_args!("pid {}", 42));
        Silent.emit(format_args!("dropped"));
        Log.emit(format_args!("forwarded"));
        assert_eq!(*collect.0.lock().expect("lock"), vec!["pid 42".to_string()]);
    }
}
