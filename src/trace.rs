//! Feature-gated tracing macros for zero-overhead instrumentation.
//!
//! With the `tracing` feature enabled this module re-exports the
//! tracing crate's macros; without it every macro compiles to a no-op
//! and spans degrade to unit guards.

#[cfg(feature = "tracing")]
pub use tracing::{
    debug, debug_span, error, info, info_span, trace, trace_span, warn, Span,
};

#[cfg(not(feature = "tracing"))]
mod noop {
    /// Span stand-in when tracing is compiled out.
    pub struct Span;

    impl Span {
        pub fn none() -> Self {
            Span
        }

        pub fn entered(self) -> SpanGuard {
            SpanGuard
        }

        pub fn enter(&self) -> SpanGuard {
            SpanGuard
        }
    }

    pub struct SpanGuard;

    impl Drop for SpanGuard {
        fn drop(&mut self) {}
    }

    #[macro_export]
    macro_rules! trace {
        ($($tt:tt)*) => {};
    }

    #[macro_export]
    macro_rules! debug {
        ($($tt:tt)*) => {};
    }

    #[macro_export]
    macro_rules! info {
        ($($tt:tt)*) => {};
    }

    #[macro_export]
    macro_rules! warn {
        ($($tt:tt)*) => {};
    }

    #[macro_export]
    macro_rules! error {
        ($($tt:tt)*) => {};
    }

    #[macro_export]
    macro_rules! trace_span {
        ($($tt:tt)*) => {
            $crate::trace::Span::none()
        };
    }

    #[macro_export]
    macro_rules! debug_span {
        ($($tt:tt)*) => {
            $crate::trace::Span::none()
        };
    }

    #[macro_export]
    macro_rules! info_span {
        ($($tt:tt)*) => {
            $crate::trace::Span::none()
        };
    }

    pub use crate::{debug, debug_span, error, info, info_span, trace, trace_span, warn};
}

#[cfg(not(feature = "tracing"))]
pub use noop::*;

/// Initialize a tracing subscriber for tests and development. Safe to
/// call more than once; later calls are ignored.
#[cfg(feature = "tracing")]
pub fn init_subscriber() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_ansi(false),
        )
        .with(filter)
        .try_init()
        .ok();
}

#[cfg(not(feature = "tracing"))]
pub fn init_subscriber() {}
