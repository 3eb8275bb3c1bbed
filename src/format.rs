//! Human readable summaries of a [ConnectionContext] for logging. This is one way, there is no
//!  parsing counterpart.

use std::fmt::{Display, Formatter};

use crate::context::{ip_from_host_repr, ConnectionContext};

/// `<ip>:<port> <connection id> <INC|OUT>`
pub fn format_context(ctx: &ConnectionContext) -> String {
    ctx.to_string()
}

/// `<ip>:<port> <INC|OUT>`
pub fn format_context_short(ctx: &ConnectionContext) -> String {
    ShortContext(ctx).to_string()
}

fn direction(ctx: &ConnectionContext) -> &'static str {
    if ctx.is_incoming() { "INC" } else { "OUT" }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} {} {}", ip_from_host_repr(self.remote_ip()), self.remote_port(), self.connection_id(), direction(self))
    }
}

/// Display adapter for the short form, for use in format strings without allocating
pub struct ShortContext<'a>(pub &'a ConnectionContext);

impl Display for ShortContext<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} {}", ip_from_host_repr(self.0.remote_ip()), self.0.remote_port(), direction(self.0))
    }
}

/// Emits a `tracing` event prefixed with the connection's short form, e.g.
///  `log_cc!(Level::DEBUG, ctx, "received {} bytes", n)` logs `[127.0.0.1:8080 INC] received 3 bytes`.
#[macro_export]
macro_rules! log_cc {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {
        $crate::tracing::event!($level, "[{}] {}", $crate::format::ShortContext(&$ctx), format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! cc_trace {
    ($ctx:expr, $($arg:tt)+) => { $crate::log_cc!($crate::tracing::Level::TRACE, $ctx, $($arg)+) };
}

#[macro_export]
macro_rules! cc_debug {
    ($ctx:expr, $($arg:tt)+) => { $crate::log_cc!($crate::tracing::Level::DEBUG, $ctx, $($arg)+) };
}

#[macro_export]
macro_rules! cc_info {
    ($ctx:expr, $($arg:tt)+) => { $crate::log_cc!($crate::tracing::Level::INFO, $ctx, $($arg)+) };
}

#[macro_export]
macro_rules! cc_warn {
    ($ctx:expr, $($arg:tt)+) => { $crate::log_cc!($crate::tracing::Level::WARN, $ctx, $($arg)+) };
}

#[macro_export]
macro_rules! cc_error {
    ($ctx:expr, $($arg:tt)+) => { $crate::log_cc!($crate::tracing::Level::ERROR, $ctx, $($arg)+) };
}

/// Returns `$ret` from the enclosing function if `$cond` does not hold, logging the message at
///  error level with the connection's short form as prefix.
#[macro_export]
macro_rules! cc_check {
    ($cond:expr, $ctx:expr, $ret:expr, $($arg:tt)+) => {
        if !($cond) {
            $crate::cc_error!($ctx, $($arg)+);
            return $ret;
        }
    };
}
