/// Domain-aware logging macros.
///
/// Each macro injects a `domain` field automatically so callers never need to
/// remember the string literal. The domains are: `sys` (lifecycle), `conn`
/// (sockets and datagrams), `pipe` (token flow), `rule` (rule distribution
/// and queries), `conf` (configuration).
///
/// # Usage
///
/// ```ignore
/// use crate::log_macros::*;
///
/// cn_info!(sys, ingress = %addr, "control node started");
/// cn_warn!(pipe, error = %e, "admission failed");
/// cn_debug!(rule, version = %v, "rule base promoted");
/// ```
///
/// The macros accept any tracing-compatible field syntax after the domain
/// identifier. The domain identifier is **not** a string — it is a bare
/// identifier that the macro converts to a `&str` literal.

/// Internal helper. Do not call directly; use `cn_error!` … `cn_trace!`.
#[doc(hidden)]
macro_rules! cn_log {
    ($level:ident, $domain:ident, $($field:tt)*) => {
        tracing::$level!(domain = stringify!($domain), $($field)*)
    };
}

/// Log at ERROR level with an automatic `domain` field.
macro_rules! cn_error {
    ($domain:ident, $($rest:tt)*) => {
        cn_log!(error, $domain, $($rest)*)
    };
}

/// Log at WARN level with an automatic `domain` field.
macro_rules! cn_warn {
    ($domain:ident, $($rest:tt)*) => {
        cn_log!(warn, $domain, $($rest)*)
    };
}

/// Log at INFO level with an automatic `domain` field.
macro_rules! cn_info {
    ($domain:ident, $($rest:tt)*) => {
        cn_log!(info, $domain, $($rest)*)
    };
}

/// Log at DEBUG level with an automatic `domain` field.
macro_rules! cn_debug {
    ($domain:ident, $($rest:tt)*) => {
        cn_log!(debug, $domain, $($rest)*)
    };
}

/// Log at TRACE level with an automatic `domain` field.
#[allow(unused_macros)]
macro_rules! cn_trace {
    ($domain:ident, $($rest:tt)*) => {
        cn_log!(trace, $domain, $($rest)*)
    };
}
