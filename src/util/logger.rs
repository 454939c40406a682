//! This module provides a built-in logger implementation.
//!
//! The built-in logger implementation uses the `env_logger` crate.  It is enabled by the Cargo
//! feature "builtin_env_logger" which is enabled by default.  When enabled, it is initialized the
//! first time a database is opened and shows logs of levels WARN or lower (the lower, the more
//! important).
//!
//! This provides a convenient out-of-the-box experience for embedders so that they can see
//! recovery warnings and growth diagnostics without configuration, and can adjust log levels from
//! environment variables.  A hosting process that already routes the `log` facade to its own
//! backend can disable the Cargo feature "builtin_env_logger" and register its own
//! implementation with the `log` crate instead.

/// Attempt to init an env_logger for the store.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                // By default, show warnings only.
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "warn"),
            );

            match result {
                Ok(()) => {
                    debug!("pstore initialized the logger.");
                }
                Err(e) => {
                    // `log::SetLoggerError` is only raised when a logger has already been
                    // installed, typically by the hosting process.
                    debug!("pstore failed to initialize the built-in env_logger: {e}");
                }
            }
        } else {
            debug!("pstore didn't initialize the built-in env_logger.  The Cargo feature \"builtin_env_logger\" is not enabled.");
        }
    }
}
