//! Helper macros for logging (console printing).

/// Log TRACE message.
#[macro_export]
macro_rules! pf_trace {
    ($($arg:tt)*) => {
        log::trace!($($arg)*)
    };
}

/// Log DEBUG message.
#[macro_export]
macro_rules! pf_debug {
    ($($arg:tt)*) => {
        log::debug!($($arg)*)
    };
}

/// Log INFO message.
#[macro_export]
macro_rules! pf_info {
    ($($arg:tt)*) => {
        log::info!($($arg)*)
    };
}

/// Log WARN message.
#[macro_export]
macro_rules! pf_warn {
    ($($arg:tt)*) => {
        log::warn!($($arg)*)
    };
}

/// Log ERROR message.
#[macro_export]
macro_rules! pf_error {
    ($($arg:tt)*) => {
        log::error!($($arg)*)
    };
}

/// Log an error string to logger and then return an `Err(EnsembleError)`
/// containing the string.
#[macro_export]
macro_rules! logged_err {
    ($($arg:tt)*) => {{
        $crate::pf_error!($($arg)*);
        Err($crate::EnsembleError(format!($($arg)*)))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::EnsembleError;

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!("interesting message"),
            Err::<(), EnsembleError>(EnsembleError(
                "interesting message".into()
            ))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!("got {} to print", 777),
            Err::<(), EnsembleError>(EnsembleError("got 777 to print".into()))
        );
    }
}
