//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for Ensemble.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EnsembleError(pub String);

impl EnsembleError {
    /// Creates an error from anything printable.
    pub fn msg(m: impl ToString) -> Self {
        EnsembleError(m.to_string())
    }
}

impl fmt::Display for EnsembleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for EnsembleError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `EnsembleError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for EnsembleError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                EnsembleError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
