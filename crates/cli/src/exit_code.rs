// Consistent exit codes for the redmap CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/configuration error
//   10 = store not reachable
//   13 = store command timed out

use std::process;

use redmap_core::{ConfigError, MapError};

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    StoreDown = 10,
    Timeout = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(map_err) = cause.downcast_ref::<MapError>() {
                return Self::from_map_error(map_err);
            }
            if cause.downcast_ref::<ConfigError>().is_some() {
                return Self::Usage;
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused => Self::StoreDown,
                    std::io::ErrorKind::TimedOut => Self::Timeout,
                    _ => Self::Error,
                };
            }
        }
        Self::Error
    }

    pub fn from_map_error(err: &MapError) -> Self {
        match err {
            MapError::StoreUnavailable(_) => Self::StoreDown,
            MapError::Timeout { .. } => Self::Timeout,
            MapError::SubscriptionFailure { .. } => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}
