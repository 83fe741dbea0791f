use thiserror::Error;

/// The single error kind that flows through the handshake core.
///
/// Every layer either runs to completion or raises one of these. Layers never
/// attempt recovery: a parse failure, a timeout, or a peer-reported error all
/// collapse into an abort that unwinds the driver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShipError {
    /// A layer detected a protocol violation, a timeout, or a peer abort and
    /// is unwinding the connection. `layer` names the layer that raised it
    /// (`"cmi"`, `"csh"`, `"cshp"`, `"pin"`, `"data"`) for logging.
    #[error("{layer} aborted: {reason}")]
    Aborted { layer: &'static str, reason: String },

    /// The underlying transport failed to send or receive a frame.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ShipError {
    pub(crate) fn abort(layer: &'static str, reason: impl Into<String>) -> Self {
        ShipError::Aborted {
            layer,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ShipError>;
