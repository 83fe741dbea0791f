//! Connection driver: sequences CMI, CSH, CSHP and PIN in order over one
//! transport, then hands back a `DataChannel`. On any layer's abort, closes
//! the transport and propagates the error; on success the transport is
//! left open and owned by the returned channel.

use tracing::{error, info};

use crate::config::HandshakeConfig;
use crate::data::DataChannel;
use crate::error::ShipError;
use crate::transport::{Transport, CLOSE_NORMAL};
use crate::trust::{TrustListener, TrustManager};
use crate::{cmi, csh, cshp, pin};

async fn run_layers<L: TrustListener + 'static>(
    transport: &mut dyn Transport,
    trust_manager: &TrustManager<L>,
    remote_ski: &str,
    config: &HandshakeConfig,
    is_client: bool,
) -> Result<(), ShipError> {
    if is_client {
        cmi::run_client(transport, config).await?;
    } else {
        cmi::run_server(transport, config).await?;
    }
    info!(remote_ski, "CMI finished");

    csh::run(transport, trust_manager, remote_ski, config).await?;
    info!(remote_ski, "CSH finished");

    let version = if is_client {
        cshp::run_client(transport, config).await?
    } else {
        cshp::run_server(transport, config).await?
    };
    info!(remote_ski, version.major, version.minor, "CSHP finished");

    pin::run(transport, remote_ski).await?;
    info!(remote_ski, "PIN finished");

    Ok(())
}

/// Runs the client side of the handshake: CMI → CSH → CSHP → PIN. On
/// success returns a `DataChannel` tagged with `protocol_id`; on failure
/// closes `transport` and propagates the abort.
pub async fn run_client<'t, L: TrustListener + 'static>(
    transport: &'t mut dyn Transport,
    trust_manager: &TrustManager<L>,
    remote_ski: &str,
    protocol_id: impl Into<String>,
    config: &HandshakeConfig,
) -> Result<DataChannel<'t>, ShipError> {
    match run_layers(transport, trust_manager, remote_ski, config, true).await {
        Ok(()) => Ok(DataChannel::new(transport, protocol_id, remote_ski)),
        Err(e) => {
            error!(remote_ski, error = %e, "closing connection due to SHIP connection issue");
            let _ = transport.close(CLOSE_NORMAL, "handshake aborted").await;
            Err(e)
        }
    }
}

/// Runs the server side of the handshake: CMI → CSH → CSHP → PIN. Same
/// success/failure contract as [`run_client`].
///
/// Routing only `/ship/`-path connections here is the caller's
/// responsibility — this driver does not open listening sockets or inspect
/// the original request path.
pub async fn run_server<'t, L: TrustListener + 'static>(
    transport: &'t mut dyn Transport,
    trust_manager: &TrustManager<L>,
    remote_ski: &str,
    protocol_id: impl Into<String>,
    config: &HandshakeConfig,
) -> Result<DataChannel<'t>, ShipError> {
    match run_layers(transport, trust_manager, remote_ski, config, false).await {
        Ok(()) => Ok(DataChannel::new(transport, protocol_id, remote_ski)),
        Err(e) => {
            error!(remote_ski, error = %e, "closing connection due to SHIP connection issue");
            let _ = transport.close(CLOSE_NORMAL, "handshake aborted").await;
            Err(e)
        }
    }
}
