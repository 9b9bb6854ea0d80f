use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::limits::MAX_REQUEST_BYTES;
use crate::protocol::{Response, handle_line};

/// Serve one client until it hangs up. Requests on a connection are handled
/// in order.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> Result<(), LinesCodecError> {
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_REQUEST_BYTES));

    while let Some(frame) = lines.next().await {
        let response = match frame {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&engine, &line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("request exceeded {MAX_REQUEST_BYTES} bytes");
                Response::bad_request("request too large")
            }
            Err(e) => return Err(e),
        };
        debug!(status = response.status, "request handled");
        let encoded = serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"status":500}"#.to_string());
        lines.send(encoded).await?;
    }
    Ok(())
}
