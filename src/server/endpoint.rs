//! HTTP entry point of the tunnel.
//!
//! A single route accepts `?id=<session>&dir=<in|out>` on any method:
//! - `dir=in`: the request body is pumped to the target. The answer comes
//!   once the body stops: `200` when it ended cleanly, `409` when a newer
//!   `in` leg took over, `410` when the session closed, `500` on a failure.
//! - `dir=out`: the handler returns immediately with a streaming body that
//!   the session's target pump keeps writing to until the leg is retired.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Query, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderName, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use futures_util::{StreamExt, TryStreamExt};
use std::io;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::TunnelError;
use crate::protocol::{Direction, LegQuery};
use crate::pump::sink_stream;

use super::session::{LegEnd, LegStream, SessionTable};

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

#[derive(Clone)]
struct EndpointState {
    table: SessionTable,
    content_type: HeaderValue,
}

/// The tunnel HTTP endpoint, bound to one path
pub struct TunnelEndpoint {
    state: EndpointState,
    path: String,
}

impl TunnelEndpoint {
    pub fn new(table: SessionTable, path: &str, content_type: &str) -> Self {
        let content_type = HeaderValue::from_str(content_type).unwrap_or_else(|_| {
            warn!("invalid response content type {:?}, using octet-stream", content_type);
            HeaderValue::from_static("application/octet-stream")
        });
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        Self {
            state: EndpointState {
                table,
                content_type,
            },
            path,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.path, any(tunnel_handler))
            .layer(DefaultBodyLimit::disable())
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` fires, then close every session.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        let addr = listener.local_addr()?;
        info!("Tunnel endpoint listening on http://{}{}", addr, self.path);

        let table = self.state.table.clone();
        let router = self.router();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Shutting down tunnel endpoint, closing {} session(s)", table.len().await);
                table.shutdown().await;
            })
            .await
    }
}

async fn tunnel_handler(
    State(state): State<EndpointState>,
    Query(query): Query<LegQuery>,
    body: Body,
) -> Response {
    let LegQuery { id, dir } = query;
    info!(session = %id, dir = %dir, "leg request");

    match dir {
        Direction::In => {
            let stream = body.into_data_stream().map_err(io::Error::other).boxed();
            match state.table.bind_leg(&id, LegStream::In(stream)).await {
                Ok(leg) => match leg.finished().await {
                    Ok(LegEnd::Finished) => StatusCode::OK.into_response(),
                    Ok(LegEnd::Superseded) => {
                        (StatusCode::CONFLICT, "superseded by a newer in leg").into_response()
                    }
                    Err(e) => e.into_response(),
                },
                Err(e) => e.into_response(),
            }
        }
        Direction::Out => {
            let (sink, rx) = state.table.settings().pump.shared_channel();
            match state.table.bind_leg(&id, LegStream::Out(sink)).await {
                Ok(leg) => (
                    [
                        (CONTENT_TYPE, state.content_type.clone()),
                        (CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store")),
                        (X_ACCEL_BUFFERING, HeaderValue::from_static("no")),
                    ],
                    Body::from_stream(sink_stream(rx, leg.token())),
                )
                    .into_response(),
                Err(e) => e.into_response(),
            }
        }
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        let status = match &self {
            TunnelError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            TunnelError::TargetUnreachable { .. } => StatusCode::BAD_GATEWAY,
            TunnelError::SessionClosed(_) => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error!("{}", self);
        (status, self.to_string()).into_response()
    }
}
