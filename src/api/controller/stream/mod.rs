//! Resource push stream over server-sent events.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::api::dto::stream_dto::NamespaceQuery;
use crate::app_state::AppState;
use crate::errors::AppError;

pub struct StreamController;

impl StreamController {
    /// `GET /stream/{kind}?namespace=`: the current summary first, then one
    /// message per change. The subscription ends when the client disconnects.
    pub async fn subscribe(
        State(state): State<AppState>,
        Path(kind): Path<String>,
        Query(query): Query<NamespaceQuery>,
    ) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
        let key = state.broker.hub().key(&kind, query.namespace.as_deref())?;

        let (tx, rx) = mpsc::channel(state.stream_buffer.max(1));
        let handle = state.broker.subscribe(key, tx);
        debug!("Stream {} opened for {}", handle.id, handle.key);

        let events = ReceiverStream::new(rx).filter_map(|event| async move {
            match serde_json::to_string(&event) {
                Ok(json) => Some(Ok::<_, Infallible>(Event::default().data(json))),
                Err(e) => {
                    warn!("Dropping unserializable stream event: {}", e);
                    None
                }
            }
        });

        Ok(Sse::new(events).keep_alive(KeepAlive::default()))
    }
}
