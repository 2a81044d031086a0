//! HTTP control surface beside the game transport: track collection,
//! leaderboards, room listing and health.
//!
//! Storage failures surface here as 4xx/5xx with a JSON body; nothing on
//! this path is ever awaited by a room tick.

use crate::leaderboard::Leaderboard;
use crate::manager::RoomManager;
use crate::storage::{JsonStore, StorageError, TrackStore};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct HttpState {
    pub manager: Arc<RoomManager>,
    pub tracks: Arc<TrackStore>,
    pub store: Arc<JsonStore>,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, json!({ "error": message }))
}

async fn handle_request(
    req: Request<Incoming>,
    state: HttpState,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => json_response(
            StatusCode::OK,
            json!({
                "status": "ok",
                "rooms": state.manager.room_count().await,
            }),
        ),

        (&Method::GET, ["rooms"]) => {
            let rooms = state.manager.room_summaries().await;
            json_response(StatusCode::OK, json!(rooms))
        }

        (&Method::GET, ["tracks"]) => {
            let summaries: Vec<_> = state
                .tracks
                .list()
                .await
                .iter()
                .map(|t| crate::gateway::track_summary(t))
                .collect();
            json_response(StatusCode::OK, json!(summaries))
        }

        (&Method::GET, ["tracks", id]) => match state.tracks.get(id).await {
            Some(track) => json_response(StatusCode::OK, json!(&*track)),
            None => error_response(StatusCode::NOT_FOUND, "track not found"),
        },

        (&Method::POST, ["tracks"]) => {
            let body = req.into_body().collect().await?.to_bytes();
            handle_track_upload(&state, &body).await
        }

        (&Method::DELETE, ["tracks", id]) => match state.tracks.delete(id).await {
            Ok(true) => Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(Full::new(Bytes::new()))
                .unwrap(),
            Ok(false) => error_response(StatusCode::NOT_FOUND, "track not found"),
            Err(StorageError::Protected) => {
                error_response(StatusCode::FORBIDDEN, "default tracks cannot be deleted")
            }
            Err(e) => {
                error!("track delete failed: {}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
            }
        },

        (&Method::GET, ["leaderboards", track_id]) => {
            match state
                .store
                .read::<Leaderboard>("leaderboards", track_id)
                .await
            {
                Ok(board) => json_response(StatusCode::OK, json!(board.unwrap_or_default())),
                Err(StorageError::InvalidKey(_)) => {
                    error_response(StatusCode::BAD_REQUEST, "invalid track id")
                }
                Err(e) => {
                    error!("leaderboard read failed: {}", e);
                    error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
                }
            }
        }

        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn handle_track_upload(state: &HttpState, body: &[u8]) -> Response<Full<Bytes>> {
    let track: gridrush_core::Track = match serde_json::from_slice(body) {
        Ok(track) => track,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({ "error": "malformed track", "errors": [e.to_string()] }),
            );
        }
    };
    if state.tracks.is_protected(&track.id) {
        return error_response(StatusCode::FORBIDDEN, "default tracks cannot be replaced");
    }
    match state.tracks.insert(track).await {
        Ok(()) => json_response(StatusCode::CREATED, json!({ "status": "created" })),
        Err(StorageError::Track(e)) => json_response(
            StatusCode::BAD_REQUEST,
            json!({ "error": "invalid track", "errors": [e.to_string()] }),
        ),
        Err(e) => {
            error!("track upload failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage failure")
        }
    }
}

pub async fn run_http_server(
    bind_addr: String,
    state: HttpState,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("control surface listening on {}", bind_addr);

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("failed to accept http connection: {}", e);
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!("error serving http connection: {}", err);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use gridrush_core::Track;
    use tokio::sync::mpsc;

    async fn test_state(dir: &std::path::Path) -> HttpState {
        let tracks = Arc::new(
            TrackStore::open(dir.to_path_buf(), vec![Track::default_speedway()])
                .await
                .unwrap(),
        );
        let store = Arc::new(JsonStore::new(dir.to_path_buf()));
        let (lap_tx, lap_rx) = mpsc::unbounded_channel();
        Box::leak(Box::new(lap_rx));
        let (replay_tx, replay_rx) = mpsc::unbounded_channel();
        Box::leak(Box::new(replay_rx));
        let manager = RoomManager::new(
            Arc::clone(&tracks),
            ServerConfig::default().game,
            lap_tx,
            replay_tx,
        );
        HttpState {
            manager,
            tracks,
            store,
        }
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_track_upload_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;

        let mut track = Track::default_speedway();
        track.id = "uploaded-1".to_string();
        let body = serde_json::to_vec(&track).unwrap();

        let response = handle_track_upload(&state, &body).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(state.tracks.get("uploaded-1").await.is_some());
    }

    #[tokio::test]
    async fn test_invalid_track_upload_carries_errors() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;

        let mut track = Track::default_speedway();
        track.id = "broken-1".to_string();
        track
            .elements
            .retain(|e| e.kind != gridrush_core::ElementKind::Finish);
        let body = serde_json::to_vec(&track).unwrap();

        let response = handle_track_upload(&state, &body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].is_string());
        assert!(json["errors"].is_array());
    }

    #[tokio::test]
    async fn test_protected_track_upload_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path()).await;

        let track = Track::default_speedway();
        let body = serde_json::to_vec(&track).unwrap();
        let response = handle_track_upload(&state, &body).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
