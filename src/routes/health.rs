use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    ok: bool,
    mode: &'static str,
    sessions: usize,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    Json(Health {
        ok: true,
        mode: state.mode.as_str(),
        sessions: state.dispatcher.registry().len(),
    })
}
