pub mod auth;
pub mod builds;
pub mod helpers;
pub mod pipelines;
pub mod repositories;
pub mod stages;

use axum::Router;

use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(auth::router())
        .merge(pipelines::router())
        .merge(builds::router())
        .merge(stages::router())
        .merge(repositories::router())
}
