use axum::Router;
use tower_http::cors::CorsLayer;

use crate::routes::{backtests, health, schedules, tasks};
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .nest("/health", health::router())
        .nest("/api/tasks", tasks::router())
        .nest("/ws/tasks", tasks::ws_router())
        .nest("/api/schedules", schedules::router())
        .nest("/api/backtests", backtests::router())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
