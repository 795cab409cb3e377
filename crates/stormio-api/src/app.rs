use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Assemble the HTTP surface under the configured context path.
pub fn build_app(state: AppState, context_path: &str) -> Router {
    let api = Router::new()
        .route("/createAsset", post(handlers::create_asset))
        .route("/deleteAsset", post(handlers::destroy_asset))
        .route("/tasks/:id", get(handlers::retrieve_asset))
        .route("/resource/:id/status", get(handlers::resource_status))
        .route("/assetprovider/image", get(handlers::list_images))
        .route("/assetprovider/flavor", get(handlers::list_flavors))
        .route("/assetprovider/image/upload", post(handlers::upload_image))
        .with_state(state);

    let app = if context_path.is_empty() || context_path == "/" {
        api
    } else {
        Router::new().nest(context_path, api)
    };
    app.layer(TraceLayer::new_for_http())
}
