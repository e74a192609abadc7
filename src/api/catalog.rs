use axum::extract::{Query, State};
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ApiError;
use crate::catalog::CatalogResponse;
use crate::AppServices;

#[derive(Deserialize)]
struct SourceQuery {
    source: String,
}

#[derive(Deserialize)]
struct SearchQuery {
    source: String,
    #[serde(default)]
    q: String,
    #[serde(default)]
    category: Option<String>,
}

#[derive(Deserialize)]
struct ClearQuery {
    #[serde(default)]
    source: Option<String>,
}

pub fn routes() -> Router<AppServices> {
    Router::new()
        .route("/catalog", get(get_catalog))
        .route("/catalog/search", get(search))
        .route("/catalog/cache", delete(clear_cache))
}

/// `GET /api/catalog?source={docker|official}`
async fn get_catalog(
    State(state): State<AppServices>,
    Query(query): Query<SourceQuery>,
) -> Result<Json<CatalogResponse>, ApiError> {
    Ok(Json(state.catalog.get_catalog(&query.source).await?))
}

/// `GET /api/catalog/search?source=&q=&category=`
async fn search(
    State(state): State<AppServices>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<CatalogResponse>, ApiError> {
    Ok(Json(
        state
            .catalog
            .search_catalog(&query.source, &query.q, query.category.as_deref())
            .await?,
    ))
}

/// `DELETE /api/catalog/cache`
async fn clear_cache(
    State(state): State<AppServices>,
    Query(query): Query<ClearQuery>,
) -> Result<Json<Value>, ApiError> {
    state.catalog.clear_cache(query.source.as_deref())?;
    let message = match query.source {
        Some(source) => format!("cache cleared for {source}"),
        None => "all catalog cache cleared".to_string(),
    };
    Ok(Json(json!({"success": true, "message": message})))
}
