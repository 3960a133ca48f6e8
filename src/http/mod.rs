//! HTTP façade (§6, ambient component H): the axum router a controller
//! process actually drives. Generalizes `adamtc007-ob-poc`'s
//! `create_voice_router` shape — `State<Arc<T>>` extractors over a thin
//! handler layer, routes merged into one `Router` — onto the lifecycle
//! controller's five operations.

mod dto;
mod routes;

pub use routes::{build_router, AppState};
