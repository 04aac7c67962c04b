use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{inference::InferenceEngine, queue::RedisFrameSource};

/// Shared state for the ops endpoints.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<RedisFrameSource>,
    pub engine: Arc<InferenceEngine>,
}

impl AppState {
    pub fn new(db: PgPool, queue: Arc<RedisFrameSource>, engine: Arc<InferenceEngine>) -> Self {
        Self { db, queue, engine }
    }
}
