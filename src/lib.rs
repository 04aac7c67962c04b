//! Sensiflow image processor
//!
//! Inference worker for the sensiflow system: pulls frame-jobs from a Redis
//! queue, scores each frame against the object detector under a fixed
//! accelerator budget, and commits detections to PostgreSQL before
//! acknowledging the job.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod services;
