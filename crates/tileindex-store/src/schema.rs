use arrow_schema::{DataType, Field, Schema};
use std::sync::Arc;

pub fn build_registry_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("minx", DataType::Float64, false),
        Field::new("miny", DataType::Float64, false),
        Field::new("maxx", DataType::Float64, false),
        Field::new("maxy", DataType::Float64, false),
        Field::new("source_kind", DataType::Utf8, false),
        Field::new("raster_path", DataType::Utf8, true),
        Field::new("gid", DataType::Int64, true),
        Field::new("source_path", DataType::Utf8, true),
        Field::new("image_path", DataType::Utf8, true),
        Field::new("status", DataType::Utf8, false),
        Field::new("embedder_backend", DataType::Utf8, true),
        Field::new("embedder_model", DataType::Utf8, true),
        Field::new("updated_at", DataType::Int64, false),
    ]))
}

pub fn build_vector_schema(dim: i32) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("tile_id", DataType::Utf8, false),
        Field::new("vector", DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), dim), true),
        Field::new("image_path", DataType::Utf8, true),
        Field::new("minx", DataType::Float64, false),
        Field::new("miny", DataType::Float64, false),
        Field::new("maxx", DataType::Float64, false),
        Field::new("maxy", DataType::Float64, false),
        Field::new("gid", DataType::Int64, true),
        Field::new("raster_path", DataType::Utf8, true),
        Field::new("embedder_backend", DataType::Utf8, true),
        Field::new("embedder_model", DataType::Utf8, true),
        Field::new("run_id", DataType::Utf8, true),
        Field::new("indexed_at", DataType::Int64, false),
    ]))
}

/// `state` is `ready` or `leased`; `lease_until` is Unix millis.
pub fn build_queue_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("message_id", DataType::Utf8, false),
        Field::new("queue", DataType::Utf8, false),
        Field::new("body", DataType::Utf8, false),
        Field::new("state", DataType::Utf8, false),
        Field::new("lease_token", DataType::Utf8, true),
        Field::new("lease_until", DataType::Int64, false),
        Field::new("deliveries", DataType::Int64, false),
        Field::new("enqueued_at", DataType::Int64, false),
    ]))
}
