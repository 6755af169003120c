pub mod egress;
pub mod ingest;
pub mod stream_id;
