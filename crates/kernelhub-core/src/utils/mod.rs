pub mod tracing;
