// Reading model and validation
pub mod reading;

// Coordinate transformation (geodetic → plant frame)
pub mod transform;

// Zone containment, rules and occupancy
pub mod zone;

// Multi-method anomaly detection
pub mod anomaly;

// Bounded ingest buffer with batch flush and retry
pub mod buffer;

// Persistence sink and registry contracts
pub mod sink;

// NATS transport listener
pub mod transport;

// Pipeline wiring and background tasks
pub mod pipeline;

// Configuration
pub mod config;
