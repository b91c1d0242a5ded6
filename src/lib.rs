pub mod audit_export;
pub mod calibration;
pub mod config;
pub mod engine;
pub mod error;
pub mod feature_loader;
pub mod feature_store;
pub mod games;
pub mod index_composer;
pub mod rating_store;
pub mod sanity_gates;
pub mod shrinkage;
pub mod sos;
pub mod srs;
pub mod stage_stats;
pub mod synthetic;
pub mod team_features;
pub mod zscore;
