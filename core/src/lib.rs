pub mod config;
pub mod variables;

pub use config::EngineConfig;

pub fn version() -> &'static str {
    "0.1.0"
}
