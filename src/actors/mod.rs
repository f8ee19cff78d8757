pub mod engine_actor;
pub mod messages;

pub use engine_actor::EngineActorHandle;
