pub mod serial_actor;

pub use serial_actor::SerialActor;
