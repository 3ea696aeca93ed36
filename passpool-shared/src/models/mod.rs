pub mod events;
pub mod trip;
