pub mod health;
pub mod signaling;
