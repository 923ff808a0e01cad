pub mod error;
pub mod events;
pub mod frontend;
pub mod health;
pub mod ui;
