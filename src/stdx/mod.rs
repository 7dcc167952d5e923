pub mod slots;

pub use slots::{SlotKey, Slots};
