pub mod callback;
pub mod order;
