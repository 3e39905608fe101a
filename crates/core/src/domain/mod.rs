pub mod cart;
pub mod turn;
