pub mod plan;
pub mod retry;
pub mod schema;
pub mod turn;
