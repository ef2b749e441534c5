// Repository layer for database operations

pub mod evaluation;

pub use evaluation::EvaluationRepository;
