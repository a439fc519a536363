pub mod audit;
pub mod envelope;
pub mod health;
pub mod metrics;
pub mod notification;
pub mod pgrepo;
pub mod pipeline;
pub mod queue;
pub mod repository;
pub mod retry;
pub mod rules;
pub mod validator;
