// Domain layer - Pipeline data model and policies

pub mod model;
pub mod rules;
