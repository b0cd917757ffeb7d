// text2trait - structured trait extraction from text
// Library exports

pub mod config;
pub mod dataset;
pub mod errors;
pub mod inference;
pub mod models;
pub mod schema;
pub mod training;
