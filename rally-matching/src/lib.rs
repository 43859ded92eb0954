pub mod calendar;
pub mod deck;
pub mod geo;
pub mod models;
pub mod services;

#[cfg(test)]
mod testing;
