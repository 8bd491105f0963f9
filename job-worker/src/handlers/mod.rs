mod app;
mod dead_letter;

pub use app::app;
